use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use vma_rs::gem::{GemObject, ObjectParams, Tiling};
use vma_rs::gt::Gt;
use vma_rs::gt::engine::EngineClass;
use vma_rs::sync::{Fence, WaitCtx};
use vma_rs::vm::{BindFlags, ExecFlags, GgttView, LockClass, PinFlags, Vma, evict_vm};
use vma_rs::{DeviceConfig, VmaError};

const MB: u64 = 1 << 20;

fn device() -> Arc<Gt> {
    Gt::new(
        DeviceConfig::new()
            .ggtt(16 * MB, 8 * MB)
            .system_memory(256 * MB)
            .local_memory(16 * MB),
    )
    .unwrap()
}

fn object(gt: &Arc<Gt>, size: u64) -> Arc<GemObject> {
    GemObject::new(gt, ObjectParams::new(size)).unwrap()
}

#[test]
fn concurrent_lookups_share_one_entry() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let vm = gt.create_ppgtt();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (obj, vm, barrier) = (obj.clone(), vm.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                Vma::instance(&obj, &vm, &GgttView::Normal).unwrap()
            })
        })
        .collect();
    let vmas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(vmas.iter().all(|v| Arc::ptr_eq(v, &vmas[0])));
    assert_eq!(obj.vma_list().len(), 1);

    // Another view of the same object is another entry.
    let partial = Vma::instance(&obj, gt.ggtt(), &GgttView::Partial { offset: 0, size: 4 }).unwrap();
    let normal = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();
    assert!(!Arc::ptr_eq(&partial, &normal));
    assert_eq!(partial.size(), 4 * 4096);
    assert_eq!(obj.vma_list().len(), 3);
}

#[test]
fn repeated_pins_bind_once() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let vm = gt.create_ppgtt();
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();

    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let offset = vma.offset().unwrap();
    assert_eq!(vm.pte_count(), 16);
    assert!(vma.is_bound(BindFlags::LOCAL));

    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    assert_eq!(vma.offset(), Some(offset));
    assert_eq!(vma.pin_count(), 2);
    assert_eq!(vm.pte_count(), 16);

    vma.unpin();
    vma.unpin();
    assert!(!vma.is_pinned());
    // Unpinning leaves the binding in place.
    assert!(vma.is_bound(BindFlags::LOCAL));
    assert!(obj.was_bound());
}

#[test]
fn pinned_entry_refuses_unbind() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let vm = gt.create_ppgtt();
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();

    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let (node, bound, pages) = (vma.node(), vma.bound_flags(), vma.pages_count());
    assert_eq!(vma.unbind(&ctx), Err(VmaError::Busy));
    assert_eq!(vma.node(), node);
    assert_eq!(vma.bound_flags(), bound);
    assert_eq!(vma.pages_count(), pages);
    assert_eq!(vm.pte_count(), 16);

    vma.unpin();
    vma.unbind(&ctx).unwrap();
    assert!(vma.node().is_none());
    assert!(vma.bound_flags().is_empty());
    assert_eq!(vm.pte_count(), 0);
    assert_eq!(vma.pages_count(), 0);
}

#[test]
fn oversized_mappable_pin_has_no_space() {
    let gt = device();
    let obj = object(&gt, 12 * MB);
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();

    assert_eq!(
        vma.pin(&ctx, 0, 0, PinFlags::GLOBAL | PinFlags::MAPPABLE),
        Err(VmaError::NoSpace)
    );
    assert!(vma.node().is_none());

    // The whole aperture is big enough.
    vma.pin(&ctx, 0, 0, PinFlags::GLOBAL).unwrap();
    assert!(!vma.is_map_and_fenceable());
    vma.unpin();
}

#[test]
fn concurrent_pins_count_both() {
    let gt = device();
    let obj = object(&gt, 256 << 10);
    let vm = gt.create_ppgtt();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let (vma, barrier) = (vma.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                vma.pin(&WaitCtx::uninterruptible(), 0, 0, PinFlags::USER)
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    assert_eq!(vma.pin_count(), 2);
    assert_eq!(vm.bound_ranges().len(), 1);
    vma.unpin();
    vma.unpin();
}

#[test]
fn requests_are_tracked_on_the_entry_and_object() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let vm = gt.create_ppgtt();
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();
    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let engine = gt.engine(EngineClass::Render).unwrap();

    let gate = Fence::new("gate");
    let mut rq = engine.create_request();
    rq.await_fence(Some(&gate));
    vma.move_to_active(&mut rq, ExecFlags::WRITE).unwrap();
    let write = rq.submit_nop();
    assert!(vma.is_active());
    assert!(obj.is_dirty());
    let (excl, _) = obj.resv().fences();
    assert!(Arc::ptr_eq(&excl.unwrap(), &write));

    // Readers are ordered after the writer.
    let mut rq = engine.create_request();
    vma.move_to_active(&mut rq, ExecFlags::empty()).unwrap();
    let read = rq.submit_nop();
    let (_, shared) = obj.resv().fences();
    assert!(shared.iter().any(|f| Arc::ptr_eq(f, &read)));
    assert!(!read.is_signaled());

    gate.signal();
    read.wait(&ctx).unwrap();
    assert!(write.is_signaled());
    assert!(!vma.is_active());
    vma.unpin();
}

#[test]
fn closed_entries_are_reaped_when_the_gt_parks() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let vm = gt.create_ppgtt();
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();
    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.unpin();

    vma.close();
    assert!(vma.is_closed());
    assert_eq!(gt.closed_count(), 1);

    // Looked up again before the GT idled.
    assert!(vma.reopen());
    assert!(!vma.is_closed());
    assert_eq!(gt.closed_count(), 0);
    assert!(vma.node().is_some());

    vma.close();
    gt.wait_for_idle(&ctx).unwrap();
    assert_eq!(gt.closed_count(), 0);
    assert!(vma.node().is_none());
    assert!(obj.vma_list().is_empty());
    assert_eq!(vm.pte_count(), 0);
}

#[test]
fn aperture_access_reaches_the_object() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();
    vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE).unwrap();
    assert!(vma.is_map_and_fenceable());

    let map = vma.pin_iomap(&ctx).unwrap();
    assert_eq!(vma.pin_count(), 2);
    map.write(4000, b"through the aperture").unwrap();
    let mut back = [0u8; 20];
    map.read(4000, &mut back).unwrap();
    assert_eq!(&back, b"through the aperture");
    Vma::unpin_iomap(map);
    assert_eq!(vma.pin_count(), 1);

    let mut direct = [0u8; 20];
    obj.read(&ctx, 4000, &mut direct).unwrap();
    assert_eq!(&direct, b"through the aperture");
    vma.unpin();
}

#[test]
fn tiled_aperture_mapping_takes_a_fence_register() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let ctx = WaitCtx::uninterruptible();
    obj.set_tiling(&ctx, Tiling::X, 4096).unwrap();
    let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();
    vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE).unwrap();

    let map = vma.pin_iomap(&ctx).unwrap();
    let reg = vma.fence_reg().unwrap();
    assert_eq!(gt.fence_regs().setup(reg).map(|s| s.stride), Some(4096));
    assert_eq!(vma.revoke_fence(), Err(VmaError::Busy));
    drop(map);

    vma.revoke_fence().unwrap();
    assert!(vma.fence_reg().is_none());
    vma.unpin();
}

#[test]
fn retiling_unbinds_entries_that_no_longer_fit() {
    let gt = device();
    let obj = object(&gt, 64 << 10);
    let ctx = WaitCtx::uninterruptible();
    let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();
    vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE).unwrap();

    // Rows of 1536 * 8 bytes need more than the 64KiB node.
    assert_eq!(obj.set_tiling(&ctx, Tiling::X, 1536), Err(VmaError::Busy));

    vma.unpin();
    obj.set_tiling(&ctx, Tiling::X, 1536).unwrap();
    assert!(vma.node().is_none());
    assert!(vma.fence_size() > obj.size());

    vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE).unwrap();
    assert!(vma.is_map_and_fenceable());
    assert!(vma.node().unwrap().size >= vma.fence_size());
    vma.unpin();
}

#[test]
fn full_aperture_evicts_idle_entries() {
    let gt = device();
    let ctx = WaitCtx::uninterruptible();
    let objects: Vec<_> = (0..3).map(|_| object(&gt, 6 * MB)).collect();
    let vmas: Vec<_> = objects
        .iter()
        .map(|o| Vma::instance(o, gt.ggtt(), &GgttView::Normal).unwrap())
        .collect();

    vmas[0].ggtt_pin(None, &ctx, 0, PinFlags::NOEVICT).unwrap();
    vmas[1].ggtt_pin(None, &ctx, 0, PinFlags::NOEVICT).unwrap();
    vmas[0].unpin();

    // Only the whole-GGTT sweep can make room.
    vmas[2].ggtt_pin(None, &ctx, 0, PinFlags::NOEVICT).unwrap();
    assert!(vmas[0].node().is_none());
    assert!(vmas[1].node().is_some());
    assert!(vmas[2].is_bound(BindFlags::GLOBAL));

    vmas[1].unpin();
    vmas[2].unpin();
}

/// Keeps `vma` busy until the returned gate is signalled.
fn hold_busy(gt: &Gt, vma: &Vma) -> Arc<Fence> {
    let gate = Fence::new("gate");
    let mut rq = gt.engine(EngineClass::Render).unwrap().create_request();
    rq.await_fence(Some(&gate));
    vma.move_to_active(&mut rq, ExecFlags::empty()).unwrap();
    rq.submit_nop();
    gate
}

#[test]
fn ggtt_sweep_skips_entries_it_cannot_wait_for() {
    let gt = device();
    let ctx = WaitCtx::uninterruptible();
    let busy_obj = object(&gt, 64 << 10);
    let idle_obj = object(&gt, 64 << 10);
    let busy = Vma::instance(&busy_obj, gt.ggtt(), &GgttView::Normal).unwrap();
    let idle = Vma::instance(&idle_obj, gt.ggtt(), &GgttView::Normal).unwrap();
    busy.ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();
    idle.ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();
    let gate = hold_busy(&gt, &busy);
    busy.unpin();
    idle.unpin();

    // The busy entry comes first and times out; the idle one still goes.
    let bounded = WaitCtx::uninterruptible().with_timeout(Duration::from_millis(50));
    let evicted = {
        let mut guard = gt.ggtt().lock(&ctx, LockClass::Global).unwrap();
        evict_vm(&mut guard, None, &bounded).unwrap()
    };
    assert_eq!(evicted, 1);
    assert!(busy.node().is_some());
    assert!(idle.node().is_none());

    gate.signal();
    busy.sync(&ctx).unwrap();
    busy.unbind(&ctx).unwrap();
}

#[test]
fn object_dropped_during_a_ggtt_sweep_is_torn_down_later() {
    let gt = device();
    let ctx = WaitCtx::uninterruptible();
    let baseline = gt.ggtt().bound_ranges().len();
    let obj = object(&gt, 64 << 10);
    let normal = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal).unwrap();
    let partial = Vma::instance(&obj, gt.ggtt(), &GgttView::Partial { offset: 0, size: 4 }).unwrap();
    normal.ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();
    partial.ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();
    let gate = hold_busy(&gt, &normal);
    normal.unpin();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let sweeper = {
        let gt = gt.clone();
        thread::spawn(move || {
            let ctx = WaitCtx::uninterruptible();
            let mut guard = gt.ggtt().lock(&ctx, LockClass::Global).unwrap();
            locked_tx.send(()).unwrap();
            let evicted = evict_vm(&mut guard, None, &ctx);
            drop(guard);
            done_tx.send(evicted).unwrap();
        })
    };

    // The sweep now holds the last object reference.
    locked_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));
    drop((normal, partial, obj));
    gate.signal();

    let evicted = done_rx.recv_timeout(Duration::from_secs(5)).expect("sweep never finished");
    assert_eq!(evicted, Ok(1));
    sweeper.join().unwrap();

    gt.unbound_wq().flush();
    assert_eq!(gt.ggtt().bound_ranges().len(), baseline);
}

#[test]
fn full_aperture_of_pinned_entries_gives_up() {
    let gt = device();
    let ctx = WaitCtx::uninterruptible();
    let objects: Vec<_> = (0..3).map(|_| object(&gt, 6 * MB)).collect();
    let vmas: Vec<_> = objects
        .iter()
        .map(|o| Vma::instance(o, gt.ggtt(), &GgttView::Normal).unwrap())
        .collect();
    vmas[0].ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();
    vmas[1].ggtt_pin(None, &ctx, 0, PinFlags::empty()).unwrap();

    let started = Instant::now();
    assert_eq!(vmas[2].ggtt_pin(None, &ctx, 0, PinFlags::empty()), Err(VmaError::NoSpace));
    assert!(started.elapsed().as_millis() >= 100);
    assert!(vmas[2].node().is_none());

    vmas[0].unpin();
    vmas[1].unpin();
}

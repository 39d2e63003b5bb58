use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vma_rs::gem::{GemObject, Madvise, MoveDesc, ObjectFlags, ObjectKind, ObjectParams, copy_object, move_pages};
use vma_rs::gt::Gt;
use vma_rs::gt::migrate::BlitTarget;
use vma_rs::mm::{RegionId, SgTable};
use vma_rs::sync::{Deps, Fence, Interrupt, WaitCtx};
use vma_rs::vm::CacheLevel;
use vma_rs::vm::{GgttView, PinFlags, Vma};
use vma_rs::{DeviceConfig, FailureModes, VmaError};

const SMEM: RegionId = RegionId(0);
const LMEM: RegionId = RegionId(1);

fn device(modes: FailureModes) -> Arc<Gt> {
    Gt::new(
        DeviceConfig::new()
            .ggtt(16 << 20, 8 << 20)
            .system_memory(64 << 20)
            .local_memory(16 << 20)
            .failure_modes(modes),
    )
    .unwrap()
}

fn fill(obj: &GemObject, seed: u32) -> Vec<u8> {
    let data: Vec<u8> = (0..obj.size() as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8 ^ seed as u8)
        .collect();
    obj.write(&WaitCtx::uninterruptible(), 0, &data).unwrap();
    data
}

fn contents(obj: &GemObject) -> Vec<u8> {
    let mut buf = vec![0; obj.size() as usize];
    obj.read(&WaitCtx::uninterruptible(), 0, &mut buf).unwrap();
    buf
}

#[test]
fn round_trips_survive_every_failure_mode() {
    for (gpu, alloc) in [(false, false), (true, false), (false, true), (true, true)] {
        let gt = device(FailureModes::new(gpu, alloc));
        let ctx = WaitCtx::uninterruptible();
        let obj = GemObject::new(&gt, ObjectParams::new(256 << 10).placements(&[SMEM, LMEM])).unwrap();
        let data = fill(&obj, 0x3c);

        obj.migrate(&ctx, LMEM).unwrap();
        assert!(obj.is_lmem(), "gpu={gpu} alloc={alloc}");
        obj.wait_moving(&ctx).unwrap();
        assert_eq!(contents(&obj), data, "to lmem, gpu={gpu} alloc={alloc}");

        obj.migrate(&ctx, SMEM).unwrap();
        assert!(!obj.is_lmem());
        assert_eq!(contents(&obj), data, "to smem, gpu={gpu} alloc={alloc}");

        let blitter = gt.migrate().unwrap();
        if gpu {
            // Injected failures always blit a clear.
            assert_eq!(blitter.copies(), 0);
            assert_eq!(blitter.clears(), 2);
        } else {
            assert_eq!(blitter.copies(), 2);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn round_trip_preserves_contents(
        pages in 1u64..8,
        seed in any::<u32>(),
        gpu in any::<bool>(),
        alloc in any::<bool>(),
        start_local in any::<bool>(),
    ) {
        let gt = device(FailureModes::new(gpu, alloc));
        let ctx = WaitCtx::uninterruptible();
        let (home, away) = if start_local { (LMEM, SMEM) } else { (SMEM, LMEM) };
        let obj = GemObject::new(&gt, ObjectParams::new(pages * (64 << 10)).placements(&[home, away])).unwrap();
        let data = fill(&obj, seed);

        obj.migrate(&ctx, away).unwrap();
        obj.wait_moving(&ctx).unwrap();
        prop_assert_eq!(obj.region().id(), away);
        obj.migrate(&ctx, home).unwrap();
        obj.wait_moving(&ctx).unwrap();
        prop_assert_eq!(obj.region().id(), home);
        prop_assert!(contents(&obj) == data);
    }
}

#[test]
fn multi_page_local_object_moves_intact() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(&gt, ObjectParams::new(4 * (64 << 10)).placements(&[LMEM, SMEM])).unwrap();
    assert_eq!(obj.size(), 256 << 10);
    let data = fill(&obj, 0x81);
    assert!(obj.cached_io().is_some());

    obj.migrate(&ctx, SMEM).unwrap();
    assert_eq!(obj.region().id(), SMEM);
    assert!(obj.cached_io().is_none());
    assert_eq!(contents(&obj), data);

    obj.migrate(&ctx, LMEM).unwrap();
    assert_eq!(obj.region().id(), LMEM);
    assert_eq!(contents(&obj), data);
}

fn four_page_move(gt: &Gt) -> (MoveDesc, Vec<u8>) {
    let memory = gt.memory();
    let size = 4 * (64 << 10);
    let src = SgTable::from_blocks(memory.system().alloc(size).unwrap());
    let dst = SgTable::from_blocks(memory.local().unwrap().alloc(size).unwrap());
    let data: Vec<u8> = (0..size).map(|i| (i / 4096) as u8 ^ (i % 7) as u8).collect();
    for (page, dma) in src.page_addresses().enumerate() {
        memory.write(dma, &data[page * 4096..(page + 1) * 4096]).unwrap();
    }
    let desc = MoveDesc {
        kind: ObjectKind::Device,
        clear: false,
        src: Some(src),
        src_target: BlitTarget { cache_level: CacheLevel::Llc, lmem: false },
        dst,
        dst_target: BlitTarget { cache_level: CacheLevel::None, lmem: true },
        size,
    };
    (desc, data)
}

fn dst_bytes(gt: &Gt, desc: &MoveDesc) -> Vec<u8> {
    let mut out = vec![0u8; desc.size as usize];
    for (page, dma) in desc.dst.page_addresses().enumerate() {
        gt.memory().read(dma, &mut out[page * 4096..(page + 1) * 4096]).unwrap();
    }
    out
}

#[test]
fn gated_move_into_local_memory_returns_a_fence() {
    for gpu in [false, true] {
        let gt = device(FailureModes::new(gpu, false));
        let ctx = WaitCtx::uninterruptible();
        let (desc, data) = four_page_move(&gt);
        let gate = Fence::new("gate");
        let mut deps = Deps::new();
        deps.add_dependency(Some(&gate), &ctx).unwrap();

        let fence = move_pages(&gt, &desc, true, &deps, &ctx).unwrap().unwrap();
        assert!(!fence.is_signaled());
        gate.signal();
        fence.wait(&ctx).unwrap();
        assert!(fence.error().is_none(), "gpu={gpu}");
        assert_eq!(dst_bytes(&gt, &desc), data, "gpu={gpu}");
    }
}

#[test]
fn blocked_cpu_move_is_interrupted_before_copying() {
    let gt = device(FailureModes::default());
    let (desc, data) = four_page_move(&gt);
    let interrupt = Interrupt::new();
    let ctx = WaitCtx::interruptible(interrupt.clone());
    let never = Fence::new("never");
    let mut deps = Deps::new();
    deps.add_dependency(Some(&Fence::signaled("done")), &ctx).unwrap();
    deps.add_dependency(Some(&never), &ctx).unwrap();
    assert_eq!(deps.len(), 1);

    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        interrupt.raise();
    });
    assert!(matches!(move_pages(&gt, &desc, false, &deps, &ctx), Err(VmaError::Interrupted)));
    raiser.join().unwrap();
    assert_ne!(dst_bytes(&gt, &desc), data);
}

#[test]
fn kernel_objects_are_cleared_by_the_cpu() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(&gt, ObjectParams::new(128 << 10).placements(&[SMEM, LMEM]).kernel()).unwrap();

    obj.migrate(&ctx, LMEM).unwrap();
    assert!(obj.moving_fence().is_none());
    assert_eq!(gt.migrate().unwrap().clears(), 0);
    assert!(contents(&obj).iter().all(|&b| b == 0));
}

#[test]
fn injected_gpu_failure_clear_is_redone_by_the_cpu() {
    let gt = device(FailureModes::new(true, false));
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(&gt, ObjectParams::new(128 << 10).placements(&[SMEM, LMEM])).unwrap();

    obj.migrate(&ctx, LMEM).unwrap();
    obj.wait_moving(&ctx).unwrap();
    assert_eq!(gt.migrate().unwrap().clears(), 1);
    assert!(contents(&obj).iter().all(|&b| b == 0));
}

#[test]
fn cpu_clear_flag_forces_the_clear_into_system_memory() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(
        &gt,
        ObjectParams::new(64 << 10)
            .placements(&[LMEM, SMEM])
            .flags(ObjectFlags::CPU_CLEAR),
    )
    .unwrap();

    obj.migrate(&ctx, SMEM).unwrap();
    obj.wait_moving(&ctx).unwrap();
    assert_eq!(gt.migrate().unwrap().clears(), 1);
    assert!(contents(&obj).iter().all(|&b| b == 0));
}

#[test]
fn blocked_cpu_copy_can_be_interrupted() {
    let gt = device(FailureModes::default());
    let src = GemObject::new(&gt, ObjectParams::new(64 << 10)).unwrap();
    let dst = GemObject::new(&gt, ObjectParams::new(64 << 10)).unwrap();
    let data = fill(&src, 7);

    let never = Fence::new("never");
    dst.resv().add_excl_fence(never.clone());

    let interrupt = Interrupt::new();
    let ctx = WaitCtx::interruptible(interrupt.clone());
    let raiser = {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            interrupt.raise();
        })
    };
    assert_eq!(copy_object(&dst, &src, false, &ctx), Err(VmaError::Interrupted));
    raiser.join().unwrap();

    never.signal();
    interrupt.clear();
    copy_object(&dst, &src, false, &ctx).unwrap();
    assert_eq!(contents(&dst), data);
}

#[test]
fn accelerated_copy_is_published_on_both_objects() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let src = GemObject::new(&gt, ObjectParams::new(64 << 10).placements(&[LMEM])).unwrap();
    let dst = GemObject::new(&gt, ObjectParams::new(64 << 10)).unwrap();
    let data = fill(&src, 0x10);

    copy_object(&dst, &src, true, &ctx).unwrap();
    let (excl, _) = dst.resv().fences();
    let (_, shared) = src.resv().fences();
    let excl = excl.unwrap();
    assert!(shared.iter().any(|f| Arc::ptr_eq(f, &excl)));
    assert_eq!(contents(&dst), data);
}

#[test]
fn migration_unbinds_idle_entries_and_refuses_pinned_ones() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(&gt, ObjectParams::new(64 << 10).placements(&[SMEM, LMEM])).unwrap();
    let data = fill(&obj, 0x55);
    let vm = gt.create_ppgtt();
    let vma = Vma::instance(&obj, &vm, &GgttView::Normal).unwrap();

    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    assert_eq!(obj.migrate(&ctx, LMEM), Err(VmaError::Busy));
    assert!(!obj.is_lmem());

    vma.unpin();
    obj.migrate(&ctx, LMEM).unwrap();
    assert!(vma.node().is_none());

    // Rebinding waits for the move and points at local memory.
    vma.pin(&ctx, 0, 0, PinFlags::USER).unwrap();
    vma.wait_for_bind(&ctx).unwrap();
    let offset = vma.offset().unwrap();
    assert!(vm.pte(offset).unwrap().lmem);
    let mut back = vec![0; data.len()];
    vm.read(offset, &mut back).unwrap();
    assert_eq!(back, data);
    vma.unpin();
}

#[test]
fn purged_objects_lose_their_contents() {
    let gt = device(FailureModes::default());
    let ctx = WaitCtx::uninterruptible();
    let obj = GemObject::new(&gt, ObjectParams::new(64 << 10)).unwrap();
    fill(&obj, 1);

    assert!(!obj.purge(&ctx).unwrap());
    obj.madvise(Madvise::DontNeed);
    assert!(obj.purge(&ctx).unwrap());
    assert_eq!(obj.madv(), Madvise::Purged);
    assert!(!obj.has_backing());
    assert!(obj.read(&ctx, 0, &mut [0; 4]).is_err());
}

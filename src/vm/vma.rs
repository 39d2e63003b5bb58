//! Mapping entries and the per-object registry that keeps them unique.

use crate::error::{VmaError, VmaResult};
use crate::gem::GemObject;
use crate::gt::Gt;
use crate::gt::engine::Request;
use crate::mm::{Node, PageSizes, SgTable};
use crate::sync::{Active, Fence, WaitCtx};
use crate::utils::{GTT_MIN_ALIGNMENT, PAGE_SHIFT, is_aligned, lock, read, write};
use crate::vm::address_space::{AddressSpace, LockClass, VmId, VmKind};
use crate::vm::flags::{BindFlags, PIN_MASK, PinFlags, VmaFlags};
use crate::vm::iomap;
use crate::vm::resource::{GgttOps, PpgttOps, VmaOps, VmaResource};
use crate::vm::view::{self, GgttView};
use bitflags::bitflags;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// The low part of `pages_count` counts page users, the high part bindings.
const PAGES_BIAS: u32 = 24;
const PAGES_ACTIVE: u32 = (1 << PAGES_BIAS) | 1;

bitflags! {
    /// How a request uses an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecFlags: u32 {
        const WRITE = 1 << 0;
        /// The request relies on the entry's fence register.
        const NEEDS_FENCE = 1 << 1;
        /// A shared slot was already reserved on the object.
        const NO_RESERVE = 1 << 2;
    }
}

/// Registry key: address space identity, then view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmaKey {
    pub vm: VmId,
    pub view: GgttView,
}

/// An object's entries, unique per key. GGTT entries sit at the front of
/// the list so walks over them can stop at the first other one.
#[derive(Debug, Default)]
pub struct VmaRegistry {
    tree: BTreeMap<VmaKey, Arc<Vma>>,
    list: VecDeque<Arc<Vma>>,
}

impl VmaRegistry {
    #[must_use]
    pub fn get(&self, key: &VmaKey) -> Option<Arc<Vma>> {
        self.tree.get(key).cloned()
    }

    /// Inserts `vma` unless an entry with its key already exists, and
    /// returns whichever entry ends up registered.
    pub fn insert(&mut self, vma: Arc<Vma>) -> Arc<Vma> {
        let key = vma.key();
        if let Some(existing) = self.tree.get(&key) {
            return existing.clone();
        }
        if vma.is_ggtt() {
            self.list.push_front(vma.clone());
        } else {
            self.list.push_back(vma.clone());
        }
        self.tree.insert(key, vma.clone());
        vma
    }

    pub fn remove(&mut self, vma: &Vma) -> Option<Arc<Vma>> {
        let removed = self.tree.remove(&vma.key())?;
        self.list.retain(|v| !Arc::ptr_eq(v, &removed));
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vma>> {
        self.list.iter()
    }

    /// The GGTT entries, from the front of the list.
    pub fn ggtt(&self) -> impl Iterator<Item = &Arc<Vma>> {
        self.list.iter().take_while(|v| v.is_ggtt())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Vma>> {
        self.tree.clear();
        self.list.drain(..).collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct VmaState {
    pub node: Option<Node>,
    pub pages: Option<Arc<SgTable>>,
    pub page_sizes: PageSizes,
    pub resource: Option<Arc<VmaResource>>,
    pub bind_error: Option<VmaError>,
    /// Fence register held, by index.
    pub fence: Option<usize>,
    pub fence_pins: usize,
    pub iomap: bool,
    pub closed: bool,
}

/// One placement of one object, with one view, in one address space.
pub struct Vma {
    obj: Weak<GemObject>,
    gt: Weak<Gt>,
    pub(crate) vm: Arc<AddressSpace>,
    pub(crate) ops: Arc<dyn VmaOps>,
    view: GgttView,
    size: u64,
    pub(crate) display_alignment: u64,
    fence_size: AtomicU64,
    fence_alignment: AtomicU64,
    /// Pin count in the low bits, `VmaFlags` above.
    flags: AtomicU32,
    pages_count: AtomicU32,
    open_count: AtomicUsize,
    pub(crate) active: Active,
    pub(crate) state: Mutex<VmaState>,
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("vm", &self.vm.id())
            .field("view", &self.view)
            .field("size", &self.size)
            .field("node", &lock(&self.state).node)
            .field("flags", &self.flags())
            .field("pin_count", &self.pin_count())
            .finish_non_exhaustive()
    }
}

impl Vma {
    /// Looks up the entry for `(obj, vm, view)`, creating it on a miss.
    ///
    /// Concurrent callers always get the same entry back: a creator that
    /// loses the race drops its own and returns the winner's.
    ///
    /// # Errors
    /// `TooBig` if the view does not fit the address space, and
    /// `InvalidArgument` for a malformed view or a non-identity view outside
    /// the GGTT. Passing the aliasing address space is a programming error.
    pub fn instance(obj: &Arc<GemObject>, vm: &Arc<AddressSpace>, view: &GgttView) -> VmaResult<Arc<Self>> {
        if vm.kind() == VmKind::AliasingPpgtt {
            debug_assert!(false, "aliasing address space used directly");
            return Err(VmaError::Invariant("aliasing address space used directly"));
        }

        let key = VmaKey {
            vm: vm.id(),
            view: *view,
        };
        if let Some(vma) = read(obj.vmas()).get(&key) {
            return Ok(vma);
        }

        let vma = Arc::new(Self::create(obj, vm, view)?);
        Ok(write(obj.vmas()).insert(vma))
    }

    fn create(obj: &Arc<GemObject>, vm: &Arc<AddressSpace>, view: &GgttView) -> VmaResult<Self> {
        if !view.is_normal() && !vm.is_ggtt() {
            return Err(VmaError::InvalidArgument("views are only supported in the GGTT"));
        }
        view.validate(obj.size() >> PAGE_SHIFT)?;

        let size = view.size(obj.size());
        if size > vm.total() {
            return Err(VmaError::TooBig);
        }

        let mut flags = VmaFlags::empty();
        let (mut fence_size, mut fence_alignment) = (size, GTT_MIN_ALIGNMENT);
        let ops: Arc<dyn VmaOps> = if vm.is_ggtt() {
            if size > u64::from(u32::MAX) {
                return Err(VmaError::TooBig);
            }
            let (tiling, stride) = obj.tiling();
            fence_size = iomap::fence_size(size, tiling, stride)?;
            if fence_size < size || fence_size > vm.total() {
                return Err(VmaError::TooBig);
            }
            fence_alignment = iomap::fence_alignment(tiling);
            flags |= VmaFlags::GGTT;
            Arc::new(GgttOps)
        } else {
            Arc::new(PpgttOps)
        };

        Ok(Self {
            obj: Arc::downgrade(obj),
            gt: Arc::downgrade(obj.gt()),
            vm: vm.clone(),
            ops,
            view: *view,
            size,
            display_alignment: GTT_MIN_ALIGNMENT,
            fence_size: AtomicU64::new(fence_size),
            fence_alignment: AtomicU64::new(fence_alignment),
            flags: AtomicU32::new(flags.bits()),
            pages_count: AtomicU32::new(0),
            open_count: AtomicUsize::new(1),
            active: Active::new(),
            state: Mutex::new(VmaState::default()),
        })
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    #[must_use]
    pub fn key(&self) -> VmaKey {
        VmaKey {
            vm: self.vm.id(),
            view: self.view,
        }
    }

    #[must_use]
    pub fn vm(&self) -> &Arc<AddressSpace> {
        &self.vm
    }

    #[must_use]
    pub const fn view(&self) -> &GgttView {
        &self.view
    }

    /// Bytes the view maps.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// The owning object, unless it is being destroyed.
    pub fn object(&self) -> VmaResult<Arc<GemObject>> {
        self.obj.upgrade().ok_or(VmaError::NotFound)
    }

    pub(crate) fn gt(&self) -> Option<Arc<Gt>> {
        self.gt.upgrade()
    }

    #[must_use]
    pub fn fence_size(&self) -> u64 {
        self.fence_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn fence_alignment(&self) -> u64 {
        self.fence_alignment.load(Ordering::Acquire)
    }

    pub(crate) fn set_fence_params(&self, size: u64, alignment: u64) {
        self.fence_size.store(size, Ordering::Release);
        self.fence_alignment.store(alignment, Ordering::Release);
    }

    #[must_use]
    pub fn flags(&self) -> VmaFlags {
        VmaFlags::from_bits_truncate(self.flags.load(Ordering::Acquire) & !PIN_MASK)
    }

    /// Pin count and state bits as one word.
    pub(crate) fn raw_flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub(crate) fn set_flags(&self, flags: VmaFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags`, reporting whether any of them was set.
    pub(crate) fn clear_flags(&self, flags: VmaFlags) -> bool {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }

    #[must_use]
    pub fn is_ggtt(&self) -> bool {
        self.flags().contains(VmaFlags::GGTT)
    }

    /// Whether any of `flags` is currently bound.
    #[must_use]
    pub fn is_bound(&self, flags: BindFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flags.bits() != 0
    }

    #[must_use]
    pub fn bound_flags(&self) -> BindFlags {
        BindFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.flags.load(Ordering::Acquire) & PIN_MASK
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    #[must_use]
    pub fn is_map_and_fenceable(&self) -> bool {
        self.flags().contains(VmaFlags::CAN_FENCE)
    }

    #[must_use]
    pub fn has_userfault(&self) -> bool {
        self.flags().contains(VmaFlags::USERFAULT)
    }

    #[must_use]
    pub fn node(&self) -> Option<Node> {
        lock(&self.state).node
    }

    /// Start of the placed range.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.node().map(|n| n.start)
    }

    #[must_use]
    pub fn pages(&self) -> Option<Arc<SgTable>> {
        lock(&self.state).pages.clone()
    }

    #[must_use]
    pub fn resource(&self) -> Option<Arc<VmaResource>> {
        lock(&self.state).resource.clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, VmaState> {
        lock(&self.state)
    }

    pub(crate) const fn lock_class(flags: PinFlags) -> LockClass {
        if flags.contains(PinFlags::GLOBAL) {
            LockClass::Global
        } else {
            LockClass::User
        }
    }

    // ===========================================================================================
    // Pinning
    // ===========================================================================================

    /// Takes a pin without any lock if the requested bindings are already
    /// in place. With `VALIDATE` only checks them.
    #[must_use]
    pub fn try_qad_pin(&self, flags: PinFlags) -> bool {
        let want = flags.bind_flags().bits();
        let mut bound = self.flags.load(Ordering::Acquire);
        if flags.contains(PinFlags::VALIDATE) {
            return bound & want == want;
        }

        let refuse = (VmaFlags::OVERFLOW | VmaFlags::ERROR).bits();
        loop {
            if want & !bound != 0 || bound & refuse != 0 {
                return false;
            }
            debug_assert!((bound + 1) & PIN_MASK != 0);
            match self
                .flags
                .compare_exchange_weak(bound, bound + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => bound = current,
            }
        }
    }

    pub(crate) fn add_pin(&self) {
        let prev = self.flags.fetch_add(1, Ordering::AcqRel);
        debug_assert!((prev + 1) & PIN_MASK != 0, "pin count overflow");
    }

    pub fn unpin(&self) {
        let prev = self.flags.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & PIN_MASK != 0, "unpin of an unpinned entry");
    }

    /// Drops every pin at once; only for teardown.
    pub(crate) fn clear_pins(&self) {
        self.flags.fetch_and(!PIN_MASK, Ordering::AcqRel);
    }

    // ===========================================================================================
    // Pages
    // ===========================================================================================

    /// Takes a reference on the entry's page list, building it on first use.
    /// The object's pages stay pinned while any reference is held.
    pub fn get_pages(&self) -> VmaResult<()> {
        if self
            .pages_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
            .is_ok()
        {
            return Ok(());
        }

        let mut state = lock(&self.state);
        if self.pages_count.load(Ordering::Acquire) == 0 {
            let obj = self.object()?;
            let pages = obj.pin_pages()?;
            match view::build_pages(&self.view, &pages) {
                Ok(view_pages) => {
                    state.page_sizes = pages.page_sizes();
                    state.pages = Some(view_pages);
                }
                Err(err) => {
                    obj.unpin_pages();
                    return Err(err);
                }
            }
        }
        self.pages_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn put_pages_locked(&self, state: &mut VmaState, count: u32) {
        let prev = self.pages_count.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count, "pages count underflow");
        if prev == count {
            state.pages = None;
            if let Some(obj) = self.obj.upgrade() {
                obj.unpin_pages();
            }
        }
    }

    pub fn put_pages(&self) {
        if self
            .pages_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 1).then_some(n - 1))
            .is_ok()
        {
            return;
        }
        let mut state = lock(&self.state);
        self.put_pages_locked(&mut state, 1);
    }

    /// Accounts for a new binding holding the pages.
    pub(crate) fn pages_add_binding(&self) {
        self.pages_count.fetch_add(PAGES_ACTIVE, Ordering::AcqRel);
    }

    /// Drops every binding's page reference.
    pub(crate) fn unbind_pages(&self) {
        let count = self.pages_count.load(Ordering::Acquire) >> PAGES_BIAS;
        if count == 0 {
            return;
        }
        let mut state = lock(&self.state);
        self.put_pages_locked(&mut state, count | (count << PAGES_BIAS));
    }

    #[must_use]
    pub fn pages_count(&self) -> u32 {
        self.pages_count.load(Ordering::Acquire)
    }

    // ===========================================================================================
    // Placement checks
    // ===========================================================================================

    /// Whether the current placement violates a pin request.
    #[must_use]
    pub fn is_misplaced(&self, size: u64, alignment: u64, flags: PinFlags) -> bool {
        let Some(node) = self.node() else {
            return false;
        };
        debug_assert!(alignment == 0 || alignment.is_power_of_two());

        if node.size < size {
            return true;
        }
        if alignment > 0 && !is_aligned(node.start, alignment) {
            return true;
        }
        if flags.contains(PinFlags::MAPPABLE) && !self.is_map_and_fenceable() {
            return true;
        }
        if flags.contains(PinFlags::OFFSET_BIAS) && node.start < flags.offset() {
            return true;
        }
        flags.contains(PinFlags::OFFSET_FIXED) && node.start != flags.offset()
    }

    /// Recomputes whether the placement allows CPU aperture access through
    /// a fence register.
    pub(crate) fn set_map_and_fenceable(&self) {
        let Some(node) = self.node() else {
            return;
        };
        let fenceable = node.size >= self.fence_size() && is_aligned(node.start, self.fence_alignment());
        let mappable = node.end() <= self.vm.mappable_end();
        if fenceable && mappable {
            self.set_flags(VmaFlags::CAN_FENCE);
        } else {
            self.clear_flags(VmaFlags::CAN_FENCE);
        }
    }

    // ===========================================================================================
    // Activity
    // ===========================================================================================

    /// Waits for the most recent bind and reports its outcome.
    pub fn wait_for_bind(&self, ctx: &WaitCtx) -> VmaResult<()> {
        if let Some(fence) = self.active.exclusive() {
            fence.wait(ctx)?;
            if let Some(err) = fence.error() {
                return Err(err);
            }
        }
        match lock(&self.state).bind_error.clone() {
            Some(err) if self.flags().contains(VmaFlags::ERROR) => Err(err),
            _ => Ok(()),
        }
    }

    /// Waits for every bind and request still using the entry.
    pub fn sync(&self, ctx: &WaitCtx) -> VmaResult<()> {
        self.active.wait(ctx)
    }

    /// Marks the async bind behind `fence` as this entry's pending bind; a
    /// failure puts the entry in the error state.
    pub(crate) fn track_bind(self: &Arc<Self>, fence: &Arc<Fence>) -> Option<Arc<Fence>> {
        let weak = Arc::downgrade(self);
        fence.add_callback(move |f| {
            if let (Some(vma), Some(err)) = (weak.upgrade(), f.error()) {
                log::debug!("async bind of {:?} failed: {err}", vma.key());
                lock(&vma.state).bind_error = Some(err);
                vma.set_flags(VmaFlags::ERROR);
            }
        });
        self.active.set_exclusive(fence.clone())
    }

    /// Records `rq` as using this entry.
    ///
    /// The request is ordered after the entry's bind and after the object's
    /// conflicting fences, then published on the object's reservation.
    pub fn move_to_active(&self, rq: &mut Request, flags: ExecFlags) -> VmaResult<()> {
        let obj = self.object()?;
        let write = flags.contains(ExecFlags::WRITE);

        let (excl, shared) = obj.resv().fences();
        rq.await_fence(excl.as_ref());
        if write {
            for fence in &shared {
                rq.await_fence(Some(fence));
            }
        }
        rq.await_fence(self.active.exclusive().as_ref());

        let fence = rq.fence().clone();
        if write {
            obj.resv().add_excl_fence(fence.clone());
        } else {
            if !flags.contains(ExecFlags::NO_RESERVE) {
                obj.resv().reserve_shared(1)?;
            }
            obj.resv().add_shared_fence(fence.clone())?;
        }
        obj.mark_gpu_access(write);

        if flags.contains(ExecFlags::NEEDS_FENCE) {
            let reg = lock(&self.state).fence;
            if let (Some(reg), Some(gt)) = (reg, self.gt()) {
                gt.fence_regs().track(reg, fence.clone());
            }
        }
        self.active.add_request(fence);
        Ok(())
    }

    // ===========================================================================================
    // CPU mmap tracking
    // ===========================================================================================

    /// Records that the CPU faulted the entry's aperture range in.
    pub fn set_userfault(&self) {
        let was = self.flags.fetch_or(VmaFlags::USERFAULT.bits(), Ordering::AcqRel);
        if was & VmaFlags::USERFAULT.bits() == 0 {
            if let Some(obj) = self.obj.upgrade() {
                obj.userfault_inc();
            }
        }
    }

    /// Zaps CPU mappings of the aperture range so the next access faults.
    pub fn revoke_mmap(&self) {
        if !self.clear_flags(VmaFlags::USERFAULT) {
            return;
        }
        log::trace!("revoking cpu mmap of {:?}", self.key());
        if let Some(obj) = self.obj.upgrade() {
            obj.userfault_dec();
        }
    }

    // ===========================================================================================
    // Open / close / destruction
    // ===========================================================================================

    pub fn open(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops an open reference. A per-context entry nobody has open is
    /// queued on the GT's closed list and torn down once the GT idles.
    pub fn close(self: &Arc<Self>) {
        if self.is_ggtt() {
            return;
        }
        let prev = self.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced entry close");
        if prev != 1 {
            return;
        }
        lock(&self.state).closed = true;
        if let Some(gt) = self.gt() {
            gt.add_closed(self.clone());
        }
    }

    /// Takes a closed entry back off the closed list. Returns whether it
    /// was closed.
    pub fn reopen(self: &Arc<Self>) -> bool {
        let was_closed = std::mem::take(&mut lock(&self.state).closed);
        if was_closed {
            if let Some(gt) = self.gt() {
                gt.remove_closed(self);
            }
            self.open_count.fetch_add(1, Ordering::AcqRel);
        }
        was_closed
    }

    /// Forcibly unbinds the entry, whatever its pin count. The caller
    /// removes it from its object's registry.
    pub(crate) fn destroy(&self) {
        lock(&self.state).closed = false;
        if self.node().is_none() {
            return;
        }
        let mut vm = self.vm.lock_uninterruptible(LockClass::User);
        self.clear_pins();
        if let Err(err) = self.unbind_locked(&mut vm, &WaitCtx::uninterruptible()) {
            log::warn!("failed to unbind {:?} on release: {err}", self.key());
        }
    }

    /// Destroys closed entries whose object can be locked right now.
    /// Returns the ones that have to wait for the next idle point.
    pub(crate) fn parked(closed: Vec<Arc<Self>>) -> Vec<Arc<Self>> {
        let mut requeue = Vec::new();
        for vma in closed {
            let Ok(obj) = vma.object() else {
                continue;
            };
            let Some(guard) = obj.ww_lock().try_lock() else {
                requeue.push(vma);
                continue;
            };
            if vma.is_closed() {
                log::debug!("reaping closed {:?}", vma.key());
                vma.destroy();
                write(obj.vmas()).remove(&vma);
            }
            drop(guard);
        }
        requeue
    }
}

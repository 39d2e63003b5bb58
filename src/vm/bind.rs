//! Placing an entry in its address space and writing its PTEs.

use crate::error::{VmaError, VmaResult};
use crate::gem::GemObject;
use crate::mm::InsertMode;
use crate::sync::{Fence, FenceWork, WaitCtx, WorkQueue, WwCtx};
use crate::utils::{GTT_PAGE_SIZE_2M, GTT_PAGE_SIZE_4K, GTT_PAGE_SIZE_64K, is_aligned, range_overflows, rounddown_pow_of_two};
use crate::vm::address_space::{PtStash, VmGuard};
use crate::vm::evict;
use crate::vm::flags::{BindFlags, CacheLevel, PinFlags, VmaFlags};
use crate::vm::resource::{ResourceInit, ResourceSlot, VmaResource};
use crate::vm::vma::Vma;
use std::fmt;
use std::sync::Arc;

const ZONE_4G_END: u64 = (1 << 32) - GTT_PAGE_SIZE_4K;

/// A bind deferred to a worker until its dependencies signal.
///
/// The work is prepared before the address space lock is taken. If the
/// bind ends up running synchronously the work is committed empty and its
/// fence completes with `Again`, unobserved.
pub struct VmaWork {
    base: FenceWork,
    stash: PtStash,
    pinned: Option<Arc<GemObject>>,
    job: Option<(Arc<VmaResource>, CacheLevel, BindFlags)>,
}

impl fmt::Debug for VmaWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmaWork")
            .field("fence", self.base.fence())
            .field("stash", &self.stash)
            .field("armed", &self.job.is_some())
            .finish()
    }
}

impl VmaWork {
    pub(crate) fn new(queue: Arc<WorkQueue>, stash: PtStash) -> Self {
        Self {
            base: FenceWork::new("vma-bind", queue),
            stash,
            pinned: None,
            job: None,
        }
    }

    #[must_use]
    pub fn fence(&self) -> &Arc<Fence> {
        self.base.fence()
    }

    pub(crate) fn chain(&mut self, fence: Option<&Arc<Fence>>) {
        self.base.chain(fence);
    }

    /// Keeps the object's pages pinned until the work has run.
    pub(crate) fn pin_object_pages(&mut self, obj: &Arc<GemObject>) -> VmaResult<()> {
        obj.pin_pages()?;
        self.pinned = Some(obj.clone());
        Ok(())
    }

    pub(crate) fn commit(self) {
        let Self {
            mut base,
            mut stash,
            pinned,
            job,
        } = self;

        if let Some((res, cache_level, flags)) = job {
            let fence = base.fence().clone();
            base.enable(move || {
                if let Err(err) = res.bind(Some(&mut stash), cache_level, flags) {
                    log::debug!("deferred bind of {res:?} failed: {err}");
                    fence.set_error(err);
                }
            });
        }
        base.on_release(move || {
            if let Some(obj) = pinned {
                obj.unpin_pages();
            }
        });
        base.commit_queued();
    }
}

impl Vma {
    /// Writes the PTEs for the bind kinds in `flags` that are not bound yet.
    ///
    /// A first bind turns `slot` into the entry's residency descriptor; a
    /// rebind adding a kind reuses the existing one. With `work` and an
    /// address space that binds `flags` asynchronously, the PTE write is
    /// queued behind pending unbinds of the range and the entry's previous
    /// bind. Otherwise it happens here, after the object's pending move.
    pub fn bind(
        self: &Arc<Self>,
        _guard: &mut VmGuard<'_>,
        cache_level: CacheLevel,
        flags: BindFlags,
        mut work: Option<&mut VmaWork>,
        slot: Option<ResourceSlot>,
    ) -> VmaResult<()> {
        let node = self.node().ok_or(VmaError::Invariant("bind of an unplaced entry"))?;
        debug_assert!(self.size() <= node.size);

        if range_overflows(node.start, node.size, self.vm.total()) {
            debug_assert!(false, "node outside its address space");
            return Err(VmaError::NoDevice);
        }
        if flags.is_empty() {
            debug_assert!(false, "bind without bind flags");
            return Err(VmaError::InvalidArgument("no bind flags"));
        }

        let bound = self.bound_flags();
        let bind_flags = flags - bound;
        if bind_flags.is_empty() {
            return Ok(());
        }
        debug_assert!(self.pages_count() > 0, "bind without pages");

        let is_async = work.is_some() && self.vm.bind_async_flags().intersects(bind_flags);
        match work.as_deref_mut() {
            Some(w) if is_async => self.vm.bind_dep_await(&mut w.base, node.start, node.size),
            _ => self.vm.bind_dep_sync(node.start, node.size, &WaitCtx::uninterruptible())?,
        }

        let obj = self.object()?;
        let res = {
            let mut state = self.lock_state();
            match (state.resource.clone(), slot) {
                (Some(res), _) => {
                    debug_assert!(!bound.is_empty(), "descriptor without a binding");
                    res
                }
                (None, None) => return Err(VmaError::Invariant("first bind without a descriptor")),
                (None, Some(slot)) => {
                    let pages = state
                        .pages
                        .clone()
                        .ok_or(VmaError::Invariant("bind without pages"))?;
                    let res = VmaResource::init(
                        slot,
                        ResourceInit {
                            vm: self.vm.clone(),
                            ops: self.ops.clone(),
                            pages,
                            page_sizes: state.page_sizes,
                            read_only: obj.is_readonly(),
                            lmem: obj.is_lmem(),
                            region: Some(obj.region().id()),
                            start: node.start,
                            node_size: node.size,
                            vma_size: self.size(),
                        },
                    );
                    state.resource = Some(res.clone());
                    res
                }
            }
        };

        log::trace!("bind {:?} {bind_flags:?} at 0x{:x}", self.key(), node.start);
        match work {
            Some(w) if is_async => {
                if let Some(prev) = self.track_bind(w.fence()) {
                    w.chain(Some(&prev));
                }
                w.chain(obj.moving_fence().as_ref());
                w.job = Some((res, cache_level, bind_flags));
            }
            w => {
                if let Err(err) = obj.wait_moving(&WaitCtx::uninterruptible()) {
                    self.lock_state().resource = None;
                    return Err(err);
                }
                let stash = w.map(|w| &mut w.stash);
                if let Err(err) = res.bind(stash, cache_level, bind_flags) {
                    if bound.is_empty() {
                        self.lock_state().resource = None;
                    }
                    return Err(err);
                }
            }
        }

        obj.mark_bound();
        self.set_flags(VmaFlags::from_bits_truncate(bind_flags.bits()));
        Ok(())
    }

    /// Finds and claims a range for the entry.
    ///
    /// `size` and `alignment` are lower bounds; the entry's own size, its
    /// display alignment and, for aperture placements, its fence footprint
    /// widen them. Without `NOEVICT`, other entries are evicted when the
    /// address space is full.
    pub fn insert(
        self: &Arc<Self>,
        guard: &mut VmGuard<'_>,
        ww: Option<&mut WwCtx>,
        ctx: &WaitCtx,
        size: u64,
        alignment: u64,
        flags: PinFlags,
    ) -> VmaResult<()> {
        debug_assert!(self.node().is_none(), "entry already placed");
        let obj = self.object()?;

        let mut size = size.max(self.size());
        let mut alignment = alignment.max(self.display_alignment);
        if flags.contains(PinFlags::MAPPABLE) {
            size = size.max(self.fence_size());
            alignment = alignment.max(self.fence_alignment());
        }
        debug_assert!(is_aligned(size, GTT_PAGE_SIZE_4K));
        alignment = alignment.max(self.vm.min_alignment(obj.region().min_page_size()));

        let start = if flags.contains(PinFlags::OFFSET_BIAS) {
            flags.offset()
        } else {
            0
        };
        let mut end = self.vm.total();
        if flags.contains(PinFlags::MAPPABLE) {
            end = end.min(self.vm.mappable_end());
        }
        if flags.contains(PinFlags::ZONE_4G) {
            end = end.min(ZONE_4G_END);
        }

        if size > end {
            log::debug!(
                "attempting to bind an object larger than the aperture: request={size} > {} aperture={end}",
                if flags.contains(PinFlags::MAPPABLE) { "mappable" } else { "total" },
            );
            return Err(VmaError::NoSpace);
        }

        let color = if self.vm.has_cache_coloring() {
            obj.cache_level().color()
        } else {
            0
        };

        let node = if flags.contains(PinFlags::OFFSET_FIXED) {
            let offset = flags.offset();
            if !is_aligned(offset, alignment) || range_overflows(offset, size, end) {
                return Err(VmaError::InvalidArgument("fixed offset misaligned or out of range"));
            }
            match guard.mm.reserve(offset, size, color) {
                Err(VmaError::NoSpace) if !flags.contains(PinFlags::NOEVICT) => {
                    evict::evict_for_node(guard, ww, ctx, offset, size, color, flags)?;
                    guard.mm.reserve(offset, size, color)?
                }
                other => other?,
            }
        } else {
            let page_sizes = self.lock_state().page_sizes;
            if (end - 1) > u64::from(u32::MAX) && page_sizes.sg > GTT_PAGE_SIZE_4K {
                debug_assert!(!self.is_ggtt());
                alignment = alignment.max(rounddown_pow_of_two(page_sizes.sg | GTT_PAGE_SIZE_2M));
                if page_sizes.sg & GTT_PAGE_SIZE_64K != 0 {
                    size = size.next_multiple_of(GTT_PAGE_SIZE_2M);
                }
            }

            let mode = if flags.contains(PinFlags::MAPPABLE) {
                InsertMode::Low
            } else if flags.contains(PinFlags::HIGH) {
                InsertMode::High
            } else {
                InsertMode::Low
            };
            match guard.mm.insert(size, alignment, color, start, end, mode) {
                Err(VmaError::NoSpace) if !flags.intersects(PinFlags::NOEVICT | PinFlags::NOSEARCH) => {
                    evict::evict_something(guard, ww, ctx, size, alignment, color, start, end, flags)?;
                    guard.mm.insert(size, alignment, color, start, end, mode)?
                }
                other => other?,
            }
        };
        debug_assert!(node.start >= start && node.end() <= end);
        debug_assert!(guard.mm.valid_space(node.start));

        self.lock_state().node = Some(node);
        guard.add_tail(self);
        Ok(())
    }

    /// Releases the entry's range. It must already be unbound.
    pub(crate) fn remove_node(&self, guard: &mut VmGuard<'_>) {
        let node = self.lock_state().node.take();
        if let Some(node) = node {
            guard.mm.remove(node.start);
        }
        guard.detach(self);
    }
}

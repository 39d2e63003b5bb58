//! Pinning: making sure an entry is placed and bound, and keeping it so.

use crate::error::{VmaError, VmaResult};
use crate::sync::{WaitCtx, WwCtx, ww_retry};
use crate::vm::address_space::VmGuard;
use crate::vm::bind::VmaWork;
use crate::vm::evict;
use crate::vm::flags::{PIN_MASK, PinFlags, VmaFlags};
use crate::vm::resource::{ResourceSlot, VmaResource};
use crate::vm::vma::Vma;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Passes in a row that evicted nothing before a GGTT pin gives up.
const GGTT_PIN_MAX_IDLE_PASSES: u32 = 8;

impl Vma {
    /// Pins the entry, placing and binding it as `flags` request.
    ///
    /// The object lock is held through `ww`. Allocations happen before the
    /// address space lock is taken; under it, the entry is placed if it is
    /// not yet, then bound for the kinds in `flags` that are missing. Binds
    /// on an address space that runs them asynchronously are queued behind
    /// the object's pending move. With `VALIDATE`, no pin is kept.
    pub fn pin_ww(self: &Arc<Self>, ww: &mut WwCtx, ctx: &WaitCtx, size: u64, alignment: u64, flags: PinFlags) -> VmaResult<()> {
        debug_assert!(flags.intersects(PinFlags::USER | PinFlags::GLOBAL));

        if self.try_qad_pin(flags) {
            return Ok(());
        }

        self.get_pages()?;
        let result = self.pin_slow(ww, ctx, size, alignment, flags);
        self.put_pages();
        result
    }

    fn pin_slow(self: &Arc<Self>, ww: &mut WwCtx, ctx: &WaitCtx, size: u64, alignment: u64, flags: PinFlags) -> VmaResult<()> {
        let obj = self.object()?;
        let _wakeref = flags.contains(PinFlags::GLOBAL).then(|| self.vm.rpm().get());

        let moving = obj.moving_fence();
        let mut work = None;
        if flags.bind_flags().intersects(self.vm.bind_async_flags()) || moving.is_some() {
            let mut w = VmaWork::new(obj.gt().unbound_wq().clone(), self.vm.alloc_pt_stash(self.size()));
            w.chain(moving.as_ref());
            w.pin_object_pages(&obj)?;
            work = Some(w);
        }
        let slot = VmaResource::alloc();

        let result = self
            .vm
            .lock(ctx, Self::lock_class(flags))
            .and_then(|mut guard| self.pin_locked(&mut guard, ww, ctx, size, alignment, flags, work.as_mut(), slot));

        if let Some(work) = work {
            work.commit();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn pin_locked(
        self: &Arc<Self>,
        guard: &mut VmGuard<'_>,
        ww: &mut WwCtx,
        ctx: &WaitCtx,
        size: u64,
        alignment: u64,
        flags: PinFlags,
        work: Option<&mut VmaWork>,
        slot: ResourceSlot,
    ) -> VmaResult<()> {
        if self.is_closed() {
            return Err(VmaError::Closed);
        }
        let bound = self.raw_flags();
        if bound & VmaFlags::ERROR.bits() != 0 {
            return Err(VmaError::OutOfMemory);
        }
        if (bound + 1) & PIN_MASK == 0 {
            return Err(VmaError::Again);
        }
        if flags.bind_flags().bits() & !bound == 0 {
            if !flags.contains(PinFlags::VALIDATE) {
                self.add_pin();
            }
            return Ok(());
        }

        self.active.acquire();
        let result = self.place_and_bind(guard, ww, ctx, size, alignment, flags, bound, work, slot);
        if result.is_err() && self.bound_flags().is_empty() && self.node().is_some() {
            self.remove_node(guard);
        }
        self.active.release();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn place_and_bind(
        self: &Arc<Self>,
        guard: &mut VmGuard<'_>,
        ww: &mut WwCtx,
        ctx: &WaitCtx,
        size: u64,
        alignment: u64,
        flags: PinFlags,
        bound: u32,
        work: Option<&mut VmaWork>,
        slot: ResourceSlot,
    ) -> VmaResult<()> {
        if bound & VmaFlags::BIND_MASK.bits() == 0 {
            self.insert(guard, Some(ww), ctx, size, alignment, flags)?;
            if self.vm.is_ggtt() {
                self.set_map_and_fenceable();
            }
        }

        let obj = self.object()?;
        self.bind(guard, obj.cache_level(), flags.bind_flags(), work, Some(slot))?;

        self.pages_add_binding();
        guard.add_tail(self);
        if !flags.contains(PinFlags::VALIDATE) {
            self.add_pin();
        }
        debug_assert!(!self.is_misplaced(size, alignment, flags));
        Ok(())
    }

    /// Pins under a fresh acquire context, locking the object first.
    pub fn pin(self: &Arc<Self>, ctx: &WaitCtx, size: u64, alignment: u64, flags: PinFlags) -> VmaResult<()> {
        let obj = self.object()?;
        ww_retry(ctx, |ww| {
            obj.lock(ww, ctx)?;
            self.pin_ww(ww, ctx, size, alignment, flags)
        })
    }

    fn ggtt_pin_once(self: &Arc<Self>, ww: Option<&mut WwCtx>, ctx: &WaitCtx, alignment: u64, flags: PinFlags) -> VmaResult<()> {
        let flags = flags | PinFlags::GLOBAL;
        match ww {
            Some(ww) => self.pin_ww(ww, ctx, 0, alignment, flags),
            None => {
                let obj = self.object()?;
                ww_retry(ctx, |ww| {
                    obj.lock(ww, ctx)?;
                    self.pin_ww(ww, ctx, 0, alignment, flags)
                })
            }
        }
    }

    /// Pins a GGTT entry, evicting the whole GGTT when it is full.
    ///
    /// On `NoSpace` the GT is idled, which also reaps closed entries, and
    /// every unpinned entry of the GGTT is evicted before retrying. Passes
    /// that evict nothing back off exponentially; after a bounded number of
    /// them in a row the pin fails with `NoSpace`. Returns once the bind has
    /// completed.
    pub fn ggtt_pin(self: &Arc<Self>, mut ww: Option<&mut WwCtx>, ctx: &WaitCtx, alignment: u64, flags: PinFlags) -> VmaResult<()> {
        if !self.is_ggtt() {
            debug_assert!(false, "ggtt_pin on a per-context entry");
            return Err(VmaError::InvalidArgument("not a GGTT entry"));
        }
        let gt = self.gt().ok_or(VmaError::NoDevice)?;

        let mut idle_passes = 0;
        loop {
            ctx.check()?;
            match self.ggtt_pin_once(ww.as_deref_mut(), ctx, alignment, flags) {
                Ok(()) => {
                    if let Err(err) = self.wait_for_bind(ctx) {
                        self.unpin();
                        return Err(err);
                    }
                    return Ok(());
                }
                Err(VmaError::NoSpace) => {}
                Err(err) => return Err(err),
            }

            gt.flush_idle_contexts(ctx)?;
            let evicted = {
                let mut guard = self.vm.lock(ctx, Self::lock_class(PinFlags::GLOBAL))?;
                evict::evict_vm(&mut guard, None, ctx)?
            };
            log::debug!("ggtt full, evicted {evicted} entries");

            if evicted > 0 {
                idle_passes = 0;
                continue;
            }
            if idle_passes == GGTT_PIN_MAX_IDLE_PASSES {
                return Err(VmaError::NoSpace);
            }
            thread::sleep(Duration::from_millis(1 << idle_passes));
            idle_passes += 1;
        }
    }
}

//! Taking entries out of their address space.

use crate::error::{VmaError, VmaResult};
use crate::gt::pm::Wakeref;
use crate::sync::{Fence, WaitCtx};
use crate::vm::address_space::{LockClass, VmGuard};
use crate::vm::flags::{BindFlags, VmaFlags};
use crate::vm::vma::Vma;
use std::sync::Arc;

impl Vma {
    fn refuse_pinned(&self) -> VmaResult<()> {
        if self.is_pinned() {
            log::debug!("{:?} is pinned, not unbinding", self.key());
            return Err(VmaError::Busy);
        }
        Ok(())
    }

    /// Unbinds and unplaces the entry. The caller holds the address space
    /// lock.
    ///
    /// Waits for every use of the entry first. Fails with `Busy`, leaving
    /// the entry untouched, while it is pinned.
    pub fn unbind_locked(&self, guard: &mut VmGuard<'_>, ctx: &WaitCtx) -> VmaResult<()> {
        if self.node().is_none() {
            return Ok(());
        }
        self.refuse_pinned()?;
        self.sync(ctx)?;
        debug_assert!(!self.is_active());

        self.evict(guard, false)?;
        self.remove_node(guard);
        Ok(())
    }

    /// Drops the entry's bindings.
    ///
    /// For a synchronous eviction the PTEs are gone when this returns.
    /// Otherwise the returned fence signals once they are; the pages stay
    /// referenced by the residency descriptor until then.
    pub(crate) fn evict(&self, guard: &mut VmGuard<'_>, is_async: bool) -> VmaResult<Option<Arc<Fence>>> {
        debug_assert!(!self.is_pinned());

        if self.is_map_and_fenceable() {
            // Force a fault on the next CPU access, for domain tracking.
            self.revoke_mmap();
            self.flush_writes();
            self.revoke_fence()?;
            self.clear_flags(VmaFlags::CAN_FENCE);
        }

        let res = {
            let mut state = self.lock_state();
            state.iomap = false;
            state.bind_error = None;
            state.resource.take()
        };
        debug_assert!(self.fence_reg().is_none());
        debug_assert!(!self.has_userfault());

        let fence = res.map(|res| {
            if self.is_bound(BindFlags::GLOBAL) && self.vm.is_open() {
                res.hold_wakeref();
            }
            res.unbind()
        });
        self.clear_flags(VmaFlags::BIND_MASK | VmaFlags::ERROR | VmaFlags::GGTT_WRITE);
        guard.detach(self);

        let fence = match fence {
            Some(fence) if !is_async => {
                fence.wait_uninterruptible();
                None
            }
            other => other,
        };
        self.unbind_pages();
        Ok(fence)
    }

    fn unbind_async_locked(&self, guard: &mut VmGuard<'_>) -> VmaResult<Option<Arc<Fence>>> {
        if self.node().is_none() {
            return Ok(None);
        }
        self.refuse_pinned()?;

        let obj = self.object()?;
        let res = self.resource();
        let same_pages = match (&res, obj.pages()) {
            (Some(res), Some(pages)) => Arc::ptr_eq(res.pages(), &pages),
            (None, _) => true,
            (Some(_), None) => false,
        };
        if !same_pages {
            return Err(VmaError::Busy);
        }

        // Promised but not yet submitted work has to finish first as well.
        if let Some(res) = &res {
            res.await_fences(self.active.fences());
        }
        let fence = self.evict(guard, true)?;
        self.remove_node(guard);
        Ok(fence)
    }

    fn unbind_wakeref(&self) -> (Option<Wakeref>, LockClass) {
        if self.is_bound(BindFlags::GLOBAL) {
            (Some(self.vm.rpm().get()), LockClass::Global)
        } else {
            (None, LockClass::User)
        }
    }

    /// Waits for the entry to idle, then unbinds it.
    pub fn unbind(&self, ctx: &WaitCtx) -> VmaResult<()> {
        // Optimistic wait before taking the lock.
        self.sync(ctx)?;
        if self.node().is_none() {
            return Ok(());
        }
        self.refuse_pinned()?;

        let (_wakeref, class) = self.unbind_wakeref();
        let mut guard = self.vm.lock(ctx, class)?;
        self.unbind_locked(&mut guard, ctx)
    }

    /// Unbinds without waiting for the GPU.
    ///
    /// The unbind completes on a worker once the entry's activity is done;
    /// its fence is published as a shared fence on the object's
    /// reservation. The caller holds the object lock. Refuses with `Busy`
    /// when the object has no pages the unbind could keep alive, when no
    /// reservation slot is available, or, with `trylock_vm`, when the
    /// address space lock is contended.
    pub fn unbind_async(&self, ctx: &WaitCtx, trylock_vm: bool) -> VmaResult<()> {
        if self.node().is_none() {
            return Ok(());
        }
        self.refuse_pinned()?;

        let obj = self.object()?;
        if obj.pages().is_none() {
            return Err(VmaError::Busy);
        }
        obj.resv().reserve_shared(2).map_err(|_| VmaError::Busy)?;

        let (_wakeref, class) = self.unbind_wakeref();
        let mut guard = if trylock_vm {
            self.vm.try_lock(class).ok_or(VmaError::Busy)?
        } else {
            self.vm.lock(ctx, class)?
        };
        let fence = self.unbind_async_locked(&mut guard)?;
        drop(guard);

        if let Some(fence) = fence {
            obj.resv().add_shared_fence(fence)?;
        }
        Ok(())
    }
}

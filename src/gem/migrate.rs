//! Moving object contents between memory regions.
//!
//! A move tries the blitter first. When the blit cannot be trusted, because
//! the destination is local memory or failure injection is active, a
//! [`MemcpyWork`] watches its fence and redoes the move with the CPU if the
//! blit failed. Without a usable blitter the move is done synchronously by
//! the CPU once all dependencies have signalled.

use super::memcpy::{ArmOutcome, MemcpyArg, MemcpyWork};
use super::object::{GemObject, Madvise, ObjectFlags, ObjectKind, UnbindFlags};
use crate::error::{VmaError, VmaResult};
use crate::gt::Gt;
use crate::gt::migrate::BlitTarget;
use crate::mm::{MemoryRegion, RegionId, SgTable};
use crate::sync::{Deps, Fence, WaitCtx, ww_retry};
use crate::utils::GTT_PAGE_SIZE_4K;
use std::sync::Arc;

/// One move as the copy engines see it.
#[derive(Debug)]
pub struct MoveDesc {
    pub kind: ObjectKind,
    /// No source data worth keeping; zero the destination.
    pub clear: bool,
    pub src: Option<Arc<SgTable>>,
    pub src_target: BlitTarget,
    pub dst: Arc<SgTable>,
    pub dst_target: BlitTarget,
    pub size: u64,
}

impl MoveDesc {
    fn memcpy_arg(&self, gt: &Gt) -> MemcpyArg {
        MemcpyArg {
            memory: gt.memory().clone(),
            clear: self.clear,
            num_pages: usize::try_from(self.size / GTT_PAGE_SIZE_4K).unwrap_or(usize::MAX),
            src: self.src.clone(),
            dst: self.dst.clone(),
        }
    }
}

fn accel_move(gt: &Gt, desc: &MoveDesc, deps: &Deps) -> VmaResult<Arc<Fence>> {
    let migrate = gt.migrate().ok_or(VmaError::NoDevice)?;
    if gt.is_wedged() {
        return Err(VmaError::NoDevice);
    }
    let fail_gpu = gt.config().failure_modes.fail_gpu_migration;
    let _wakeref = migrate.engine().pm().get();

    // Failure injection always clears, so the result is wrong unless the
    // CPU fallback fixes it up.
    let clear = desc.clear || fail_gpu;
    if clear {
        if desc.kind == ObjectKind::Kernel && !fail_gpu {
            return Err(VmaError::InvalidArgument("kernel objects are not cleared by the gpu"));
        }
        migrate.clear(deps, &desc.dst, desc.dst_target, 0).into_fence()
    } else {
        let src = desc
            .src
            .as_ref()
            .ok_or(VmaError::Invariant("copy without source pages"))?;
        migrate
            .copy(deps, src, desc.src_target, &desc.dst, desc.dst_target)
            .into_fence()
    }
}

/// Runs a move, choosing between the blitter and the CPU.
///
/// Returns the fence of an outstanding move, or `None` once the data is in
/// place.
///
/// # Errors
/// Interruptions while waiting on `deps`, and CPU copy failures.
pub fn move_pages(gt: &Gt, desc: &MoveDesc, allow_accel: bool, deps: &Deps, ctx: &WaitCtx) -> VmaResult<Option<Arc<Fence>>> {
    let modes = gt.config().failure_modes;

    let accel = if allow_accel {
        Some(accel_move(gt, desc, deps))
    } else {
        None
    };

    let arg = match accel {
        Some(Ok(fence)) => {
            // System pages come back valid from the allocator whatever the
            // blit did, so only local memory needs checking.
            if !desc.dst_target.lmem && !modes.any() {
                return Ok(Some(fence));
            }
            match MemcpyWork::alloc(gt, desc.memcpy_arg(gt)) {
                Ok(work) => match work.arm(&fence) {
                    ArmOutcome::Armed(fence) => return Ok(Some(fence)),
                    ArmOutcome::Done => return Ok(None),
                    ArmOutcome::Failed(arg) => arg,
                },
                Err(arg) => {
                    fence.wait_uninterruptible();
                    if !modes.fail_gpu_migration && fence.error().is_none() {
                        return Ok(None);
                    }
                    arg
                }
            }
        }
        Some(Err(err @ (VmaError::Interrupted | VmaError::Again | VmaError::Deadlock))) => return Err(err),
        Some(Err(err)) => {
            log::debug!("accelerated move unavailable: {err}");
            deps.sync(ctx)?;
            desc.memcpy_arg(gt)
        }
        None => {
            deps.sync(ctx)?;
            desc.memcpy_arg(gt)
        }
    };

    arg.run()?;
    Ok(None)
}

impl GemObject {
    fn blit_target(&self, region: &MemoryRegion) -> BlitTarget {
        let caching = self.lock_mm().caching;
        BlitTarget {
            cache_level: self.cache_level_for(region, caching),
            lmem: region.is_local(),
        }
    }

    /// Moves the backing store into `dst`. The object lock is held.
    ///
    /// Every binding is dropped first. An object its owner no longer needs
    /// is purged instead of moved.
    pub fn move_locked(self: &Arc<Self>, ctx: &WaitCtx, dst: &Arc<MemoryRegion>, evict: bool) -> VmaResult<()> {
        self.unbind(UnbindFlags::ACTIVE | UnbindFlags::ASYNC, ctx)?;
        self.put_pages()?;

        let (src, resident) = {
            let mut mm = self.lock_mm();
            if mm.madv != Madvise::WillNeed {
                Self::purge_locked(&mut mm);
                return Ok(());
            }
            (mm.backing.clone(), mm.resident.clone())
        };

        let dst_pages = SgTable::from_blocks(dst.alloc(self.size())?);
        let clear = src.is_none();
        log::debug!(
            "{} {} bytes {} -> {}{}",
            if evict { "evicting" } else { "moving" },
            self.size(),
            resident.name(),
            dst.name(),
            if clear { " (clear)" } else { "" },
        );

        // Fresh system pages are already zero.
        let skip = clear && dst.uses_tt() && !self.flags().contains(ObjectFlags::CPU_CLEAR);
        let fence = if skip {
            None
        } else {
            let mut deps = Deps::new();
            deps.add_dependency(self.moving_fence().as_ref(), ctx)?;
            deps.add_resv(self.resv(), ctx)?;
            let desc = MoveDesc {
                kind: self.kind(),
                clear,
                src_target: self.blit_target(&resident),
                src,
                dst_target: self.blit_target(dst),
                dst: dst_pages.clone(),
                size: self.size(),
            };
            move_pages(self.gt(), &desc, true, &deps, ctx)?
        };

        if let Some(fence) = &fence {
            self.resv().add_excl_fence(fence.clone());
        }
        let mut mm = self.lock_mm();
        mm.moving = fence;
        mm.backing = Some(dst_pages.clone());
        mm.resident = dst.clone();
        mm.cached_io = dst.is_local().then_some(dst_pages);
        mm.adjust_domains();
        self.adjust_after_move(&mut mm);
        mm.adjust_lru();
        Ok(())
    }

    /// Moves the object into one of its allowed regions.
    ///
    /// # Errors
    /// `InvalidArgument` if `region` is not an allowed placement, `Busy` if
    /// a binding is pinned, and whatever the move itself reports.
    pub fn migrate(self: &Arc<Self>, ctx: &WaitCtx, region: RegionId) -> VmaResult<()> {
        let dst = self
            .gt()
            .memory()
            .region(region)
            .cloned()
            .ok_or(VmaError::InvalidArgument("unknown region"))?;
        if !self.placements().contains(&region) {
            return Err(VmaError::InvalidArgument("region is not an allowed placement"));
        }

        ww_retry(ctx, |ww| {
            self.lock(ww, ctx)?;
            if self.resident_region().id() == region {
                let mut mm = self.lock_mm();
                mm.region = dst.clone();
                self.adjust_after_move(&mut mm);
                return Ok(());
            }
            self.move_locked(ctx, &dst, false)
        })
    }

    /// Pushes the backing store out to system memory.
    pub fn evict(self: &Arc<Self>, ctx: &WaitCtx) -> VmaResult<()> {
        let system = self.gt().memory().system().clone();
        ww_retry(ctx, |ww| {
            self.lock(ww, ctx)?;
            if self.resident_region().id() == system.id() && self.has_backing() {
                return Ok(());
            }
            self.move_locked(ctx, &system, true)
        })
    }

    /// Discards the contents of an object its owner marked as not needed.
    /// Returns whether the object was purged.
    pub fn purge(self: &Arc<Self>, ctx: &WaitCtx) -> VmaResult<bool> {
        ww_retry(ctx, |ww| {
            self.lock(ww, ctx)?;
            if self.madv() != Madvise::DontNeed {
                return Ok(false);
            }
            self.unbind(UnbindFlags::ACTIVE, ctx)?;
            self.put_pages()?;
            Self::purge_locked(&mut self.lock_mm());
            Ok(true)
        })
    }
}

/// Copies the contents of `src` into `dst`.
///
/// The copy waits for every user of `dst` and for writers of `src`. An
/// asynchronous copy is published as the writer of `dst` and a reader of
/// `src`.
///
/// # Errors
/// `InvalidArgument` when the sizes differ.
pub fn copy_object(dst: &Arc<GemObject>, src: &Arc<GemObject>, allow_accel: bool, ctx: &WaitCtx) -> VmaResult<()> {
    if dst.size() != src.size() {
        return Err(VmaError::InvalidArgument("copy between objects of different size"));
    }
    ww_retry(ctx, |ww| {
        dst.lock(ww, ctx)?;
        src.lock(ww, ctx)?;
        copy_locked(dst, src, allow_accel, ctx)
    })
}

fn copy_locked(dst: &Arc<GemObject>, src: &Arc<GemObject>, allow_accel: bool, ctx: &WaitCtx) -> VmaResult<()> {
    let (src_pages, src_region) = {
        let mut mm = src.lock_mm();
        (src.populate_locked(&mut mm)?, mm.resident.clone())
    };
    let (dst_pages, dst_region) = {
        let mut mm = dst.lock_mm();
        (dst.populate_locked(&mut mm)?, mm.resident.clone())
    };

    src.resv().reserve_shared(1)?;
    let mut deps = Deps::new();
    deps.add_resv(dst.resv(), ctx)?;
    deps.add_dependency(dst.moving_fence().as_ref(), ctx)?;
    deps.add_dependency(src.resv().fences().0.as_ref(), ctx)?;
    deps.add_dependency(src.moving_fence().as_ref(), ctx)?;

    let desc = MoveDesc {
        kind: dst.kind(),
        clear: false,
        src: Some(src_pages),
        src_target: src.blit_target(&src_region),
        dst: dst_pages,
        dst_target: dst.blit_target(&dst_region),
        size: dst.size(),
    };
    let fence = move_pages(dst.gt(), &desc, allow_accel, &deps, ctx)?;

    dst.lock_mm().dirty = true;
    if let Some(fence) = fence {
        dst.resv().add_excl_fence(fence.clone());
        src.resv().add_shared_fence(fence)?;
    }
    Ok(())
}

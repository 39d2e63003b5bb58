//! The blitter context used for accelerated migration.

use crate::error::{VmaError, VmaResult};
use crate::gt::engine::Engine;
use crate::mm::{Memory, SgTable};
use crate::mm::sgt::SCRATCH_DMA;
use crate::sync::{Deps, Fence};
use crate::utils::GTT_PAGE_SIZE_4K;
use crate::vm::CacheLevel;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// How one side of a blit is mapped for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitTarget {
    pub cache_level: CacheLevel,
    pub lmem: bool,
}

/// Result of a submission. A request may exist even when emitting the
/// commands failed; the caller must wait for it before moving on.
#[derive(Debug)]
pub struct Submission {
    pub rq: Option<Arc<Fence>>,
    pub result: VmaResult<()>,
}

impl Submission {
    /// The request fence of a fully successful submission.
    pub fn into_fence(self) -> VmaResult<Arc<Fence>> {
        match self.result {
            Ok(()) => self.rq.ok_or(VmaError::Invariant("submission without a request")),
            Err(err) => {
                if let Some(rq) = self.rq {
                    rq.wait_uninterruptible();
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug)]
pub struct MigrateContext {
    engine: Arc<Engine>,
    memory: Arc<Memory>,
    clears: AtomicU64,
    copies: AtomicU64,
}

impl MigrateContext {
    pub(crate) fn new(engine: Arc<Engine>, memory: Arc<Memory>) -> Self {
        Self {
            engine,
            memory,
            clears: AtomicU64::new(0),
            copies: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Clear blits submitted so far.
    #[must_use]
    pub fn clears(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn copies(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    /// Fills every page of `dst` with `value` once `deps` have signalled.
    pub fn clear(&self, deps: &Deps, dst: &Arc<SgTable>, dst_target: BlitTarget, value: u8) -> Submission {
        let mut rq = self.engine.create_request();
        for fence in deps.fences() {
            rq.await_fence(Some(fence));
        }

        self.clears.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{}: clear {} pages ({:?}, lmem={})",
            self.engine.name(),
            dst.num_pages(),
            dst_target.cache_level,
            dst_target.lmem
        );

        let memory = self.memory.clone();
        let dst = dst.clone();
        let fence = rq.submit(move || {
            for page in dst.page_addresses().filter(|&a| a != SCRATCH_DMA) {
                memory.fill(page, GTT_PAGE_SIZE_4K as usize, value)?;
            }
            Ok(())
        });

        Submission {
            rq: Some(fence),
            result: Ok(()),
        }
    }

    /// Copies `src` into `dst` page by page once `deps` have signalled.
    pub fn copy(
        &self,
        deps: &Deps,
        src: &Arc<SgTable>,
        src_target: BlitTarget,
        dst: &Arc<SgTable>,
        dst_target: BlitTarget,
    ) -> Submission {
        let mut rq = self.engine.create_request();
        for fence in deps.fences() {
            rq.await_fence(Some(fence));
        }

        if src.len_bytes() != dst.len_bytes() {
            // The request was already started; it has to retire.
            let fence = rq.submit(|| Err(VmaError::InvalidArgument("blit size mismatch")));
            return Submission {
                rq: Some(fence),
                result: Err(VmaError::InvalidArgument("blit size mismatch")),
            };
        }

        self.copies.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "{}: copy {} pages (lmem {} -> {})",
            self.engine.name(),
            dst.num_pages(),
            src_target.lmem,
            dst_target.lmem
        );

        let memory = self.memory.clone();
        let (src, dst) = (src.clone(), dst.clone());
        let fence = rq.submit(move || {
            for (from, to) in src.page_addresses().zip(dst.page_addresses()) {
                if from == SCRATCH_DMA || to == SCRATCH_DMA {
                    continue;
                }
                memory.copy(from, to, GTT_PAGE_SIZE_4K as usize)?;
            }
            Ok(())
        });

        Submission {
            rq: Some(fence),
            result: Ok(()),
        }
    }
}

//! CPU fallback for migrations, and the work item that intercepts a failed
//! GPU migration to redo it with the CPU.

use crate::error::{VmaError, VmaResult};
use crate::gt::Gt;
use crate::mm::{Memory, SgTable};
use crate::sync::{Fence, WorkQueue};
use crate::utils::{GTT_PAGE_SIZE_4K, lock};
use std::sync::{Arc, Mutex};

const CHUNK: usize = GTT_PAGE_SIZE_4K as usize;

/// What a CPU move has to do.
#[derive(Debug)]
pub struct MemcpyArg {
    pub memory: Arc<Memory>,
    /// Zero `dst` instead of copying.
    pub clear: bool,
    pub num_pages: usize,
    pub src: Option<Arc<SgTable>>,
    pub dst: Arc<SgTable>,
}

impl MemcpyArg {
    /// Copies or clears every page of the destination.
    pub fn run(&self) -> VmaResult<()> {
        let src = if self.clear { None } else { self.src.as_ref() };
        for page in 0..self.num_pages {
            let to = self
                .dst
                .dma_address(page)
                .ok_or(VmaError::Invariant("destination shorter than the move"))?;
            match src {
                Some(src) => {
                    let from = src
                        .dma_address(page)
                        .ok_or(VmaError::Invariant("source shorter than the move"))?;
                    self.memory.copy(from, to, CHUNK)?;
                }
                None => self.memory.fill(to, CHUNK, 0)?,
            }
        }
        log::trace!("cpu {} of {} pages", if src.is_some() { "copy" } else { "clear" }, self.num_pages);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyState {
    /// Waiting on the GPU migration.
    Armed,
    /// The GPU migration failed; a CPU move is queued.
    Intercepted,
    Running,
    Complete,
}

/// Outcome of [`MemcpyWork::arm`].
#[derive(Debug)]
pub enum ArmOutcome {
    /// The migration is covered by the returned fence.
    Armed(Arc<Fence>),
    /// The GPU migration had already completed successfully.
    Done,
    /// The GPU migration had already failed; the caller moves with the CPU.
    Failed(MemcpyArg),
}

/// Watches a GPU migration and redoes it with the CPU if it fails.
///
/// The work's own fence replaces the migration fence. It signals once the
/// data is in place: right after the GPU migration on success, or after the
/// CPU move otherwise.
#[derive(Debug)]
pub struct MemcpyWork {
    fence: Arc<Fence>,
    state: Mutex<MemcpyState>,
    arg: Mutex<Option<MemcpyArg>>,
    fail_gpu: bool,
    unbound_wq: Arc<WorkQueue>,
    highpri_wq: Arc<WorkQueue>,
}

impl MemcpyWork {
    /// Allocates the work item.
    ///
    /// # Errors
    /// Gives `arg` back when the allocation fails.
    pub fn alloc(gt: &Gt, arg: MemcpyArg) -> Result<Arc<Self>, MemcpyArg> {
        let modes = gt.config().failure_modes;
        if modes.fail_work_allocation {
            return Err(arg);
        }
        Ok(Arc::new(Self {
            fence: Fence::new("memcpy"),
            state: Mutex::new(MemcpyState::Armed),
            arg: Mutex::new(Some(arg)),
            fail_gpu: modes.fail_gpu_migration,
            unbound_wq: gt.unbound_wq().clone(),
            highpri_wq: gt.highpri_wq().clone(),
        }))
    }

    #[must_use]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    #[must_use]
    pub fn state(&self) -> MemcpyState {
        *lock(&self.state)
    }

    /// Hooks the work onto the GPU migration fence `dep`.
    pub fn arm(self: Arc<Self>, dep: &Arc<Fence>) -> ArmOutcome {
        let fence = self.fence.clone();
        let work = self.clone();
        if dep.add_callback(move |dep| work.complete(dep)) {
            return ArmOutcome::Armed(fence);
        }

        if dep.error().is_some() || self.fail_gpu {
            match lock(&self.arg).take() {
                Some(arg) => ArmOutcome::Failed(arg),
                None => ArmOutcome::Done,
            }
        } else {
            ArmOutcome::Done
        }
    }

    fn complete(self: Arc<Self>, dep: &Fence) {
        if dep.error().is_some() || self.fail_gpu {
            if let Some(err) = dep.error() {
                log::debug!("gpu migration failed ({err}), moving with the cpu");
            }
            *lock(&self.state) = MemcpyState::Intercepted;
            let queue = self.unbound_wq.clone();
            queue.queue(move || self.run_intercept());
        } else {
            let queue = self.highpri_wq.clone();
            queue.queue(move || {
                lock(&self.arg).take();
                self.fence.signal();
                *lock(&self.state) = MemcpyState::Complete;
            });
        }
    }

    fn run_intercept(&self) {
        *lock(&self.state) = MemcpyState::Running;
        if let Some(arg) = lock(&self.arg).take() {
            if let Err(err) = arg.run() {
                log::warn!("cpu migration failed: {err}");
                self.fence.set_error(err);
            }
        }
        self.fence.signal();
        *lock(&self.state) = MemcpyState::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, FailureModes};
    use crate::sync::WaitCtx;

    fn gt(modes: FailureModes) -> Arc<Gt> {
        Gt::new(
            DeviceConfig::new()
                .ggtt(16 << 20, 8 << 20)
                .local_memory(8 << 20)
                .failure_modes(modes),
        )
        .unwrap()
    }

    fn arg(gt: &Gt, clear: bool) -> MemcpyArg {
        let memory = gt.memory().clone();
        let src = SgTable::from_blocks(memory.system().alloc(2 * GTT_PAGE_SIZE_4K).unwrap());
        let dst = SgTable::from_blocks(memory.system().alloc(2 * GTT_PAGE_SIZE_4K).unwrap());
        for (i, dma) in src.page_addresses().enumerate() {
            memory.fill(dma, CHUNK, 0xa0 + i as u8).unwrap();
        }
        for dma in dst.page_addresses() {
            memory.fill(dma, CHUNK, 0xff).unwrap();
        }
        MemcpyArg {
            memory,
            clear,
            num_pages: 2,
            src: Some(src),
            dst,
        }
    }

    fn first_byte(arg: &MemcpyArg, page: usize) -> u8 {
        let mut b = [0u8; 1];
        arg.memory.read(arg.dst.dma_address(page).unwrap(), &mut b).unwrap();
        b[0]
    }

    #[test]
    fn run_copies_or_clears() {
        let gt = gt(FailureModes::default());
        let copy = arg(&gt, false);
        copy.run().unwrap();
        assert_eq!(first_byte(&copy, 0), 0xa0);
        assert_eq!(first_byte(&copy, 1), 0xa1);

        let clear = arg(&gt, true);
        clear.run().unwrap();
        assert_eq!(first_byte(&clear, 1), 0);
    }

    #[test]
    fn successful_dependency_just_signals() {
        let gt = gt(FailureModes::default());
        let dep = Fence::new("gpu");
        let work = MemcpyWork::alloc(&gt, arg(&gt, false)).unwrap();
        let ArmOutcome::Armed(fence) = work.clone().arm(&dep) else {
            panic!("expected an armed work");
        };
        dep.signal();
        fence.wait(&WaitCtx::uninterruptible()).unwrap();
        gt.highpri_wq().flush();
        assert_eq!(work.state(), MemcpyState::Complete);
        assert!(fence.error().is_none());
        assert!(lock(&work.arg).is_none());
    }

    #[test]
    fn failed_dependency_is_intercepted() {
        let gt = gt(FailureModes::default());
        let dep = Fence::new("gpu");
        let a = arg(&gt, false);
        let (memory, dst) = (a.memory.clone(), a.dst.clone());
        let work = MemcpyWork::alloc(&gt, a).unwrap();
        let ArmOutcome::Armed(fence) = work.clone().arm(&dep) else {
            panic!("expected an armed work");
        };
        dep.signal_error(VmaError::Gpu("hang"));
        fence.wait(&WaitCtx::uninterruptible()).unwrap();
        assert!(fence.error().is_none());

        let mut b = [0u8; 1];
        memory.read(dst.dma_address(1).unwrap(), &mut b).unwrap();
        assert_eq!(b[0], 0xa1);
    }

    #[test]
    fn already_failed_dependency_hands_back_the_move() {
        let gt = gt(FailureModes::default());
        let dep = Fence::new("gpu");
        dep.signal_error(VmaError::Gpu("hang"));
        let work = MemcpyWork::alloc(&gt, arg(&gt, false)).unwrap();
        assert!(matches!(work.arm(&dep), ArmOutcome::Failed(_)));

        let ok = Fence::signaled("gpu");
        let work = MemcpyWork::alloc(&gt, arg(&gt, false)).unwrap();
        assert!(matches!(work.arm(&ok), ArmOutcome::Done));
    }

    #[test]
    fn allocation_failure_mode() {
        let gt = gt(FailureModes::new(false, true));
        assert!(MemcpyWork::alloc(&gt, arg(&gt, false)).is_err());
    }
}

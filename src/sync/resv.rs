//! Shared multi-reader / single-writer fence reservation.

use crate::error::{VmaError, VmaResult};
use crate::sync::fence::{Fence, WaitCtx};
use crate::utils::lock;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ResvFences {
    excl: Option<Arc<Fence>>,
    shared: Vec<Arc<Fence>>,
    /// Slots promised by `reserve_shared` and not yet filled.
    reserved: usize,
}

impl ResvFences {
    fn prune(&mut self) {
        self.shared.retain(|f| !f.is_signaled());
        if self.excl.as_ref().is_some_and(|f| f.is_signaled()) {
            self.excl = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct Reservation {
    fences: Mutex<ResvFences>,
}

impl Reservation {
    /// Shared slots a single object may accumulate before callers must wait.
    const MAX_SHARED: usize = 256;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure `count` more shared fences can be added. Reserving again
    /// before the slots are used does not stack.
    pub fn reserve_shared(&self, count: usize) -> VmaResult<()> {
        let mut fences = lock(&self.fences);
        fences.prune();
        if fences.shared.len() + count > Self::MAX_SHARED {
            return Err(VmaError::OutOfMemory);
        }
        fences.reserved = fences.reserved.max(count);
        Ok(())
    }

    /// Adds a reader. A slot must have been reserved first.
    pub fn add_shared_fence(&self, fence: Arc<Fence>) -> VmaResult<()> {
        let mut fences = lock(&self.fences);
        if fences.reserved == 0 {
            debug_assert!(false, "shared fence added without a reserved slot");
            return Err(VmaError::Invariant("no reserved shared slot"));
        }
        fences.reserved -= 1;
        fences.shared.push(fence);
        Ok(())
    }

    /// Replaces the writer. Readers are subsumed by the new writer.
    pub fn add_excl_fence(&self, fence: Arc<Fence>) {
        let mut fences = lock(&self.fences);
        fences.shared.clear();
        fences.excl = Some(fence);
    }

    /// The current unsignalled writer and readers.
    #[must_use]
    pub fn fences(&self) -> (Option<Arc<Fence>>, Vec<Arc<Fence>>) {
        let mut fences = lock(&self.fences);
        fences.prune();
        (fences.excl.clone(), fences.shared.clone())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let (excl, shared) = self.fences();
        excl.is_none() && shared.is_empty()
    }

    /// Waits for the writer and every reader.
    pub fn wait(&self, ctx: &WaitCtx) -> VmaResult<()> {
        let (excl, shared) = self.fences();
        if let Some(fence) = excl {
            fence.wait(ctx)?;
        }
        for fence in shared {
            fence.wait(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_fence_needs_reservation() {
        let resv = Reservation::new();
        resv.reserve_shared(1).unwrap();
        resv.add_shared_fence(Fence::new("r")).unwrap();
        let (excl, shared) = resv.fences();
        assert!(excl.is_none());
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn writer_replaces_readers() {
        let resv = Reservation::new();
        resv.reserve_shared(1).unwrap();
        resv.add_shared_fence(Fence::new("r")).unwrap();
        resv.add_excl_fence(Fence::new("w"));
        let (excl, shared) = resv.fences();
        assert!(excl.is_some());
        assert!(shared.is_empty());
    }

    #[test]
    fn signalled_fences_are_pruned() {
        let resv = Reservation::new();
        let w = Fence::new("w");
        resv.add_excl_fence(w.clone());
        assert!(!resv.is_idle());
        w.signal();
        assert!(resv.is_idle());
    }
}

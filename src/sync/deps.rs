//! Dependency sets: the fences a future operation must wait for.

use crate::error::VmaResult;
use crate::sync::fence::{Fence, WaitCtx};
use crate::sync::resv::Reservation;
use std::sync::Arc;

/// An ordered collection of unsignalled fences, at most one per context.
///
/// Built fresh for each migration or bind, consumed, then dropped.
#[derive(Debug, Default)]
pub struct Deps {
    fences: Vec<Arc<Fence>>,
}

impl Deps {
    #[must_use]
    pub const fn new() -> Self {
        Self { fences: Vec::new() }
    }

    /// Adds `fence` to the set.
    ///
    /// Already signalled fences are not stored; if one completed with an
    /// error, that error is returned so the operation never starts on top of
    /// failed work. A fence from a context already in the set replaces the
    /// stored one only if it is later on that timeline.
    pub fn add_dependency(&mut self, fence: Option<&Arc<Fence>>, _ctx: &WaitCtx) -> VmaResult<()> {
        let Some(fence) = fence else {
            return Ok(());
        };

        if fence.is_signaled() {
            return fence.error().map_or(Ok(()), Err);
        }

        if let Some(entry) = self
            .fences
            .iter_mut()
            .find(|f| f.context() == fence.context())
        {
            if fence.seqno() > entry.seqno() {
                *entry = fence.clone();
            }
            return Ok(());
        }

        self.fences.push(fence.clone());
        Ok(())
    }

    /// Adds the writer and every reader of a reservation.
    pub fn add_resv(&mut self, resv: &Reservation, ctx: &WaitCtx) -> VmaResult<()> {
        let (excl, shared) = resv.fences();
        self.add_dependency(excl.as_ref(), ctx)?;
        for fence in &shared {
            self.add_dependency(Some(fence), ctx)?;
        }
        Ok(())
    }

    /// Waits for every dependency in order. A dependency that completed with
    /// an error aborts the wait with that error.
    pub fn sync(&self, ctx: &WaitCtx) -> VmaResult<()> {
        for fence in &self.fences {
            if !fence.is_signaled() {
                fence.wait(ctx)?;
            }
            if let Some(err) = fence.error() {
                return Err(err);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn fences(&self) -> &[Arc<Fence>] {
        &self.fences
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmaError;
    use crate::sync::fence::Timeline;

    #[test]
    fn signalled_fences_are_skipped() {
        let mut deps = Deps::new();
        let ctx = WaitCtx::uninterruptible();
        deps.add_dependency(Some(&Fence::signaled("done")), &ctx).unwrap();
        deps.add_dependency(None, &ctx).unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn failed_dependency_is_reported() {
        let mut deps = Deps::new();
        let failed = Fence::new("failed");
        failed.signal_error(VmaError::Gpu("blit"));
        assert_eq!(
            deps.add_dependency(Some(&failed), &WaitCtx::uninterruptible()),
            Err(VmaError::Gpu("blit"))
        );
    }

    #[test]
    fn same_context_keeps_latest() {
        let tl = Timeline::new("tl");
        let first = tl.next_fence();
        let second = tl.next_fence();
        let mut deps = Deps::new();
        let ctx = WaitCtx::uninterruptible();
        deps.add_dependency(Some(&second), &ctx).unwrap();
        deps.add_dependency(Some(&first), &ctx).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps.fences()[0].seqno(), second.seqno());
    }

    #[test]
    fn sync_reports_error_of_completed_dependency() {
        let pending = Fence::new("pending");
        let mut deps = Deps::new();
        deps.add_dependency(Some(&pending), &WaitCtx::uninterruptible())
            .unwrap();
        pending.signal_error(VmaError::Gpu("reset"));
        assert_eq!(
            deps.sync(&WaitCtx::uninterruptible()),
            Err(VmaError::Gpu("reset"))
        );
    }
}

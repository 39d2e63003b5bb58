//! Activity tracking for a mapping: which GPU work still uses it.

use crate::error::VmaResult;
use crate::sync::fence::{Fence, WaitCtx};
use crate::utils::lock;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ActiveState {
    /// Most recent writer; for a mapping this is its pending bind.
    excl: Option<Arc<Fence>>,
    /// Outstanding readers, accumulated.
    shared: Vec<Arc<Fence>>,
    /// Holders that promised to add work and have not yet released.
    acquired: usize,
}

impl ActiveState {
    fn prune(&mut self) {
        self.shared.retain(|f| !f.is_signaled());
        if self.excl.as_ref().is_some_and(|f| f.is_signaled()) {
            self.excl = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct Active {
    state: Mutex<ActiveState>,
}

impl Active {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an active reference, announcing that work may be added.
    pub fn acquire(&self) {
        lock(&self.state).acquired += 1;
    }

    pub fn release(&self) {
        let mut state = lock(&self.state);
        debug_assert!(state.acquired > 0, "unbalanced active release");
        state.acquired = state.acquired.saturating_sub(1);
    }

    /// Installs `fence` as the exclusive slot, returning the previous
    /// unsignalled occupant for the caller to chain after.
    pub fn set_exclusive(&self, fence: Arc<Fence>) -> Option<Arc<Fence>> {
        let mut state = lock(&self.state);
        state.prune();
        state.excl.replace(fence)
    }

    #[must_use]
    pub fn exclusive(&self) -> Option<Arc<Fence>> {
        let mut state = lock(&self.state);
        state.prune();
        state.excl.clone()
    }

    /// Records a reader.
    pub fn add_request(&self, fence: Arc<Fence>) {
        let mut state = lock(&self.state);
        state.prune();
        state.shared.push(fence);
    }

    /// Any outstanding fence, or an unreleased active reference.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let mut state = lock(&self.state);
        state.prune();
        state.acquired > 0 || state.excl.is_some() || !state.shared.is_empty()
    }

    /// Every unsignalled fence: the exclusive slot first, then the readers.
    #[must_use]
    pub fn fences(&self) -> Vec<Arc<Fence>> {
        let mut state = lock(&self.state);
        state.prune();
        state
            .excl
            .iter()
            .chain(state.shared.iter())
            .cloned()
            .collect()
    }

    /// Waits until all tracked fences have signalled.
    pub fn wait(&self, ctx: &WaitCtx) -> VmaResult<()> {
        for fence in self.fences() {
            fence.wait(ctx)?;
        }
        Ok(())
    }
}

//! Power references.
//!
//! Nothing is actually powered down; the counts exist so callers can check
//! that work touching the global GTT or an engine held a reference.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A wake reference counter. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct RuntimePm {
    count: Arc<AtomicUsize>,
}

impl RuntimePm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Wakeref {
        self.count.fetch_add(1, Ordering::AcqRel);
        Wakeref {
            count: self.count.clone(),
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.active() > 0
    }
}

/// Keeps the device awake until dropped.
#[derive(Debug)]
#[must_use = "the wake reference is released when dropped"]
pub struct Wakeref {
    count: Arc<AtomicUsize>,
}

impl Drop for Wakeref {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakerefs_nest() {
        let pm = RuntimePm::new();
        let a = pm.get();
        let b = pm.clone().get();
        assert_eq!(pm.active(), 2);
        drop(a);
        assert!(pm.is_awake());
        drop(b);
        assert!(!pm.is_awake());
    }
}

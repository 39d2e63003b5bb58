//! Wait-die object locking.
//!
//! Object locks are taken through a [`WwCtx`] carrying a ticket. When a
//! younger context runs into a lock held by an older one it gets
//! [`VmaError::Deadlock`], drops everything it holds and starts again; an
//! older context simply waits. Tickets survive a back-off, so every context
//! eventually becomes the oldest and makes progress.

use crate::error::{VmaError, VmaResult};
use crate::sync::fence::WaitCtx;
use crate::utils::lock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

const LOCK_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Ticket(u64),
    /// Taken by `try_lock` outside of any acquire context.
    Anonymous,
}

#[derive(Debug, Default)]
pub struct WwMutex {
    owner: Mutex<Option<Owner>>,
    released: Condvar,
}

impl WwMutex {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the lock on behalf of `ww`. Taking a lock the context
    /// already holds succeeds without nesting.
    pub fn lock(self: &Arc<Self>, ww: &mut WwCtx, wait: &WaitCtx) -> VmaResult<()> {
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                None => {
                    *owner = Some(Owner::Ticket(ww.ticket));
                    drop(owner);
                    ww.held.push(self.clone());
                    return Ok(());
                }
                Some(Owner::Ticket(t)) if t == ww.ticket => return Ok(()),
                Some(Owner::Ticket(t)) if t < ww.ticket => {
                    drop(owner);
                    ww.contended = Some(self.clone());
                    return Err(VmaError::Deadlock);
                }
                _ => {
                    wait.check()?;
                    owner = match self.released.wait_timeout(owner, LOCK_POLL) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Waits for the lock regardless of ticket order. Only valid while the
    /// context holds nothing else, i.e. right after a back-off.
    fn lock_slow(self: &Arc<Self>, ww: &mut WwCtx, wait: &WaitCtx) -> VmaResult<()> {
        debug_assert!(ww.held.is_empty());
        let mut owner = lock(&self.owner);
        while owner.is_some() {
            wait.check()?;
            owner = match self.released.wait_timeout(owner, LOCK_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *owner = Some(Owner::Ticket(ww.ticket));
        drop(owner);
        ww.held.push(self.clone());
        Ok(())
    }

    /// Takes the lock only if it is free, outside any acquire context.
    #[must_use]
    pub fn try_lock(&self) -> Option<WwGuard<'_>> {
        let mut owner = lock(&self.owner);
        if owner.is_some() {
            return None;
        }
        *owner = Some(Owner::Anonymous);
        Some(WwGuard(self))
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        lock(&self.owner).is_some()
    }

    #[must_use]
    pub fn is_locked_by(&self, ww: &WwCtx) -> bool {
        *lock(&self.owner) == Some(Owner::Ticket(ww.ticket))
    }

    fn unlock(&self) {
        *lock(&self.owner) = None;
        self.released.notify_all();
    }
}

/// Holds a lock taken with [`WwMutex::try_lock`].
pub struct WwGuard<'a>(&'a WwMutex);

impl Drop for WwGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl fmt::Debug for WwGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WwGuard")
    }
}

/// An acquire context: the set of object locks one operation holds.
/// Everything still held is released on drop.
#[derive(Debug)]
pub struct WwCtx {
    ticket: u64,
    held: Vec<Arc<WwMutex>>,
    contended: Option<Arc<WwMutex>>,
}

impl Default for WwCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl WwCtx {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            held: Vec::new(),
            contended: None,
        }
    }

    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Drops every held lock, then sleeps on the lock we lost the race for
    /// so the retry starts already owning it.
    pub fn backoff(&mut self, wait: &WaitCtx) -> VmaResult<()> {
        self.unlock_all();
        match self.contended.take() {
            Some(contended) => contended.lock_slow(self, wait),
            None => Ok(()),
        }
    }

    pub fn unlock_all(&mut self) {
        for held in self.held.drain(..) {
            held.unlock();
        }
    }
}

impl Drop for WwCtx {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// Runs `f` under a fresh acquire context, backing off and retrying for as
/// long as it reports lock contention.
pub fn ww_retry<T, F>(wait: &WaitCtx, mut f: F) -> VmaResult<T>
where
    F: FnMut(&mut WwCtx) -> VmaResult<T>,
{
    let mut ww = WwCtx::new();
    loop {
        match f(&mut ww) {
            Err(VmaError::Deadlock) => ww.backoff(wait)?,
            other => return other,
        }
    }
}

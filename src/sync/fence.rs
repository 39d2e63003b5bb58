use crate::error::{VmaError, VmaResult};
use crate::utils::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long a waiter sleeps between checks of its interrupt token.
const INTERRUPT_POLL: Duration = Duration::from_millis(2);

/// Spin iterations before a waiter falls back to sleeping.
const SPIN_LIMIT: u32 = 64;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// A caller-owned cancellation token, raised to abort interruptible waits.
#[derive(Debug, Default)]
pub struct Interrupt {
    raised: AtomicBool,
}

impl Interrupt {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

/// Wait policy for one operation: whether blocking waits may be interrupted,
/// and an optional upper bound on each wait.
#[derive(Debug, Clone, Default)]
pub struct WaitCtx {
    pub interruptible: bool,
    pub interrupt: Option<Arc<Interrupt>>,
    pub timeout: Option<Duration>,
}

impl WaitCtx {
    /// Uninterruptible, unbounded waits.
    #[must_use]
    pub fn uninterruptible() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn interruptible(interrupt: Arc<Interrupt>) -> Self {
        Self {
            interruptible: true,
            interrupt: Some(interrupt),
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns `Interrupted` if this context may be interrupted and has been.
    pub fn check(&self) -> VmaResult<()> {
        match &self.interrupt {
            Some(token) if self.interruptible && token.is_raised() => Err(VmaError::Interrupted),
            _ => Ok(()),
        }
    }
}

type FenceCallback = Box<dyn FnOnce(&Fence) + Send>;

struct FenceState {
    signaled: bool,
    error: Option<VmaError>,
    callbacks: Vec<FenceCallback>,
}

struct WaitGuard<'a>(&'a Fence);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A sequence of fences sharing one context. Later seqnos complete later.
#[derive(Debug)]
pub struct Timeline {
    name: &'static str,
    context: u64,
    seqno: AtomicU64,
}

impl Timeline {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            context: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            seqno: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn next_fence(&self) -> Arc<Fence> {
        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Fence::with_context(self.name, self.context, seqno))
    }
}

/// A one-shot completion signal.
///
/// Signalled exactly once, optionally carrying an error. Callbacks attached
/// before signalling run on the signalling thread; they must be short and
/// hand real work to a queue.
pub struct Fence {
    name: &'static str,
    context: u64,
    seqno: u64,
    state: Mutex<FenceState>,
    cond: Condvar,

    /// Threads blocked in `wait`, so `signal` can skip the wakeup.
    waiting: AtomicU32,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("signaled", &state.signaled)
            .field("error", &state.error)
            .finish()
    }
}

impl Fence {
    fn with_context(name: &'static str, context: u64, seqno: u64) -> Self {
        Self {
            name,
            context,
            seqno,
            state: Mutex::new(FenceState {
                signaled: false,
                error: None,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
            waiting: AtomicU32::new(0),
        }
    }

    /// A fence on its own fresh context.
    #[must_use]
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self::with_context(
            name,
            NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            1,
        ))
    }

    /// A fence that is already complete.
    #[must_use]
    pub fn signaled(name: &'static str) -> Arc<Self> {
        let fence = Self::new(name);
        fence.signal();
        fence
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn context(&self) -> u64 {
        self.context
    }

    #[must_use]
    pub const fn seqno(&self) -> u64 {
        self.seqno
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        lock(&self.state).signaled
    }

    #[must_use]
    pub fn error(&self) -> Option<VmaError> {
        lock(&self.state).error.clone()
    }

    /// Records an error to be reported once signalled. Ignored after signalling.
    pub fn set_error(&self, error: VmaError) {
        let mut state = lock(&self.state);
        if !state.signaled {
            state.error = Some(error);
        }
    }

    /// Signals the fence. Returns false if it was already signalled.
    pub fn signal(&self) -> bool {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.signaled {
                return false;
            }
            state.signaled = true;
            std::mem::take(&mut state.callbacks)
        };

        std::sync::atomic::fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::Relaxed) > 0 {
            self.cond.notify_all();
        }

        for cb in callbacks {
            cb(self);
        }
        true
    }

    /// Signals the fence with an error attached.
    pub fn signal_error(&self, error: VmaError) -> bool {
        self.set_error(error);
        self.signal()
    }

    /// Attaches a completion callback.
    ///
    /// Returns false, without keeping `cb`, if the fence has already
    /// signalled; the caller handles completion itself in that case.
    pub fn add_callback<F>(&self, cb: F) -> bool
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.signaled {
            return false;
        }
        state.callbacks.push(Box::new(cb));
        true
    }

    /// Blocks until signalled, honouring the interrupt and timeout of `ctx`.
    ///
    /// Success means the fence completed; it may still carry an error, which
    /// callers read with [`Fence::error`].
    pub fn wait(&self, ctx: &WaitCtx) -> VmaResult<()> {
        for _ in 0..SPIN_LIMIT {
            if self.is_signaled() {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        let deadline = ctx.timeout.map(|t| Instant::now() + t);
        let poll_interrupt = ctx.interruptible && ctx.interrupt.is_some();

        self.waiting.fetch_add(1, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        let _guard = WaitGuard(self);

        let mut state = lock(&self.state);
        loop {
            if state.signaled {
                return Ok(());
            }
            ctx.check()?;

            let mut slice = if poll_interrupt {
                INTERRUPT_POLL
            } else {
                Duration::from_secs(3600)
            };
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(VmaError::TimedOut);
                }
                slice = slice.min(deadline - now);
            }

            state = match self.cond.wait_timeout(state, slice) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Blocks until signalled, ignoring interrupts.
    pub fn wait_uninterruptible(&self) {
        // An uninterruptible, unbounded wait only returns once signalled.
        let _ = self.wait(&WaitCtx::uninterruptible());
    }
}

/// Waits for every fence in `fences`, stopping at the first failed wait.
pub fn wait_all(fences: &[Arc<Fence>], ctx: &WaitCtx) -> VmaResult<()> {
    for fence in fences {
        fence.wait(ctx)?;
    }
    Ok(())
}

//! Background execution: work queues and fence-gated work items.

use crate::error::VmaError;
use crate::sync::fence::{Fence, Timeline};
use crate::utils::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn inc(&self) {
        *lock(&self.count) += 1;
    }

    fn dec(&self) {
        let mut count = lock(&self.count);
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// A pool of worker threads executing queued jobs in no particular order.
pub struct WorkQueue {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("pending", &*lock(&self.pending.count))
            .finish()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new(name: &'static str, threads: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());

        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                thread::Builder::new()
                    .name(format!("{name}/{i}"))
                    .spawn(move || Self::worker(&receiver, &pending))
                    .map_err(|e| log::warn!("{name}: failed to spawn worker {i}: {e}"))
                    .ok()
            })
            .collect();

        Arc::new(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            pending,
        })
    }

    fn worker(receiver: &Mutex<Receiver<Job>>, pending: &Pending) {
        loop {
            let job = lock(receiver).recv();
            match job {
                Ok(job) => {
                    job();
                    pending.dec();
                }
                Err(_) => return,
            }
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Queues `job`. After shutdown, or with no live workers, it runs inline.
    pub fn queue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.sender).clone();
        let has_workers = !lock(&self.workers).is_empty();
        match sender {
            Some(sender) if has_workers => {
                self.pending.inc();
                if let Err(mpsc::SendError(job)) = sender.send(Box::new(job)) {
                    self.pending.dec();
                    job();
                }
            }
            _ => job(),
        }
    }

    /// Waits until every queued job, including ones queued meanwhile, ran.
    pub fn flush(&self) {
        let mut count = lock(&self.pending.count);
        while *count > 0 {
            count = match self.pending.idle.wait(count) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        lock(&self.sender).take();
        let current = thread::current().id();
        for worker in lock(&self.workers).drain(..) {
            // The last reference can be dropped by one of our own jobs.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::warn!("{}: worker panicked", self.name);
            }
        }
    }
}

struct FenceWorkInner {
    fence: Arc<Fence>,
    job: Mutex<Option<Job>>,
    release: Mutex<Option<Job>>,
    /// Unsignalled dependencies plus one for the commit itself.
    pending: AtomicUsize,
    error: Mutex<Option<VmaError>>,
    /// Run the job even if a dependency failed.
    ignore_errors: AtomicBool,
    queue: Arc<WorkQueue>,
}

impl FenceWorkInner {
    fn dependency_done(self: &Arc<Self>, dep: &Fence) {
        if let Some(err) = dep.error() {
            lock(&self.error).get_or_insert(err);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let inner = self.clone();
            self.queue.queue(move || inner.execute());
        }
    }

    fn execute(&self) {
        let mut error = lock(&self.error).take();
        if self.ignore_errors.load(Ordering::Acquire) {
            error = None;
        }
        let job = lock(&self.job).take();
        match (error, job) {
            (None, Some(job)) => job(),
            (Some(err), _) => self.fence.set_error(err),
            (None, None) => self.fence.set_error(VmaError::Again),
        }
        if let Some(release) = lock(&self.release).take() {
            release();
        }
        self.fence.signal();
    }
}

/// A job gated on a chain of fences, publishing its own completion fence.
///
/// Created disabled: committing a disabled item signals its fence with
/// `Again` without running the job. Enabling happens once the job has been
/// installed. Any dependency completing with an error skips the job and
/// passes the error on.
pub struct FenceWork {
    inner: Arc<FenceWorkInner>,
    chain: Vec<Arc<Fence>>,
    enabled: bool,
}

impl fmt::Debug for FenceWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceWork")
            .field("fence", &self.inner.fence)
            .field("chain", &self.chain.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl FenceWork {
    #[must_use]
    pub fn new(name: &'static str, queue: Arc<WorkQueue>) -> Self {
        Self::with_fence(Fence::new(name), queue)
    }

    /// A work item whose completion is the next fence of `timeline`.
    #[must_use]
    pub fn on_timeline(timeline: &Timeline, queue: Arc<WorkQueue>) -> Self {
        Self::with_fence(timeline.next_fence(), queue)
    }

    fn with_fence(fence: Arc<Fence>, queue: Arc<WorkQueue>) -> Self {
        Self {
            inner: Arc::new(FenceWorkInner {
                fence,
                job: Mutex::new(None),
                release: Mutex::new(None),
                pending: AtomicUsize::new(1),
                error: Mutex::new(None),
                ignore_errors: AtomicBool::new(false),
                queue,
            }),
            chain: Vec::new(),
            enabled: false,
        }
    }

    #[must_use]
    pub fn fence(&self) -> &Arc<Fence> {
        &self.inner.fence
    }

    /// Delays execution until `fence` signals.
    pub fn chain(&mut self, fence: Option<&Arc<Fence>>) {
        if let Some(fence) = fence {
            if !fence.is_signaled() || fence.error().is_some() {
                self.chain.push(fence.clone());
            }
        }
    }

    /// Installs the job and enables execution.
    pub fn enable<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.job) = Some(Box::new(job));
        self.enabled = true;
    }

    /// Runs after the job (or its skip), whatever the outcome, before the
    /// fence signals.
    pub fn on_release<F>(&mut self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.release) = Some(Box::new(release));
    }

    /// Failed dependencies only order the job; they no longer cancel it.
    pub fn ignore_errors(&mut self) {
        self.inner.ignore_errors.store(true, Ordering::Release);
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Arms the dependency chain. With nothing left to wait for, the job
    /// runs immediately on the calling thread.
    pub fn commit(self) {
        self.arm(true);
    }

    /// Like [`FenceWork::commit`], but the job always runs on the queue.
    pub fn commit_queued(self) {
        self.arm(false);
    }

    fn arm(self, inline: bool) {
        let inner = self.inner;
        if !self.enabled {
            lock(&inner.job).take();
        }

        inner.pending.fetch_add(self.chain.len(), Ordering::AcqRel);
        for dep in self.chain {
            let waiter = inner.clone();
            if !dep.add_callback(move |f| waiter.dependency_done(f)) {
                if let Some(err) = dep.error() {
                    lock(&inner.error).get_or_insert(err);
                }
                inner.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if inline {
                inner.execute();
            } else {
                let queued = inner.clone();
                inner.queue.queue(move || queued.execute());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn queue_runs_and_flushes() {
        let wq = WorkQueue::new("test", 2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            wq.queue(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn work_waits_for_chain() {
        let wq = WorkQueue::new("test", 1);
        let dep = Fence::new("dep");
        let ran = Arc::new(AtomicBool::new(false));

        let mut work = FenceWork::new("work", wq.clone());
        work.chain(Some(&dep));
        let r = ran.clone();
        work.enable(move || r.store(true, Ordering::SeqCst));
        let done = work.fence().clone();
        work.commit();

        assert!(!done.is_signaled());
        dep.signal();
        done.wait_uninterruptible();
        assert!(ran.load(Ordering::SeqCst));
        assert!(done.error().is_none());
    }

    #[test]
    fn queued_commit_runs_on_a_worker() {
        let wq = WorkQueue::new("test", 1);
        let timeline = Timeline::new("ring");
        let mut work = FenceWork::on_timeline(&timeline, wq.clone());
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let r = ran_on.clone();
        work.enable(move || *lock(&r) = Some(thread::current().id()));
        let done = work.fence().clone();
        work.commit_queued();
        done.wait_uninterruptible();
        assert_eq!(done.seqno(), 1);
        assert_ne!(*lock(&ran_on), Some(caller));
    }

    #[test]
    fn disabled_work_is_skipped() {
        let wq = WorkQueue::new("test", 1);
        let work = FenceWork::new("work", wq);
        let done = work.fence().clone();
        work.commit();
        assert!(done.is_signaled());
        assert_eq!(done.error(), Some(VmaError::Again));
    }

    #[test]
    fn cleanup_work_runs_despite_failed_dependency() {
        let wq = WorkQueue::new("test", 1);
        let dep = Fence::new("dep");
        dep.signal_error(VmaError::Gpu("dep failed"));
        let ran = Arc::new(AtomicBool::new(false));
        let mut work = FenceWork::new("work", wq);
        work.chain(Some(&dep));
        work.ignore_errors();
        let r = ran.clone();
        work.enable(move || r.store(true, Ordering::SeqCst));
        let done = work.fence().clone();
        work.commit();
        assert!(ran.load(Ordering::SeqCst));
        assert!(done.error().is_none());
    }

    #[test]
    fn dependency_error_skips_job() {
        let wq = WorkQueue::new("test", 1);
        let dep = Fence::new("dep");
        let mut work = FenceWork::new("work", wq);
        work.chain(Some(&dep));
        work.enable(|| panic!("must not run"));
        let released = Arc::new(AtomicBool::new(false));
        let r = released.clone();
        work.on_release(move || r.store(true, Ordering::SeqCst));
        let done = work.fence().clone();
        work.commit();

        dep.signal_error(VmaError::Gpu("dep failed"));
        done.wait_uninterruptible();
        assert_eq!(done.error(), Some(VmaError::Gpu("dep failed")));
        assert!(released.load(Ordering::SeqCst));
    }
}

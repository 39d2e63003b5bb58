//! Execution engines and the requests submitted to them.

use crate::error::VmaResult;
use crate::gt::pm::{RuntimePm, Wakeref};
use crate::sync::{Fence, FenceWork, Timeline, WorkQueue};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineClass {
    Render,
    Copy,
}

/// One engine: a timeline executed in order by a single thread.
pub struct Engine {
    name: &'static str,
    class: EngineClass,
    timeline: Timeline,
    pm: RuntimePm,
    queue: Arc<WorkQueue>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("awake", &self.pm.is_awake())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(name: &'static str, class: EngineClass) -> Arc<Self> {
        Arc::new(Self {
            name,
            class,
            timeline: Timeline::new(name),
            pm: RuntimePm::new(),
            queue: WorkQueue::new(name, 1),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn class(&self) -> EngineClass {
        self.class
    }

    #[must_use]
    pub const fn pm(&self) -> &RuntimePm {
        &self.pm
    }

    /// Waits for everything already submitted to this engine to retire.
    pub fn flush_barriers(&self) {
        self.queue.flush();
    }

    /// Starts building a request. Nothing runs until it is submitted.
    pub fn create_request(self: &Arc<Self>) -> Request {
        Request {
            engine: self.clone(),
            work: FenceWork::on_timeline(&self.timeline, self.queue.clone()),
            wakeref: self.pm.get(),
        }
    }
}

/// GPU work under construction. The request keeps its engine awake until it
/// retires.
pub struct Request {
    engine: Arc<Engine>,
    work: FenceWork,
    wakeref: Wakeref,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("engine", &self.engine.name)
            .field("fence", self.work.fence())
            .finish()
    }
}

impl Request {
    #[must_use]
    pub fn fence(&self) -> &Arc<Fence> {
        self.work.fence()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Orders this request after `fence`.
    pub fn await_fence(&mut self, fence: Option<&Arc<Fence>>) {
        self.work.chain(fence);
    }

    /// Queues `job` to execute once every awaited fence has signalled. An
    /// awaited fence that failed, or a failing job, completes the request
    /// with that error.
    pub fn submit<F>(self, job: F) -> Arc<Fence>
    where
        F: FnOnce() -> VmaResult<()> + Send + 'static,
    {
        let Self {
            engine,
            mut work,
            wakeref,
        } = self;

        let fence = work.fence().clone();
        let done = fence.clone();
        work.enable(move || {
            if let Err(err) = job() {
                log::debug!("{}: request failed: {err}", engine.name);
                done.set_error(err);
            }
        });
        work.on_release(move || drop(wakeref));
        work.commit_queued();
        fence
    }

    /// Submits an empty request, useful as a marker on the timeline.
    pub fn submit_nop(self) -> Arc<Fence> {
        self.submit(|| Ok(()))
    }
}

//! Single-consumer execution queue
//!
//! Serializes operations pushed from arbitrary threads onto exactly one
//! logical worker at a time, without a lock on the push path. A push decides
//! via the worker state machine whether a drain loop must be (re)started on
//! the configured backend; the drain loop pops and executes operations until
//! empty, then atomically hands control back to `Stopped` unless new work
//! raced in.
//!
//! Once closing has begun, pushes degrade to inline synchronous execution on
//! the caller thread, with no ordering guarantee against in-flight operations.

mod state;

pub use state::WorkerState;
use state::StateCell;

use crate::event::ManualResetEvent;
use crate::pool::{default_pool, Job, SingleThreadPool, TaskPriority, ThreadPool, ThreadPriority};
use crate::stats::{ExecutionQueueStats, QueueCounters};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

/// Unique identifier for one queue instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueId(u64);

impl QueueId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    // Id of the queue whose drain loop is executing on this thread, if any.
    // Saved and restored around each drain so nested inline drains unwind.
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

/// Where drain loops execute. Chosen once at construction, immutable after.
enum Backend {
    /// Run drain loops inline on whichever thread triggers them.
    Inline,

    /// Resolve the process-wide default pool at dispatch time; inline if
    /// none is installed (e.g. during teardown).
    Default,

    /// Externally owned shared pool.
    Shared(Arc<dyn ThreadPool>),

    /// Single worker thread created with, and owned by, this queue.
    Owned(Arc<SingleThreadPool>),
}

struct Inner {
    state: StateCell,
    ops: SegQueue<Job>,
    backend: Backend,
    priority: TaskPriority,
    debug_name: &'static str,
    id: QueueId,

    /// Set once `close_and_release` has been requested.
    release_requested: AtomicBool,

    /// Self-owned handle held between `close_and_release` and the terminal
    /// `Closing -> Closed` transition, which drops it.
    self_ref: Mutex<Option<Arc<Inner>>>,

    counters: QueueCounters,
}

impl Inner {
    fn is_being_closed(&self) -> bool {
        matches!(
            self.state.load(),
            WorkerState::Closing | WorkerState::Closed
        )
    }

    fn is_closed(&self) -> bool {
        self.state.load() == WorkerState::Closed
    }

    fn dispatch(self: &Arc<Self>, op: Job) {
        if self.is_being_closed() {
            // Closing queues degrade to synchronous execution; the op queue
            // is never touched.
            QueueCounters::incr(&self.counters.inline_runs);
            op();
            return;
        }
        self.ops.push(op);
        QueueCounters::incr(&self.counters.pushed);
        self.start_worker_if_needed();
    }

    fn dispatch_and_wait(self: &Arc<Self>, op: Job) {
        if self.is_being_closed() {
            QueueCounters::incr(&self.counters.inline_runs);
            op();
            return;
        }
        let done = Arc::new(ManualResetEvent::new());
        let signal = done.clone();
        self.ops.push(Box::new(move || {
            op();
            signal.set();
        }));
        QueueCounters::incr(&self.counters.pushed);
        self.start_worker_if_needed();
        done.wait();
    }

    fn start_worker_if_needed(self: &Arc<Self>) {
        // Being closed (or already closed): nothing to start.
        if self.is_being_closed() {
            return;
        }
        // A worker is active: flag our op so it does not stop before seeing
        // it. If both claims fail we lost the start race; the winner drains.
        if self.state.try_transition(WorkerState::Running, WorkerState::AddOp)
            || !self.state.try_transition(WorkerState::Stopped, WorkerState::Running)
        {
            return;
        }

        match &self.backend {
            Backend::Inline => self.work(),
            Backend::Default => match default_pool() {
                Some(pool) => {
                    let queue = self.clone();
                    pool.spawn(Box::new(move || queue.work()), self.priority);
                }
                None => {
                    // No pool installed (too early, or torn down): run the
                    // drain here rather than fail.
                    trace!(
                        queue = self.debug_name,
                        "no default pool, draining inline"
                    );
                    self.work();
                }
            },
            Backend::Shared(pool) => {
                let queue = self.clone();
                pool.spawn(Box::new(move || queue.work()), self.priority);
            }
            Backend::Owned(pool) => {
                let queue = self.clone();
                pool.spawn(Box::new(move || queue.work()), self.priority);
            }
        }
    }

    /// Drain loop entry point, on whichever backend thread won the start.
    fn work(self: &Arc<Self>) {
        loop {
            self.process_work();
            if !self.keep_working() {
                break;
            }
        }
    }

    fn process_work(&self) {
        self.state
            .try_transition(WorkerState::AddOp, WorkerState::Running);

        let previous = CURRENT_QUEUE.with(|current| current.replace(self.id.0));
        while let Some(op) = self.ops.pop() {
            op();
            QueueCounters::incr(&self.counters.executed);
        }
        CURRENT_QUEUE.with(|current| current.set(previous));
    }

    fn keep_working(self: &Arc<Self>) -> bool {
        if self.state.try_transition(WorkerState::Running, WorkerState::Stopped) {
            // No more operations queued. Don't touch the queue past this
            // point: a racing pusher now owns worker startup.
            return false;
        }
        if self.state.try_transition(WorkerState::Closing, WorkerState::Closed) {
            // Terminal. If a deferred release is pending, this drop is the
            // queue's own handle going away.
            let released = self.self_ref.lock().take();
            drop(released);
            return false;
        }

        // Unexpected states: log and stop looping rather than crash.
        match self.state.load() {
            WorkerState::Closed => {
                error!(
                    queue = self.debug_name,
                    "worker is closed, but we are still looping"
                );
                false
            }
            WorkerState::Stopped => {
                error!(
                    queue = self.debug_name,
                    "worker is stopped, but we haven't stopped it ourselves"
                );
                false
            }
            // AddOp raced in: stay running and drain again.
            _ => true,
        }
    }

    fn try_set_closing(&self) -> bool {
        self.state.try_transition(WorkerState::Running, WorkerState::Closing)
            || self.state.try_transition(WorkerState::AddOp, WorkerState::Closing)
            || self.state.try_transition(WorkerState::Stopped, WorkerState::Closing)
    }

    fn close(self: &Arc<Self>) {
        if self.is_being_closed() {
            return;
        }
        if !self.state.try_transition(WorkerState::Stopped, WorkerState::Closed) {
            // A worker is (or was) active: ask it to flip to Closing from
            // inside the drain so everything pushed before this call runs
            // first.
            let queue = self.clone();
            self.dispatch_and_wait(Box::new(move || {
                queue.try_set_closing();
            }));
        }

        while !self.is_closed() {
            thread::yield_now();
        }
        trace!(queue = self.debug_name, "closed");
    }

    fn begin_release(self: &Arc<Self>) {
        self.release_requested.store(true, Ordering::SeqCst);

        if self.state.try_transition(WorkerState::Stopped, WorkerState::Closed) {
            // Worker never started: nothing pending, the caller's handle is
            // the last one.
            trace!(queue = self.debug_name, "released without starting");
            return;
        }

        // Keep ourselves alive until the drain loop reaches Closed, then let
        // the terminal transition drop this handle.
        *self.self_ref.lock() = Some(self.clone());

        let queue = self.clone();
        self.dispatch(Box::new(move || {
            queue.try_set_closing();
        }));

        if self.is_closed() {
            // The terminal transition raced ahead of the self-ref store.
            self.self_ref.lock().take();
        }
    }

    fn stats(&self) -> ExecutionQueueStats {
        ExecutionQueueStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            inline_runs: self.counters.inline_runs.load(Ordering::Relaxed),
            depth: self.ops.len(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.ops.is_empty() {
            error!(
                queue = self.debug_name,
                depth = self.ops.len(),
                "execution queue dropped with unprocessed operations"
            );
        }
    }
}

/// A single-consumer work queue with a pluggable execution backend.
///
/// Dropping the queue closes it first, draining everything already pushed.
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    fn from_backend(debug_name: &'static str, backend: Backend, priority: TaskPriority) -> Self {
        trace!(queue = debug_name, "creating execution queue");
        Self {
            inner: Arc::new(Inner {
                state: StateCell::new(),
                ops: SegQueue::new(),
                backend,
                priority,
                debug_name,
                id: QueueId::new(),
                release_requested: AtomicBool::new(false),
                self_ref: Mutex::new(None),
                counters: QueueCounters::default(),
            }),
        }
    }

    /// Queue backed by the process-wide default pool, with a scheduling
    /// hint. Drains run inline while no default pool is installed.
    pub fn new(debug_name: &'static str, priority: TaskPriority) -> Self {
        Self::from_backend(debug_name, Backend::Default, priority)
    }

    /// Queue that drains inline on whichever thread triggers the worker.
    pub fn inline(debug_name: &'static str) -> Self {
        Self::from_backend(debug_name, Backend::Inline, TaskPriority::Normal)
    }

    /// Queue backed by an externally owned shared pool.
    pub fn with_pool(debug_name: &'static str, pool: Arc<dyn ThreadPool>) -> Self {
        Self::from_backend(debug_name, Backend::Shared(pool), TaskPriority::Normal)
    }

    /// Queue with its own dedicated worker thread at the given OS priority.
    pub fn with_owned_thread(debug_name: &'static str, priority: ThreadPriority) -> Self {
        let pool = Arc::new(SingleThreadPool::new(debug_name, priority));
        Self::from_backend(debug_name, Backend::Owned(pool), TaskPriority::Normal)
    }

    /// Enqueue an operation. Non-blocking; if the queue has begun closing,
    /// the operation executes inline on this thread instead.
    pub fn dispatch<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatch(Box::new(op));
    }

    /// Like [`dispatch`](Self::dispatch), for callers that only need
    /// "eventually executes exactly once" and tolerate relaxed latency
    /// during shutdown.
    pub fn dispatch_always<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatch(Box::new(op));
    }

    /// Enqueue an operation and block until it has run. Gives callers an
    /// ordering guarantee with respect to everything queued before it.
    pub fn dispatch_and_wait<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatch_and_wait(Box::new(op));
    }

    /// Begin shutdown and block until the queue reaches its terminal state.
    /// Everything pushed before this call has executed once `close` returns.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Begin shutdown and release the queue once it reaches its terminal
    /// state, without blocking. The queue keeps itself alive until its drain
    /// loop observes the terminal transition.
    pub fn close_and_release(self) {
        self.inner.begin_release();
        // Our Drop sees the release flag and skips the blocking close.
    }

    /// Whether shutdown has begun (`Closing` or `Closed`).
    pub fn is_being_closed(&self) -> bool {
        self.inner.is_being_closed()
    }

    /// Whether the queue has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether the calling thread is currently inside this queue's drain
    /// loop. Used to detect re-entrant dispatch.
    pub fn is_running_in_this_thread(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get()) == self.inner.id.0
    }

    /// Current worker state, for diagnostics.
    pub fn worker_state(&self) -> WorkerState {
        self.inner.state.load()
    }

    /// Scheduling-class hint this queue was configured with.
    pub fn priority(&self) -> TaskPriority {
        self.inner.priority
    }

    pub fn debug_name(&self) -> &'static str {
        self.inner.debug_name
    }

    /// Telemetry snapshot.
    pub fn stats(&self) -> ExecutionQueueStats {
        self.inner.stats()
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        if self.inner.release_requested.load(Ordering::SeqCst) {
            // Deferred release in flight; the self-owned handle finishes the
            // shutdown.
            return;
        }
        self.inner.close();
    }
}

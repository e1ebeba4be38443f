//! Tri-channel deferred dispatcher
//!
//! Three independent FIFO op channels layered over one per-tick entry point:
//! the async channel fans out to an execution queue, the game channel is
//! drained on the host's game thread, and the sync channel represents
//! real-time-thread work drained inline within `run` before it returns.
//!
//! Operations return [`OpResult::KeepRunning`] to be re-enqueued on the same
//! channel, spreading multi-step state machines across drain cycles. Once the
//! dispatcher begins closing, new deferrals are silently dropped.

use crate::event::ManualResetEvent;
use crate::pool::{Job, TaskPriority, ThreadPool};
use crate::queue::ExecutionQueue;
use crate::stats::{ChannelCounters, DeferredQueueStats};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::error;

/// Continuation signal returned by deferred operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// The operation is finished and its node can be discarded.
    Done,

    /// Re-enqueue the operation on the same channel for the next drain.
    KeepRunning,
}

/// Operation on the async or game channel.
pub type DeferredOp = Box<dyn FnMut() -> OpResult + Send + 'static>;

/// Operation on the sync channel. Receives the tick context while running
/// inside `run`, and `None` when drained outside a tick (from `wait`).
pub type SyncOp<C> = Box<dyn FnMut(Option<&C>) -> OpResult + Send + 'static>;

/// Opaque "schedule this on the game thread" service provided by the host.
pub trait GameThreadDispatcher: Send + Sync {
    /// Queue a job for later execution on the game thread. Non-blocking.
    fn dispatch(&self, job: Job);

    /// Whether the calling thread is the game thread.
    fn is_game_thread(&self) -> bool;
}

// Async-channel drain lifecycle.
const ASYNC_IDLE: u8 = 0;
const ASYNC_RUNNING: u8 = 1;
const ASYNC_DONE: u8 = 2;

struct Inner<C: 'static> {
    exec: ExecutionQueue,
    async_ops: SegQueue<DeferredOp>,
    sync_ops: SegQueue<SyncOp<C>>,
    game_ops: SegQueue<DeferredOp>,
    game: Arc<dyn GameThreadDispatcher>,

    sync_listeners: Mutex<Vec<Box<dyn Fn(Option<&C>) + Send + Sync>>>,
    game_listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,

    /// Async drain lifecycle; a drain that finds this not idle was reentered.
    async_state: AtomicU8,

    /// Reentrant counter coalescing game-thread drains: only the increment
    /// from zero starts a drain loop for the current generation.
    game_executing: AtomicI32,

    /// Set by the sync drain's sentinel to bound the drain to the ops that
    /// were queued when it started.
    sync_done: AtomicBool,

    in_run: AtomicBool,
    closing: AtomicBool,
    debug_name: &'static str,

    runs: AtomicU64,
    waits: AtomicU64,
    async_counters: Arc<ChannelCounters>,
    sync_counters: Arc<ChannelCounters>,
    game_counters: Arc<ChannelCounters>,
}

impl<C: 'static> Inner<C> {
    fn is_empty(&self) -> bool {
        self.async_ops.is_empty() && self.sync_ops.is_empty() && self.game_ops.is_empty()
    }

    // `defer_*` wrap the caller's op so each execution lands in the channel's
    // executed counter; drain sentinels are pushed raw and stay out of the
    // telemetry. Re-enqueues go through `requeue_*` to keep the single wrap.

    fn defer_async(&self, mut op: DeferredOp) {
        let counters = self.async_counters.clone();
        self.requeue_async(Box::new(move || {
            let result = op();
            counters.executed.fetch_add(1, Ordering::Relaxed);
            result
        }));
    }

    fn requeue_async(&self, op: DeferredOp) {
        if self.closing.load(Ordering::SeqCst) {
            self.count_dropped(&self.async_counters);
            return;
        }
        self.async_ops.push(op);
        self.async_counters.deferred.fetch_add(1, Ordering::Relaxed);
    }

    fn defer_sync(&self, mut op: SyncOp<C>) {
        let counters = self.sync_counters.clone();
        self.requeue_sync(Box::new(move |ctx| {
            let result = op(ctx);
            counters.executed.fetch_add(1, Ordering::Relaxed);
            result
        }));
    }

    fn requeue_sync(&self, op: SyncOp<C>) {
        if self.closing.load(Ordering::SeqCst) {
            self.count_dropped(&self.sync_counters);
            return;
        }
        self.sync_ops.push(op);
        self.sync_counters.deferred.fetch_add(1, Ordering::Relaxed);
    }

    fn defer_game(&self, mut op: DeferredOp) {
        let counters = self.game_counters.clone();
        self.requeue_game(Box::new(move || {
            let result = op();
            counters.executed.fetch_add(1, Ordering::Relaxed);
            result
        }));
    }

    fn requeue_game(&self, op: DeferredOp) {
        if self.closing.load(Ordering::SeqCst) {
            self.count_dropped(&self.game_counters);
            return;
        }
        self.game_ops.push(op);
        self.game_counters.deferred.fetch_add(1, Ordering::Relaxed);
    }

    fn count_dropped(&self, counters: &ChannelCounters) {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-tick entry point. Non-blocking except for the inline sync drain.
    fn run(self: &Arc<Self>, ctx: &C) {
        if self.in_run.swap(true, Ordering::SeqCst) {
            error!(
                queue = self.debug_name,
                "executing two run() calls at the same time"
            );
        }
        self.runs.fetch_add(1, Ordering::Relaxed);

        if !self.async_ops.is_empty() {
            let inner = self.clone();
            self.exec.dispatch(move || inner.async_exec());
        }

        if !self.game_ops.is_empty() || !self.game_listeners.lock().is_empty() {
            self.game_thread_exec();
        }

        if !self.sync_ops.is_empty() || !self.sync_listeners.lock().is_empty() {
            self.sync_exec(Some(ctx));
        }

        self.in_run.store(false, Ordering::SeqCst);
    }

    /// Drain the async channel on the execution queue's backend.
    fn async_exec(self: &Arc<Self>) {
        if self.async_ops.is_empty() {
            return;
        }

        if self
            .async_state
            .compare_exchange(ASYNC_IDLE, ASYNC_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!(
                queue = self.debug_name,
                "async drain not idle when trying to start; skipping"
            );
            return;
        }

        // Sentinel bounding this drain to the ops queued before it.
        let weak = Arc::downgrade(self);
        self.async_ops.push(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner
                    .async_state
                    .compare_exchange(
                        ASYNC_RUNNING,
                        ASYNC_DONE,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    error!(
                        queue = inner.debug_name,
                        "async drain not running when trying to finish"
                    );
                }
            }
            OpResult::Done
        }));

        while self.async_state.load(Ordering::SeqCst) == ASYNC_RUNNING {
            let Some(mut op) = self.async_ops.pop() else {
                break;
            };
            let result = op();
            if result == OpResult::KeepRunning {
                self.requeue_async(op);
            }
        }

        if self
            .async_state
            .compare_exchange(ASYNC_DONE, ASYNC_IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!(
                queue = self.debug_name,
                "async drain not done when trying to go idle"
            );
        }
    }

    /// Drain the sync channel inline. `ctx` is the tick context inside `run`,
    /// `None` when invoked from `wait`.
    fn sync_exec(self: &Arc<Self>, ctx: Option<&C>) {
        let weak = Arc::downgrade(self);
        self.sync_ops.push(Box::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.sync_done.store(true, Ordering::SeqCst);
            }
            OpResult::Done
        }));

        while !self.sync_done.load(Ordering::SeqCst) {
            let Some(mut op) = self.sync_ops.pop() else {
                break;
            };
            // Once closing, queued sync ops are discarded unexecuted: their
            // real-time collaborator is going away with us.
            if !self.closing.load(Ordering::SeqCst) {
                let result = op(ctx);
                if result == OpResult::KeepRunning {
                    self.requeue_sync(op);
                }
            }
        }

        let listeners = self.sync_listeners.lock();
        for listener in listeners.iter() {
            listener(ctx);
        }
        drop(listeners);

        self.sync_done.store(false, Ordering::SeqCst);
    }

    /// Request a game-thread drain, coalescing concurrent requests.
    fn game_thread_exec(self: &Arc<Self>) {
        let need_start = self.game_executing.fetch_add(1, Ordering::SeqCst) == 0;

        let weak = Arc::downgrade(self);
        self.game_ops.push(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.game_executing.fetch_sub(1, Ordering::SeqCst);
            }
            OpResult::Done
        }));

        if need_start {
            let inner = self.clone();
            self.game.dispatch(Box::new(move || inner.game_drain()));
        }
    }

    /// The actual game-channel drain loop; always on the game thread.
    fn game_drain(self: &Arc<Self>) {
        while self.game_executing.load(Ordering::SeqCst) > 0 {
            let Some(mut op) = self.game_ops.pop() else {
                break;
            };
            let result = op();
            if result == OpResult::KeepRunning {
                self.requeue_game(op);
            }
        }

        let listeners = self.game_listeners.lock();
        for listener in listeners.iter() {
            listener();
        }
    }

    /// Blocking drain-everything-now, from any thread including the game
    /// thread.
    fn wait(self: &Arc<Self>) {
        self.waits.fetch_add(1, Ordering::Relaxed);

        loop {
            if !self.async_ops.is_empty() {
                let inner = self.clone();
                self.exec.dispatch_and_wait(move || inner.async_exec());
            }

            if !self.game_ops.is_empty() {
                let done = Arc::new(ManualResetEvent::new());
                if self.game.is_game_thread() {
                    // We may already be inside a game drain on this very
                    // stack. Drain inline until our own sentinel has run so
                    // we never block against ourselves.
                    self.game_executing.fetch_add(1, Ordering::SeqCst);
                    let signal = done.clone();
                    let weak = Arc::downgrade(self);
                    self.game_ops.push(Box::new(move || {
                        signal.set();
                        if let Some(inner) = weak.upgrade() {
                            inner.game_executing.fetch_sub(1, Ordering::SeqCst);
                        }
                        OpResult::Done
                    }));

                    while !done.is_set() {
                        let Some(mut op) = self.game_ops.pop() else {
                            break;
                        };
                        let result = op();
                        if result == OpResult::KeepRunning {
                            self.requeue_game(op);
                        }
                    }
                } else {
                    let signal = done.clone();
                    self.game_ops.push(Box::new(move || {
                        signal.set();
                        OpResult::Done
                    }));
                    self.game_thread_exec();
                }
                done.wait();
            }

            if !self.sync_ops.is_empty() {
                self.sync_exec(None);
            }

            // Re-enqueued KeepRunning ops get further passes until every
            // channel is quiet.
            if self.is_empty() {
                break;
            }
        }
    }

    fn stats(&self) -> DeferredQueueStats {
        DeferredQueueStats {
            runs: self.runs.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            async_channel: self.async_counters.snapshot(self.async_ops.len()),
            sync_channel: self.sync_counters.snapshot(self.sync_ops.len()),
            game_channel: self.game_counters.snapshot(self.game_ops.len()),
        }
    }
}

/// Single-writer multi-priority deferred dispatcher.
///
/// `C` is the opaque tick context handed to `run` by the real-time driver
/// and passed through to sync-channel operations and listeners.
pub struct DeferredQueue<C: 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: 'static> DeferredQueue<C> {
    /// Dispatcher whose async channel drains on the process default pool.
    pub fn new(debug_name: &'static str, game: Arc<dyn GameThreadDispatcher>) -> Self {
        Self::with_exec(
            debug_name,
            ExecutionQueue::new(debug_name, TaskPriority::Normal),
            game,
        )
    }

    /// Dispatcher whose async channel drains on the given pool.
    pub fn with_pool(
        debug_name: &'static str,
        pool: Arc<dyn ThreadPool>,
        game: Arc<dyn GameThreadDispatcher>,
    ) -> Self {
        Self::with_exec(debug_name, ExecutionQueue::with_pool(debug_name, pool), game)
    }

    fn with_exec(
        debug_name: &'static str,
        exec: ExecutionQueue,
        game: Arc<dyn GameThreadDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                exec,
                async_ops: SegQueue::new(),
                sync_ops: SegQueue::new(),
                game_ops: SegQueue::new(),
                game,
                sync_listeners: Mutex::new(Vec::new()),
                game_listeners: Mutex::new(Vec::new()),
                async_state: AtomicU8::new(ASYNC_IDLE),
                game_executing: AtomicI32::new(0),
                sync_done: AtomicBool::new(false),
                in_run: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                debug_name,
                runs: AtomicU64::new(0),
                waits: AtomicU64::new(0),
                async_counters: Arc::new(ChannelCounters::default()),
                sync_counters: Arc::new(ChannelCounters::default()),
                game_counters: Arc::new(ChannelCounters::default()),
            }),
        }
    }

    /// Defer an operation onto the async (thread pool) channel.
    /// Silently dropped once closing has begun.
    pub fn defer_async<F>(&self, op: F)
    where
        F: FnMut() -> OpResult + Send + 'static,
    {
        self.inner.defer_async(Box::new(op));
    }

    /// Defer an operation onto the sync (real-time thread) channel.
    /// Silently dropped once closing has begun.
    pub fn defer_sync<F>(&self, op: F)
    where
        F: FnMut(Option<&C>) -> OpResult + Send + 'static,
    {
        self.inner.defer_sync(Box::new(op));
    }

    /// Defer an operation onto the game-thread channel.
    /// Silently dropped once closing has begun.
    pub fn defer_game<F>(&self, op: F)
    where
        F: FnMut() -> OpResult + Send + 'static,
    {
        self.inner.defer_game(Box::new(op));
    }

    /// Register a listener fired after every sync drain cycle, with the
    /// tick context of the drain (None outside a tick).
    pub fn on_sync_run<F>(&self, listener: F)
    where
        F: Fn(Option<&C>) + Send + Sync + 'static,
    {
        self.inner.sync_listeners.lock().push(Box::new(listener));
    }

    /// Register a listener fired after every game-thread drain cycle.
    pub fn on_game_run<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.game_listeners.lock().push(Box::new(listener));
    }

    /// Per-tick entry point, invoked by the real-time driver at most once at
    /// a time. Non-blocking except for the inline sync-channel drain, which
    /// completes before this returns.
    pub fn run(&self, ctx: &C) {
        self.inner.run(ctx);
    }

    /// Block until all three channels are drained. Safe from any thread,
    /// including the game thread.
    pub fn wait(&self) {
        self.inner.wait();
    }

    /// Whether all three channels are empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn debug_name(&self) -> &'static str {
        self.inner.debug_name
    }

    /// Telemetry snapshot.
    pub fn stats(&self) -> DeferredQueueStats {
        self.inner.stats()
    }
}

impl<C: 'static> Drop for DeferredQueue<C> {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if !self.inner.is_empty() {
            self.inner.wait();
            if !self.inner.is_empty() {
                error!(
                    queue = self.inner.debug_name,
                    "operations still queued while deleting deferred queue"
                );
            }
        }
        // Dropping `inner` closes the embedded execution queue.
    }
}

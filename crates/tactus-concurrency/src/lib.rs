//! Concurrency primitives for the audio integration layer
//!
//! Everything here serves one pattern: many threads hand small closures to a
//! component, exactly one logical worker executes them in FIFO order, and
//! shutdown is observable and race-free.
//!
//! - [`ExecutionQueue`]: lock-free multi-producer op queue with a
//!   single-consumer worker lifecycle driven by atomic state transitions.
//!   Backends are pluggable (shared pool, owned thread, inline).
//! - [`DeferredQueue`]: per-tick dispatcher layering three channels (async,
//!   sync, game thread) over execution queues, for systems driven by a
//!   real-time callback.
//! - [`Promise`] / [`Future`]: one-shot value handoff with broken-promise
//!   detection, used to turn asynchronous completion into a blocking wait.
//! - [`ManualResetEvent`]: the waitable flag underlying the blocking paths.
//!
//! Thread pools are provided by the host through the [`ThreadPool`] trait;
//! [`SingleThreadPool`] and the process default pool cover hosts without one.

pub mod deferred;
pub mod event;
pub mod oneshot;
pub mod pool;
pub mod queue;
pub mod stats;

pub use deferred::{DeferredQueue, GameThreadDispatcher, OpResult};
pub use event::ManualResetEvent;
pub use oneshot::{Future, OneShotError, Promise};
pub use pool::{
    default_pool, init_default_pool, teardown_default_pool, Job, SingleThreadPool, TaskPriority,
    ThreadPool, ThreadPriority,
};
pub use queue::{ExecutionQueue, WorkerState};
pub use stats::{ChannelStats, DeferredQueueStats, ExecutionQueueStats};

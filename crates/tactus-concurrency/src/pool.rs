//! Execution backends for queue workers
//!
//! An `ExecutionQueue` never owns scheduling policy itself: drain loops run on
//! whatever `ThreadPool` handle the queue was configured with. The host
//! environment usually provides that pool; `SingleThreadPool` exists for the
//! owned-thread construction mode and for hosts without a pool of their own.
//!
//! A process-wide default pool can be installed with `init_default_pool` and
//! removed with `teardown_default_pool`. Queues constructed in default mode
//! resolve the handle at dispatch time, so after teardown they degrade to
//! inline execution instead of failing.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// A unit of work handed to an execution backend.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An opaque "run this job on some thread" service.
pub trait ThreadPool: Send + Sync {
    /// Schedule a job for execution at the given scheduling class. Must
    /// never block the caller. Pools without priority lanes may ignore the
    /// hint.
    fn spawn(&self, job: Job, priority: TaskPriority);
}

/// Scheduling-class hint for drain loops on shared backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// OS priority for an owned worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
    TimeCritical,
}

#[cfg(unix)]
fn apply_thread_priority(priority: ThreadPriority) {
    let delta = match priority {
        ThreadPriority::Lowest => 19,
        ThreadPriority::BelowNormal => 10,
        ThreadPriority::Normal => 0,
        ThreadPriority::AboveNormal => -5,
        ThreadPriority::Highest => -10,
        ThreadPriority::TimeCritical => -15,
    };
    if delta != 0 {
        // Best effort: raising priority needs privileges we may not have.
        unsafe {
            let _ = libc::nice(delta);
        }
    }
}

#[cfg(not(unix))]
fn apply_thread_priority(_priority: ThreadPriority) {}

/// A pool with exactly one named worker thread.
///
/// Jobs run in submission order. Dropping the pool closes the channel and
/// joins the worker; jobs spawned after shutdown run inline on the caller.
pub struct SingleThreadPool {
    sender: Mutex<Option<crossbeam::channel::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadPool {
    /// Spawn the worker thread with the given name and OS priority.
    pub fn new(name: &'static str, priority: ThreadPriority) -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                apply_thread_priority(priority);
                for job in receiver {
                    job();
                }
                trace!(name, "single-thread pool worker exiting");
            })
            .expect("Failed to spawn pool worker thread");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }
}

impl ThreadPool for SingleThreadPool {
    // The worker's OS priority is fixed at construction; the per-job hint
    // has no lane to select on a single thread.
    fn spawn(&self, job: Job, _priority: TaskPriority) {
        let maybe_job = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(tx) => match tx.send(job) {
                    Ok(()) => None,
                    Err(err) => Some(err.into_inner()),
                },
                None => Some(job),
            }
        };
        // Worker gone: degrade to inline execution, outside the lock.
        if let Some(job) = maybe_job {
            job();
        }
    }
}

impl Drop for SingleThreadPool {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // The last handle to a self-releasing queue can be dropped
                // from within a job on this very worker. Joining ourselves
                // would never return; detach instead.
                return;
            }
            let _ = handle.join();
        }
    }
}

static DEFAULT_POOL: Lazy<RwLock<Option<Arc<dyn ThreadPool>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide default pool shared by queues constructed in
/// default mode. Owned by the hosting subsystem, never implicit.
pub fn init_default_pool(pool: Arc<dyn ThreadPool>) {
    *DEFAULT_POOL.write() = Some(pool);
}

/// The current default pool, if one is installed.
pub fn default_pool() -> Option<Arc<dyn ThreadPool>> {
    DEFAULT_POOL.read().clone()
}

/// Remove the default pool. Queues in default mode fall back to inline
/// execution afterwards.
pub fn teardown_default_pool() {
    DEFAULT_POOL.write().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_thread_pool_runs_jobs() {
        let pool = SingleThreadPool::new("tactus-test-pool", ThreadPriority::Normal);
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(crate::event::ManualResetEvent::new());

        for _ in 0..10 {
            let counter = counter.clone();
            pool.spawn(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                TaskPriority::Normal,
            );
        }
        let done2 = done.clone();
        pool.spawn(Box::new(move || done2.set()), TaskPriority::Normal);
        done.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_single_thread_pool_preserves_submission_order() {
        let pool = SingleThreadPool::new("tactus-order-pool", ThreadPriority::Normal);
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(crate::event::ManualResetEvent::new());

        for i in 0..50 {
            let order = order.clone();
            pool.spawn(Box::new(move || order.lock().push(i)), TaskPriority::Normal);
        }
        let done2 = done.clone();
        pool.spawn(Box::new(move || done2.set()), TaskPriority::Normal);
        done.wait();

        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_joins_worker() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let pool = SingleThreadPool::new("tactus-drop-pool", ThreadPriority::Normal);
            for _ in 0..5 {
                let ran = ran.clone();
                pool.spawn(
                    Box::new(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }),
                    TaskPriority::Normal,
                );
            }
        }
        // Drop joined the worker, so every queued job has run.
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }
}

//! Diagnostic counters for queues and channels
//!
//! Pure telemetry for an external collector: counters are updated with relaxed
//! atomics and never participate in synchronization. Correctness of the queues
//! must not depend on anything in this module.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters for one execution queue.
#[derive(Default)]
pub(crate) struct QueueCounters {
    pub(crate) pushed: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) inline_runs: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of an execution queue's counters.
#[derive(Debug, Clone, Default)]
pub struct ExecutionQueueStats {
    /// Operations pushed onto the op queue.
    pub pushed: u64,

    /// Operations executed by a drain loop.
    pub executed: u64,

    /// Operations executed inline because the queue was closing.
    pub inline_runs: u64,

    /// Operations currently queued.
    pub depth: usize,
}

/// Internal counters for one deferred channel.
#[derive(Default)]
pub(crate) struct ChannelCounters {
    pub(crate) deferred: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

/// Point-in-time view of one deferred channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Operations accepted by `defer_*`.
    pub deferred: u64,

    /// Operations executed (re-runs of `KeepRunning` ops count each time).
    pub executed: u64,

    /// Operations rejected because the dispatcher was closing.
    pub dropped: u64,

    /// Operations currently queued.
    pub depth: usize,
}

impl ChannelCounters {
    pub(crate) fn snapshot(&self, depth: usize) -> ChannelStats {
        ChannelStats {
            deferred: self.deferred.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth,
        }
    }
}

/// Point-in-time view of a deferred dispatcher.
#[derive(Debug, Clone, Default)]
pub struct DeferredQueueStats {
    /// Calls to `run`.
    pub runs: u64,

    /// Calls to `wait`.
    pub waits: u64,

    pub async_channel: ChannelStats,
    pub sync_channel: ChannelStats,
    pub game_channel: ChannelStats,
}

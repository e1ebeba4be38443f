//! Worker lifecycle state machine
//!
//! One `StateCell` per execution queue. Every transition is a compare-exchange
//! from an exact expected prior state; a failed exchange means another thread
//! won the race and the caller falls through to its next check. `Closed` is
//! terminal.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an execution queue's single logical worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// No worker is active; the next push must start one.
    Stopped = 0,

    /// A worker is draining, or about to drain, the op queue.
    Running = 1,

    /// A pusher flagged new work while the worker might be about to stop.
    AddOp = 2,

    /// Shutdown requested; the worker drains what is left, then closes.
    Closing = 3,

    /// Terminal. The queue may release itself once this is reached.
    Closed = 4,
}

impl WorkerState {
    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Running => "Running",
            WorkerState::AddOp => "AddOp",
            WorkerState::Closing => "Closing",
            WorkerState::Closed => "Closed",
        }
    }

    fn from_u8(raw: u8) -> WorkerState {
        match raw {
            0 => WorkerState::Stopped,
            1 => WorkerState::Running,
            2 => WorkerState::AddOp,
            3 => WorkerState::Closing,
            _ => WorkerState::Closed,
        }
    }
}

/// Every transition the queue is allowed to perform.
pub(crate) const VALID_TRANSITIONS: &[(WorkerState, WorkerState)] = &[
    (WorkerState::Stopped, WorkerState::Running),
    (WorkerState::Running, WorkerState::AddOp),
    (WorkerState::AddOp, WorkerState::Running),
    (WorkerState::Running, WorkerState::Stopped),
    (WorkerState::Running, WorkerState::Closing),
    (WorkerState::AddOp, WorkerState::Closing),
    (WorkerState::Stopped, WorkerState::Closing),
    (WorkerState::Closing, WorkerState::Closed),
    (WorkerState::Stopped, WorkerState::Closed),
];

/// Atomic cell holding a `WorkerState`.
///
/// Sequential consistency throughout: the state cell is the sole
/// synchronization point deciding queue lifetime, and close/release paths
/// must observe it in one total order.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Stopped as u8))
    }

    pub(crate) fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Attempt one transition from the table. Failure is an expected race,
    /// never an error.
    pub(crate) fn try_transition(&self, from: WorkerState, to: WorkerState) -> bool {
        debug_assert!(
            VALID_TRANSITIONS.contains(&(from, to)),
            "invalid worker transition {} -> {}",
            from.name(),
            to.name()
        );
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WorkerState; 5] = [
        WorkerState::Stopped,
        WorkerState::Running,
        WorkerState::AddOp,
        WorkerState::Closing,
        WorkerState::Closed,
    ];

    #[test]
    fn test_initial_state_is_stopped() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), WorkerState::Stopped);
    }

    #[test]
    fn test_transition_requires_exact_prior_state() {
        let cell = StateCell::new();
        // Queue is Stopped; a Running -> AddOp claim must fail and leave
        // the state untouched.
        assert!(!cell.try_transition(WorkerState::Running, WorkerState::AddOp));
        assert_eq!(cell.load(), WorkerState::Stopped);

        assert!(cell.try_transition(WorkerState::Stopped, WorkerState::Running));
        assert_eq!(cell.load(), WorkerState::Running);
    }

    #[test]
    fn test_closed_is_terminal() {
        let cell = StateCell::new();
        assert!(cell.try_transition(WorkerState::Stopped, WorkerState::Closed));
        for (from, to) in VALID_TRANSITIONS {
            if *from != WorkerState::Closed {
                assert!(!cell.try_transition(*from, *to));
            }
        }
        assert_eq!(cell.load(), WorkerState::Closed);
    }

    #[test]
    fn test_transition_table_covers_worker_lifecycle() {
        // Normal drain cycle.
        let cell = StateCell::new();
        assert!(cell.try_transition(WorkerState::Stopped, WorkerState::Running));
        assert!(cell.try_transition(WorkerState::Running, WorkerState::AddOp));
        assert!(cell.try_transition(WorkerState::AddOp, WorkerState::Running));
        assert!(cell.try_transition(WorkerState::Running, WorkerState::Stopped));

        // Shutdown from an active worker.
        assert!(cell.try_transition(WorkerState::Stopped, WorkerState::Running));
        assert!(cell.try_transition(WorkerState::Running, WorkerState::Closing));
        assert!(cell.try_transition(WorkerState::Closing, WorkerState::Closed));
    }

    #[test]
    fn test_no_transition_out_of_closing_except_closed() {
        for to in ALL {
            let allowed = to == WorkerState::Closed;
            assert_eq!(
                VALID_TRANSITIONS.contains(&(WorkerState::Closing, to)),
                allowed,
                "Closing -> {} should be {}",
                to.name(),
                if allowed { "allowed" } else { "rejected" }
            );
        }
    }
}

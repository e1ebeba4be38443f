//! Manual-reset binary event
//!
//! The blocking signal used by `dispatch_and_wait`, `DeferredQueue::wait` and
//! the one-shot channel. Once set, the event stays signaled for every current
//! and future waiter until `reset` is called explicitly, so a waiter waking up
//! never consumes the signal out from under another waiter.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A binary event that stays signaled until explicitly reset.
pub struct ManualResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    /// Create a new event in the non-signaled state.
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event, waking every waiter.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Return the event to the non-signaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Whether the event is currently signaled.
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Block until the event is signaled or the timeout elapses.
    ///
    /// Returns `true` if the event was signaled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_before_wait() {
        let event = ManualResetEvent::new();
        event.set();
        event.wait(); // must not block
        assert!(event.is_set());
    }

    #[test]
    fn test_wait_blocks_until_set() {
        let event = Arc::new(ManualResetEvent::new());
        let setter = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.set();
            })
        };
        event.wait();
        assert!(event.is_set());
        setter.join().unwrap();
    }

    #[test]
    fn test_stays_signaled_for_multiple_waiters() {
        let event = Arc::new(ManualResetEvent::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let event = event.clone();
            waiters.push(thread::spawn(move || event.wait()));
        }
        event.set();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        // A late waiter still sees the signal.
        event.wait();
    }

    #[test]
    fn test_wait_for_timeout() {
        let event = ManualResetEvent::new();
        assert!(!event.wait_for(Duration::from_millis(10)));
        event.set();
        assert!(event.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn test_reset() {
        let event = ManualResetEvent::new();
        event.set();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
        assert!(!event.wait_for(Duration::from_millis(5)));
    }
}

//! One-shot value channel (promise/future pair)
//!
//! A `Promise<T>` produces at most one value; the `Future<T>` obtained from it
//! consumes that value at most once, blocking until it is available. Dropping
//! the promise without setting a value marks the channel broken and wakes any
//! waiter, so consumers fail promptly instead of hanging forever.

use crate::event::ManualResetEvent;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors reported by the one-shot channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OneShotError {
    /// The promise was dropped before a value was set.
    #[error("promise dropped before a value was set")]
    Broken,

    /// `take_future` was already called on this promise.
    #[error("future already taken from this promise")]
    FutureTaken,
}

struct Slot<T> {
    value: Option<T>,
    broken: bool,
}

/// Shared state between exactly one promise and at most one future.
struct Shared<T> {
    slot: Mutex<Slot<T>>,
    event: ManualResetEvent,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                broken: false,
            }),
            event: ManualResetEvent::new(),
        }
    }

    /// Whether a waiter would return immediately.
    fn is_ready(&self) -> bool {
        let slot = self.slot.lock();
        slot.value.is_some() || slot.broken
    }
}

/// The producing half of a one-shot channel.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    future_taken: bool,
}

impl<T> Promise<T> {
    /// Create a new unfulfilled promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            future_taken: false,
        }
    }

    /// Retrieve the one and only future associated with this promise.
    pub fn take_future(&mut self) -> Result<Future<T>, OneShotError> {
        if self.future_taken {
            return Err(OneShotError::FutureTaken);
        }
        self.future_taken = true;
        Ok(Future {
            shared: self.shared.clone(),
        })
    }

    /// Fulfill the promise, waking any waiter.
    pub fn set(self, value: T) {
        {
            let mut slot = self.shared.slot.lock();
            debug_assert!(slot.value.is_none() && !slot.broken);
            slot.value = Some(value);
        }
        self.shared.event.set();
        // Drop runs next but sees the value in place, so the channel
        // is not marked broken.
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        if slot.value.is_none() {
            slot.broken = true;
            drop(slot);
            self.shared.event.set();
        }
    }
}

/// The consuming half of a one-shot channel.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").finish_non_exhaustive()
    }
}

impl<T> Future<T> {
    /// Block until the promise is fulfilled or broken.
    pub fn wait(&self) {
        if self.shared.is_ready() {
            return;
        }
        self.shared.event.wait();
    }

    /// Block until the value is available or the timeout elapses.
    ///
    /// Returns `true` if the result (value or broken-promise report) is
    /// available.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.shared.is_ready() {
            return true;
        }
        self.shared.event.wait_for(timeout)
    }

    /// Block until the value is available and take it.
    pub fn get(self) -> Result<T, OneShotError> {
        self.wait();
        let mut slot = self.shared.slot.lock();
        slot.value.take().ok_or(OneShotError::Broken)
    }
}

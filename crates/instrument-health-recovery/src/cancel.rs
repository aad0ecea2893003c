//! Cancellation shared between a session and its retry loops.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot cancellation flag with an interruptible sleep.
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Cancellation {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every sleeper. Idempotent.
    pub fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }
}

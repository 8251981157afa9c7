//! Reconnect backoff with explicit state
//!
//! The delay counter lives here as owned state rather than a captured
//! closure variable, so a session can never run two competing timers.

use std::time::Duration;

/// Monotonic doubling backoff, capped at a maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            next: base,
        }
    }

    /// The delay to wait before the next attempt. Each call doubles the
    /// following delay, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Back to the minimum, called after a successful reconnection
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

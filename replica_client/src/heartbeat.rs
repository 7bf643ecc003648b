//! Heartbeat timer.
//!
//! Tracks time since the client last sent anything. Any send resets it, so
//! a client that is busy writing changes never sends a redundant Present.

use std::time::Duration;

/// Default time without a send before a Present goes out.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    since_send: Duration,
    threshold: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT)
    }
}

impl Heartbeat {
    pub fn new(threshold: Duration) -> Self {
        Self {
            since_send: Duration::ZERO,
            threshold,
        }
    }

    pub fn advance(&mut self, dt: Duration) {
        self.since_send = self.since_send.saturating_add(dt);
    }

    pub fn is_due(&self) -> bool {
        self.since_send >= self.threshold
    }

    pub fn reset(&mut self) {
        self.since_send = Duration::ZERO;
    }

    pub fn elapsed(&self) -> Duration {
        self.since_send
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

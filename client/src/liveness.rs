//! Liveness bookkeeping for the carrier.
//!
//! The carrier emits a ping on every ping-interval tick and calls
//! [`LivenessMonitor::on_tick`] once a second. A tick counts as a failure
//! when no pong has arrived within the ping timeout; enough consecutive
//! failures tell the carrier to close the connection, which hands control to
//! the reconnect path.

use std::time::{Duration, Instant};

use tracing::warn;

/// Consecutive stale ticks before the connection is declared dead.
pub const MAX_PING_FAILURES: u32 = 5;

pub struct LivenessMonitor {
    ping_timeout: Duration,
    last_pong: Instant,
    consecutive_failures: u32,
}

impl LivenessMonitor {
    pub fn new(ping_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_timeout,
            last_pong: now,
            consecutive_failures: 0,
        }
    }

    /// A pong arrived: the connection is alive.
    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.consecutive_failures = 0;
    }

    /// One-second check. Returns `true` when the connection should close.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_pong) <= self.ping_timeout {
            return false;
        }
        self.consecutive_failures += 1;
        warn!(
            failure = self.consecutive_failures,
            max = MAX_PING_FAILURES,
            "ping timeout"
        );
        self.consecutive_failures >= MAX_PING_FAILURES
    }
}

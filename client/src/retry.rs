//! Reconnect backoff.
//!
//! Delays grow exponentially from the initial delay up to the cap; hitting
//! the cap resets the counter so the next delay starts over from the initial
//! value. A successful connection resets the counter explicitly.

use std::time::Duration;

use tracing::{debug, info};

pub struct RetryController {
    attempt: u32,
    initial: Duration,
    max: Duration,
}

impl RetryController {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            initial,
            max,
        }
    }

    /// Delay before the next reconnect attempt: `initial * 2^attempt`,
    /// capped at `max`. Reaching the cap resets the counter.
    pub fn next_delay(&mut self) -> Duration {
        let attempt = self.attempt;
        let exponent = attempt.min(31);
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(exponent));
        if delay >= self.max {
            self.attempt = 0;
            info!(
                attempt = attempt + 1,
                delay_secs = self.max.as_secs(),
                "retry delay capped"
            );
            return self.max;
        }
        self.attempt += 1;
        info!(
            attempt = attempt + 1,
            delay_secs = delay.as_secs(),
            "waiting before reconnecting"
        );
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        debug!("retry counter reset");
    }

    /// Run `task` after the next backoff delay.
    pub fn schedule<F>(&mut self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let delay = self.next_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await
        })
    }
}

//! Exponential backoff pacing for reconnects and publish retries.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Stateful exponential backoff: each delay is the previous one scaled by
/// the multiplier, capped at the configured maximum.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        Self {
            next: config.initial(),
            multiplier: config.multiplier,
            max: config.max(),
        }
    }

    /// The delay to wait before the next attempt. Advances the internal
    /// schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub(crate) async fn sleep(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

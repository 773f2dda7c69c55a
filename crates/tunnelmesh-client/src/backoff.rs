//! Reconnect pacing for the agent connect loop

use std::time::{Duration, Instant};

/// Consecutive fast failures tolerated before delaying
pub const FAST_RETRIES: u32 = 5;
/// Delay once the fast retries are spent
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
/// A gap this long since the last attempt forgets earlier failures
pub const RESET_AFTER: Duration = Duration::from_secs(10);

/// Reconnect policy: the first [`FAST_RETRIES`] reconnects happen at once,
/// after that every reconnect waits [`RETRY_DELAY`]. The failure count resets
/// when more than [`RESET_AFTER`] passed since the last attempt started, so
/// a connection that stayed up for a while reconnects immediately.
///
/// Time is passed in so the policy can be driven without a clock.
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    failures: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a connection attempt starts at `now`
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Delay before the next attempt, for a connection that ended at `now`
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) > RESET_AFTER {
                self.failures = 0;
            }
        }

        if self.failures < FAST_RETRIES {
            self.failures += 1;
            Duration::ZERO
        } else {
            RETRY_DELAY
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

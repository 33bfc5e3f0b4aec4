use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect retry policy: exponential backoff bounded by `max_delay_ms`,
/// scaled by a uniform jitter factor in `[0.5, 1.0]` when `jitter` is on.
///
/// Jitter is required whenever multiple adapters may reconnect concurrently,
/// otherwise they hammer the exchange in lockstep after an outage.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum reconnect attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);

        let scaled = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };

        Duration::from_millis(scaled as u64)
    }
}

/// Mutable backoff state tracking consecutive failed attempts.
#[derive(Clone, PartialEq, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset consecutive attempts after a successful connect + subscribe.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.policy
            .max_retries
            .map_or(false, |max| self.attempts >= max)
    }

    /// Generate the next sleep duration and record the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket rate limit configuration: `max_requests` per `time_window`,
/// with headroom for bursts of up to `burst` extra requests.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window_ms: u64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 1_000,
            time_window_ms: 1_000,
            burst: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }

    fn capacity(&self) -> f64 {
        (self.max_requests + self.burst) as f64
    }

    /// Tokens replenished per second.
    fn refill_rate(&self) -> f64 {
        let window_secs = self.time_window_ms.max(1) as f64 / 1_000.0;
        self.max_requests as f64 / window_secs
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter. Callers that exhaust the bucket are rejected,
/// not queued.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity(),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `permits` tokens if available.
    pub fn try_acquire(&self, permits: u32) -> bool {
        let mut state = self.state.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.config.refill_rate()).min(self.config.capacity());
        state.last_refill = now;

        if state.tokens >= permits as f64 {
            state.tokens -= permits as f64;
            true
        } else {
            false
        }
    }

    /// Remaining tokens, for stats surfaces.
    pub fn available(&self) -> u32 {
        self.state.lock().tokens as u32
    }
}

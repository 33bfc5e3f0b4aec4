use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Consecutive successes in half-open required to close the circuit.
const SUCCESS_THRESHOLD: u32 = 3;

/// Circuit breaker states.
///
/// ```text
/// CLOSED --failure_threshold--> OPEN --reset_timeout--> HALF_OPEN
///   ^                            ^                         |
///   '------ 3 successes ---------+------- failure --------'
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-stage guard that short-circuits calls to a failing dependency until a
/// cooldown elapses. Half-open allows a single probe at a time; three
/// consecutive probe successes close the circuit, one failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether a call may proceed. In half-open, admits only one probe at a
    /// time; the caller must report the outcome via [`record_success`] or
    /// [`record_failure`].
    ///
    /// [`record_success`]: CircuitBreaker::record_success
    /// [`record_failure`]: CircuitBreaker::record_failure
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map_or(Duration::MAX, |opened_at| opened_at.elapsed());
                if elapsed >= self.config.reset_timeout() {
                    Self::transition(&mut state, CircuitState::HalfOpen);
                    state.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Release an acquired probe slot without recording an outcome. Used when
    /// the guarded call was never attempted (eg/ a rate limit rejection).
    pub fn release(&self) {
        self.state.lock().probe_in_flight = false;
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.probe_in_flight = false;

        match state.state {
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= SUCCESS_THRESHOLD {
                    Self::transition(&mut state, CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_successes = 0;
        state.probe_in_flight = false;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.opened_at = Some(Instant::now());
                    Self::transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.opened_at = Some(Instant::now());
                Self::transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
            }
        }
    }

    fn transition(state: &mut BreakerState, to: CircuitState) {
        if state.state != to {
            info!(from = ?state.state, ?to, "circuit breaker state transition");
            state.state = to;
            match to {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                }
                CircuitState::HalfOpen => {
                    state.consecutive_successes = 0;
                }
                CircuitState::Open => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
        })
    }

    #[test]
    fn test_opens_at_exactly_failure_threshold() {
        let breaker = breaker(3, 60_000);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, 60_000);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reprobes_after_reset_timeout() {
        let breaker = breaker(1, 0);

        breaker.record_failure();
        // reset_timeout of zero: the next acquire transitions to half-open.
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let breaker = breaker(1, 0);
        breaker.record_failure();

        assert!(breaker.try_acquire());
        // Second concurrent probe refused while the first is in flight.
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_closes_after_three_consecutive_successes() {
        let breaker = breaker(1, 0);
        breaker.record_failure();

        for expected in [CircuitState::HalfOpen, CircuitState::HalfOpen, CircuitState::Closed] {
            assert!(breaker.try_acquire());
            breaker.record_success();
            assert_eq!(breaker.state(), expected);
        }
    }

    #[test]
    fn test_failure_in_half_open_reopens() {
        let breaker = breaker(1, 0);
        breaker.record_failure();

        assert!(breaker.try_acquire());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}

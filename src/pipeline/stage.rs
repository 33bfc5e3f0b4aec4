use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::limiter::{RateLimitConfig, TokenBucket};
use crate::envelope::Envelope;
use crate::publish::PublishError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of one stage processing an [`Envelope`].
#[derive(Debug)]
pub enum StageFlow {
    /// Envelope continues to the next stage.
    Continue(Envelope),
    /// Envelope consumed cleanly: filtered out, or handed to an async sink
    /// (eg/ the partitioned buffer). Not an error.
    Consumed,
    /// Envelope duplicated into independent copies, each continuing through
    /// the remaining stages separately.
    Split(Vec<Envelope>),
}

/// Per-run context threaded through the stage chain.
#[derive(Debug, Default)]
pub struct StageContext {
    pub correlation_id: u64,
    pub stage_latencies: Vec<(&'static str, Duration)>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageContext {
    pub fn new(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            ..Self::default()
        }
    }
}

/// Errors raised while a stage processes an [`Envelope`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error("CircuitOpen: stage {stage} circuit breaker is open")]
    CircuitOpen { stage: &'static str },

    #[error("RateLimitExceeded: stage {stage}")]
    RateLimitExceeded { stage: &'static str },

    #[error("stage {stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("routing failed: {0}")]
    Routing(String),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("stage failed: {0}")]
    Failed(String),
}

/// Contract implemented by every pipeline stage.
///
/// Stages take the envelope by value (single-consumer ownership) and are
/// invoked through a [`StageHarness`] which layers the shared policies.
#[async_trait]
pub trait Stage
where
    Self: Send + Sync,
{
    fn name(&self) -> &'static str;

    /// One-time setup once the pipeline starts (eg/ spawning sweep tasks).
    async fn init(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn process(
        &self,
        envelope: Envelope,
        ctx: &mut StageContext,
    ) -> Result<StageFlow, StageError>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Release owned resources. Called in reverse stage order on shutdown.
    async fn destroy(&self) {}
}

/// Per-stage configuration shared by every stage kind.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StageConfig {
    pub enabled: bool,
    /// Deadline for one `process` call.
    pub timeout_ms: Option<u64>,
    /// Overrides the pipeline-wide retry count for this stage.
    pub retry_count: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: Some(5_000),
            retry_count: None,
            retry_interval_ms: None,
            circuit_breaker: None,
            rate_limit: None,
        }
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Counters snapshot for one stage.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct StageMetrics {
    pub processed: u64,
    pub errors: u64,
    pub rejected: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct StageMetricsRecorder {
    processed: AtomicU64,
    errors: AtomicU64,
    rejected: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl StageMetricsRecorder {
    fn record(&self, elapsed: Duration, success: bool) {
        let latency_us = elapsed.as_micros() as u64;
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageMetrics {
        let processed = self.processed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let calls = processed + errors;
        let last_activity_ms = self.last_activity_ms.load(Ordering::Relaxed);

        StageMetrics {
            processed,
            errors,
            rejected: self.rejected.load(Ordering::Relaxed),
            avg_latency_us: if calls == 0 {
                0
            } else {
                self.total_latency_us.load(Ordering::Relaxed) / calls
            },
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
            last_activity_at: (last_activity_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_activity_ms).single())
                .flatten(),
        }
    }
}

/// Wrapper layering the shared stage policies around `process`, in order:
/// enabled pass-through, circuit breaker, rate limiter, timed invocation,
/// metrics.
pub struct StageHarness {
    name: &'static str,
    inner: Box<dyn Stage>,
    config: StageConfig,
    breaker: Option<CircuitBreaker>,
    limiter: Option<TokenBucket>,
    metrics: StageMetricsRecorder,
}

impl StageHarness {
    pub fn new(inner: Box<dyn Stage>, config: StageConfig) -> Self {
        Self {
            name: inner.name(),
            breaker: config.circuit_breaker.map(CircuitBreaker::new),
            limiter: config.rate_limit.map(TokenBucket::new),
            inner,
            config,
            metrics: StageMetricsRecorder::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn metrics(&self) -> StageMetrics {
        self.metrics.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        let circuit_ok = self
            .breaker
            .as_ref()
            .map_or(true, |breaker| breaker.state() != CircuitState::Open);
        circuit_ok && self.inner.is_healthy()
    }

    pub async fn init(&self) -> Result<(), StageError> {
        self.inner.init().await
    }

    pub async fn destroy(&self) {
        self.inner.destroy().await
    }

    pub async fn execute(
        &self,
        envelope: Envelope,
        ctx: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        if !self.config.enabled {
            return Ok(StageFlow::Continue(envelope));
        }

        if let Some(breaker) = &self.breaker {
            if !breaker.try_acquire() {
                self.metrics.record_rejected();
                return Err(StageError::CircuitOpen { stage: self.name });
            }
        }

        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire(1) {
                // The rejection is not a dependency failure: release the
                // breaker probe without recording an outcome.
                if let Some(breaker) = &self.breaker {
                    breaker.release();
                }
                self.metrics.record_rejected();
                return Err(StageError::RateLimitExceeded { stage: self.name });
            }
        }

        let started = Instant::now();
        let result = match self.config.timeout() {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.inner.process(envelope, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::Timeout {
                        stage: self.name,
                        timeout,
                    }),
                }
            }
            None => self.inner.process(envelope, ctx).await,
        };
        let elapsed = started.elapsed();

        ctx.stage_latencies.push((self.name, elapsed));

        match &result {
            Ok(_) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                self.metrics.record(elapsed, true);
            }
            Err(_) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
                self.metrics.record(elapsed, false);
            }
        }

        result
    }
}

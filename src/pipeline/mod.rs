use crate::envelope::{Envelope, EnvelopeId};
use crate::event::MarketEvent;
use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Per-stage circuit breaker.
pub mod breaker;

/// Partitioned buffer stage.
pub mod buffer;

/// Pure-predicate filter stage.
pub mod filter;

/// Token bucket rate limiter.
pub mod limiter;

/// Publisher output stage.
pub mod output;

/// Rule-engine router stage.
pub mod router;

/// Stage contract, policies harness and metrics.
pub mod stage;

/// Normalisation stage.
pub mod transform;

/// Pre-stage contract validation.
pub mod validate;

use stage::{Stage, StageConfig, StageContext, StageError, StageFlow, StageHarness, StageMetrics};

/// Quiet period after which a running pipeline is marked unhealthy.
const STALENESS_MS: i64 = 60_000;

/// How stage failures are handled by the orchestrator.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Abort the envelope, bubbling the error to the caller.
    FailFast,
    /// Count the error and hand the failing stage's *input* to the next
    /// stage unchanged.
    Continue,
    /// Retry the failing stage before applying the exhausted strategy.
    Retry,
}

/// Behaviour applied once `Retry` attempts are exhausted.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedStrategy {
    FailFast,
    Continue,
}

/// Pipeline error handling configuration.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub on_retry_exhausted: ExhaustedStrategy,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::Continue,
            max_retries: 3,
            retry_interval_ms: 100,
            on_retry_exhausted: ExhaustedStrategy::FailFast,
        }
    }
}

/// Worker pool sizing and ingress queue policy for the engine draining
/// adapters through the pipeline.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_concurrency: usize,
    pub queue_size: usize,
    /// Applied when the ingress queue is full. `Spill` degrades to `Drop` at
    /// ingress (there is nothing older to spill than the queue itself).
    pub backpressure_strategy: buffer::BackpressureStrategy,
    pub memory_limit_bytes: Option<u64>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_size: 1_024,
            backpressure_strategy: buffer::BackpressureStrategy::Block,
            memory_limit_bytes: None,
        }
    }
}

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,

    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: StageError,
    },
}

/// Counters snapshot for the pipeline stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub failed: u64,
    pub consumed: u64,
    pub outputs: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub last_activity_at: Option<chrono::DateTime<Utc>>,
}

/// Sink receiving envelopes whose processing failed terminally (after the
/// error strategy gave up). Optional; without one failed envelopes are only
/// counted.
pub type DeadLetterSink = std::sync::Arc<dyn Fn(Envelope) + Send + Sync>;

/// Result of one envelope's journey through the stage chain.
#[derive(Debug)]
pub struct PipelineReport {
    pub envelope_id: EnvelopeId,
    /// Envelopes that completed the full chain. Empty when consumed by a
    /// filter or buffer; more than one under router duplication.
    pub outputs: Vec<Envelope>,
    pub latency: Duration,
    pub stage_latencies: Vec<(&'static str, Duration)>,
    pub errors: Vec<String>,
}

/// Ordered stage chain executor.
///
/// Stages run strictly in order per envelope; concurrency comes from the
/// engine's worker pool invoking `process` on many envelopes at once, which
/// is safe because stages guard their own state.
pub struct Pipeline {
    stages: Vec<StageHarness>,
    error_handling: ErrorHandling,
    dead_letter: Option<DeadLetterSink>,
    envelope_seq: AtomicU64,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    consumed: AtomicU64,
    outputs: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Initialise every stage in order and mark the pipeline running.
    pub async fn init(&self) -> Result<(), PipelineError> {
        for harness in &self.stages {
            harness
                .init()
                .await
                .map_err(|source| PipelineError::StageFailed {
                    stage: harness.name(),
                    source,
                })?;
        }

        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting envelopes and destroy stages in reverse dependency
    /// order, draining buffered data.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for harness in self.stages.iter().rev() {
            harness.destroy().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Healthy iff running, every stage healthy, and activity within the
    /// staleness window.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        if !self.stages.iter().all(StageHarness::is_healthy) {
            return false;
        }
        let last_activity = self.last_activity_ms.load(Ordering::Relaxed);
        Utc::now().timestamp_millis() - last_activity <= STALENESS_MS
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let calls = processed + failed;
        let last_activity_ms = self.last_activity_ms.load(Ordering::Relaxed);

        PipelineMetrics {
            processed,
            failed,
            consumed: self.consumed.load(Ordering::Relaxed),
            outputs: self.outputs.load(Ordering::Relaxed),
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

    /// Per-stage metric snapshots, in chain order.
    pub fn stage_metrics(&self) -> Vec<(&'static str, StageMetrics)> {
        self.stages
            .iter()
            .map(|harness| (harness.name(), harness.metrics()))
            .collect()
    }

    /// Run one [`MarketEvent`] through the stage chain.
    pub async fn process(&self, event: MarketEvent) -> Result<PipelineReport, PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }

        let envelope_id = EnvelopeId(self.envelope_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let envelope = Envelope::new(envelope_id, event);
        let mut ctx = StageContext::new(envelope_id.0);

        let started = Instant::now();
        let result = self.run_chain(envelope, &mut ctx, 0).await;
        let latency = started.elapsed();

        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        let latency_us = latency.as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);

        match result {
            Ok(outputs) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                if outputs.is_empty() {
                    self.consumed.fetch_add(1, Ordering::Relaxed);
                }
                self.outputs
                    .fetch_add(outputs.len() as u64, Ordering::Relaxed);

                Ok(PipelineReport {
                    envelope_id,
                    outputs,
                    latency,
                    stage_latencies: ctx.stage_latencies,
                    errors: ctx.errors,
                })
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    fn run_chain<'a>(
        &'a self,
        mut envelope: Envelope,
        ctx: &'a mut StageContext,
        start: usize,
    ) -> BoxFuture<'a, Result<Vec<Envelope>, PipelineError>> {
        Box::pin(async move {
            for index in start..self.stages.len() {
                let harness = &self.stages[index];
                let strategy = self.error_handling.strategy;

                // Keep the stage's input where the strategy may need to
                // re-feed it, or the dead letter sink to capture it.
                let backup = (matches!(
                    strategy,
                    ErrorStrategy::Continue | ErrorStrategy::Retry
                ) || self.dead_letter.is_some())
                .then(|| envelope.clone());

                let mut outcome = harness.execute(envelope, ctx).await;

                if let (Err(_), ErrorStrategy::Retry, Some(backup)) =
                    (&outcome, strategy, &backup)
                {
                    let retries = harness
                        .config()
                        .retry_count
                        .unwrap_or(self.error_handling.max_retries);
                    let interval = Duration::from_millis(
                        harness
                            .config()
                            .retry_interval_ms
                            .unwrap_or(self.error_handling.retry_interval_ms),
                    );

                    let mut attempt = 0;
                    while outcome.is_err() && attempt < retries {
                        attempt += 1;
                        tokio::time::sleep(interval).await;

                        let mut retry_envelope = backup.clone();
                        retry_envelope.metadata.retry_count = attempt;
                        outcome = harness.execute(retry_envelope, ctx).await;
                    }
                }

                match outcome {
                    Ok(StageFlow::Continue(next)) => envelope = next,
                    Ok(StageFlow::Consumed) => return Ok(Vec::new()),
                    Ok(StageFlow::Split(copies)) => {
                        // Each copy is independently owned and continues
                        // through the remaining stages on its own.
                        let mut outputs = Vec::new();
                        for copy in copies {
                            let mut child_ctx = StageContext::new(ctx.correlation_id);
                            outputs
                                .extend(self.run_chain(copy, &mut child_ctx, index + 1).await?);
                            ctx.stage_latencies.extend(child_ctx.stage_latencies);
                            ctx.errors.extend(child_ctx.errors);
                            ctx.warnings.extend(child_ctx.warnings);
                        }
                        return Ok(outputs);
                    }
                    Err(error) => {
                        ctx.errors.push(format!("{}: {error}", harness.name()));

                        let continue_on = match strategy {
                            ErrorStrategy::FailFast => false,
                            ErrorStrategy::Continue => true,
                            ErrorStrategy::Retry => {
                                self.error_handling.on_retry_exhausted
                                    == ExhaustedStrategy::Continue
                            }
                        };

                        match (continue_on, backup) {
                            (true, Some(backup)) => {
                                warn!(
                                    stage = harness.name(),
                                    %error,
                                    "stage failed, continuing with its input envelope"
                                );
                                envelope = backup;
                            }
                            (_, backup) => {
                                if let (Some(dead_letter), Some(input)) =
                                    (&self.dead_letter, backup)
                                {
                                    dead_letter(input);
                                }
                                return Err(PipelineError::StageFailed {
                                    stage: harness.name(),
                                    source: error,
                                });
                            }
                        }
                    }
                }
            }

            if envelope.processed_at.is_none() {
                envelope.processed_at = Some(Utc::now());
            }
            Ok(vec![envelope])
        })
    }
}

/// Builder assembling the ordered stage chain.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<StageHarness>,
    error_handling: ErrorHandling,
    dead_letter: Option<DeadLetterSink>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Attach a sink receiving envelopes that fail terminally.
    pub fn dead_letter(mut self, sink: DeadLetterSink) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Append a stage with its policy configuration.
    pub fn stage<S>(mut self, stage: S, config: StageConfig) -> Self
    where
        S: Stage + 'static,
    {
        self.stages.push(StageHarness::new(Box::new(stage), config));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            error_handling: self.error_handling,
            dead_letter: self.dead_letter,
            envelope_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            outputs: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
        }
    }
}

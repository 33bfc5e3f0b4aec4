use super::stage::{Stage, StageContext, StageError, StageFlow};
use crate::envelope::Envelope;
use crate::publish::Dispatcher;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Built-in partition key functions.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    Exchange,
    ExchangeSymbol,
    ExchangeDataType,
}

/// Policy applied when buffer pressure crosses the threshold.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Producers wait until pressure drops. Latency, no loss.
    Block,
    /// The incoming envelope is dropped and counted.
    Drop,
    /// Oldest buffered envelopes are handed to the spill sink; the queue
    /// keeps accepting.
    Spill,
}

/// Partitioned buffer configuration.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bound of each partition queue.
    pub max_size: usize,
    /// Oldest-item age forcing a flush.
    pub max_age_ms: u64,
    /// Idle interval forcing a periodic flush.
    pub flush_interval_ms: u64,
    /// Fill ratio in `[0, 1]` at which the backpressure policy applies.
    pub backpressure_threshold: f64,
    pub strategy: BackpressureStrategy,
    pub partition_by: PartitionBy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            max_age_ms: 5_000,
            flush_interval_ms: 1_000,
            backpressure_threshold: 0.8,
            strategy: BackpressureStrategy::Block,
            partition_by: PartitionBy::ExchangeSymbol,
        }
    }
}

impl BufferConfig {
    fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Periodic sweep cadence: `min(flush_interval, 1s)`.
    fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.min(1_000).max(1))
    }
}

/// Sink receiving spilled envelopes under the `Spill` policy (disk or a
/// secondary store).
pub trait SpillSink
where
    Self: Send + Sync,
{
    fn spill(&self, envelopes: Vec<Envelope>);
}

/// Custom partition key function.
pub type PartitionFn = Arc<dyn Fn(&Envelope) -> String + Send + Sync>;

enum PartitionScheme {
    Builtin(PartitionBy),
    Custom(PartitionFn),
}

impl Debug for PartitionScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionScheme::Builtin(by) => write!(f, "Builtin({by:?})"),
            PartitionScheme::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Counters snapshot for the buffer stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct BufferStats {
    pub enqueued: u64,
    pub flushed_batches: u64,
    pub flushed_items: u64,
    pub dropped: u64,
    pub spilled: u64,
    pub publish_errors: u64,
    pub partitions: usize,
    pub buffered: usize,
    pub bytes_approx: usize,
}

struct Partition {
    items: VecDeque<Envelope>,
    last_flush: Instant,
    inflight: bool,
    bytes_approx: usize,
}

impl Partition {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            last_flush: Instant::now(),
            inflight: false,
            bytes_approx: 0,
        }
    }
}

struct BufferInner {
    config: BufferConfig,
    scheme: PartitionScheme,
    partitions: Mutex<HashMap<String, Partition>>,
    dispatcher: Arc<Dispatcher>,
    spill_sink: Option<Arc<dyn SpillSink>>,
    enqueued: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_items: AtomicU64,
    dropped: AtomicU64,
    spilled: AtomicU64,
    publish_errors: AtomicU64,
    sweeper_started: AtomicBool,
    closed: AtomicBool,
}

impl BufferInner {
    fn partition_key(&self, envelope: &Envelope) -> String {
        match &self.scheme {
            PartitionScheme::Builtin(PartitionBy::Exchange) => {
                envelope.event.exchange.as_str().to_string()
            }
            PartitionScheme::Builtin(PartitionBy::ExchangeSymbol) => format!(
                "{}:{}",
                envelope.event.exchange.as_str(),
                envelope.event.symbol
            ),
            PartitionScheme::Builtin(PartitionBy::ExchangeDataType) => format!(
                "{}:{}",
                envelope.event.exchange.as_str(),
                envelope.event.data_type()
            ),
            PartitionScheme::Custom(partition_fn) => partition_fn(envelope),
        }
    }

    /// Fill ratio across all partitions: `total / (max_size * partitions)`.
    /// Defined as 0 when no partitions exist.
    fn pressure(&self) -> f64 {
        let partitions = self.partitions.lock();
        if partitions.is_empty() {
            return 0.0;
        }
        let total: usize = partitions.values().map(|p| p.items.len()).sum();
        total as f64 / (self.config.max_size as f64 * partitions.len() as f64)
    }

    fn approx_size(envelope: &Envelope) -> usize {
        std::mem::size_of::<Envelope>() + envelope.event.symbol.as_str().len()
    }

    /// Drain the partition's queue (atomic swap with a fresh queue) and hand
    /// the batch to the dispatcher. At most one flush per partition is in
    /// flight.
    fn trigger_flush(self: &Arc<Self>, key: String) {
        let batch = {
            let mut partitions = self.partitions.lock();
            let Some(partition) = partitions.get_mut(&key) else {
                return;
            };
            if partition.inflight || partition.items.is_empty() {
                return;
            }
            partition.inflight = true;
            partition.last_flush = Instant::now();
            partition.bytes_approx = 0;
            std::mem::take(&mut partition.items)
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let batch: Vec<Envelope> = batch.into();
            let count = batch.len();

            match inner.dispatcher.dispatch_batch(&batch).await {
                Ok(result) => {
                    inner.flushed_batches.fetch_add(1, Ordering::Relaxed);
                    inner
                        .flushed_items
                        .fetch_add(count as u64, Ordering::Relaxed);
                    if !result.is_complete_success() {
                        inner
                            .publish_errors
                            .fetch_add(result.failure_count as u64, Ordering::Relaxed);
                        warn!(
                            partition = %key,
                            failed = result.failure_count,
                            "partition flush partially failed"
                        );
                    }
                }
                Err(error) => {
                    inner.publish_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(partition = %key, %error, "partition flush failed");
                }
            }

            if let Some(partition) = inner.partitions.lock().get_mut(&key) {
                partition.inflight = false;
            }
        });
    }

    /// Flush partitions whose age or idle-interval trigger fired.
    fn sweep(self: &Arc<Self>) {
        let due: Vec<String> = {
            let partitions = self.partitions.lock();
            partitions
                .iter()
                .filter_map(|(key, partition)| {
                    if partition.inflight || partition.items.is_empty() {
                        return None;
                    }

                    let oldest_age_ms = partition
                        .items
                        .front()
                        .map(|envelope| {
                            (Utc::now() - envelope.queued_at).num_milliseconds().max(0) as u64
                        })
                        .unwrap_or(0);

                    let due_age = oldest_age_ms >= self.config.max_age_ms;
                    let due_interval =
                        partition.last_flush.elapsed() >= self.config.flush_interval();
                    (due_age || due_interval).then(|| key.clone())
                })
                .collect()
        };

        for key in due {
            self.trigger_flush(key);
        }
    }

    /// Hand the oldest half of every partition queue to the spill sink.
    fn spill_oldest(&self) {
        let mut spilled = Vec::new();
        {
            let mut partitions = self.partitions.lock();
            for partition in partitions.values_mut() {
                let take = (partition.items.len() + 1) / 2;
                spilled.extend(partition.items.drain(..take));
            }
        }

        if spilled.is_empty() {
            return;
        }

        let count = spilled.len() as u64;
        match &self.spill_sink {
            Some(sink) => {
                self.spilled.fetch_add(count, Ordering::Relaxed);
                sink.spill(spilled);
            }
            None => {
                // Without a spill target the policy degrades to dropping the
                // oldest items.
                self.dropped.fetch_add(count, Ordering::Relaxed);
                warn!(count, "spill requested but no spill sink configured, dropping oldest");
            }
        }
    }

    fn stats(&self) -> BufferStats {
        let (partitions, buffered, bytes_approx) = {
            let partitions = self.partitions.lock();
            let buffered = partitions.values().map(|p| p.items.len()).sum();
            let bytes_approx = partitions.values().map(|p| p.bytes_approx).sum();
            (partitions.len(), buffered, bytes_approx)
        };

        BufferStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            flushed_items: self.flushed_items.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            partitions,
            buffered,
            bytes_approx,
        }
    }
}

/// Partitioned buffer stage: per-partition bounded FIFO queues with size,
/// age and interval flush triggers.
///
/// `process` consumes the envelope; delivery happens asynchronously on
/// flush. Per-partition FIFO order is preserved through the batch, and at
/// most one flush per partition is in flight at a time.
pub struct BufferStage {
    inner: Arc<BufferInner>,
}

impl BufferStage {
    pub fn new(config: BufferConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self::build(config, dispatcher, None, None)
    }

    /// Override the partition key function.
    pub fn with_partition_fn(
        config: BufferConfig,
        dispatcher: Arc<Dispatcher>,
        partition_fn: PartitionFn,
    ) -> Self {
        Self::build(config, dispatcher, Some(partition_fn), None)
    }

    /// Attach a spill sink for the `Spill` backpressure policy.
    pub fn with_spill_sink(
        config: BufferConfig,
        dispatcher: Arc<Dispatcher>,
        spill_sink: Arc<dyn SpillSink>,
    ) -> Self {
        Self::build(config, dispatcher, None, Some(spill_sink))
    }

    fn build(
        config: BufferConfig,
        dispatcher: Arc<Dispatcher>,
        partition_fn: Option<PartitionFn>,
        spill_sink: Option<Arc<dyn SpillSink>>,
    ) -> Self {
        let scheme = match partition_fn {
            Some(partition_fn) => PartitionScheme::Custom(partition_fn),
            None => PartitionScheme::Builtin(config.partition_by),
        };

        Self {
            inner: Arc::new(BufferInner {
                config,
                scheme,
                partitions: Mutex::new(HashMap::new()),
                dispatcher,
                spill_sink,
                enqueued: AtomicU64::new(0),
                flushed_batches: AtomicU64::new(0),
                flushed_items: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                spilled: AtomicU64::new(0),
                publish_errors: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.stats()
    }

    /// Current buffer pressure in `[0, 1]`.
    pub fn pressure(&self) -> f64 {
        self.inner.pressure()
    }
}

#[async_trait]
impl Stage for BufferStage {
    fn name(&self) -> &'static str {
        "buffer"
    }

    async fn init(&self) -> Result<(), StageError> {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep();
            }
        });
        Ok(())
    }

    async fn process(
        &self,
        mut envelope: Envelope,
        _: &mut StageContext,
    ) -> Result<StageFlow, StageError> {
        let key = self.inner.partition_key(&envelope);

        // Backpressure policy at the configured fill ratio.
        while self.inner.pressure() >= self.inner.config.backpressure_threshold {
            match self.inner.config.strategy {
                BackpressureStrategy::Block => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                BackpressureStrategy::Drop => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(partition = %key, "buffer pressure drop");
                    return Ok(StageFlow::Consumed);
                }
                BackpressureStrategy::Spill => {
                    self.inner.spill_oldest();
                    break;
                }
            }
        }

        envelope.metadata.partition_key = Some(key.clone());

        let flush_now = {
            let mut partitions = self.inner.partitions.lock();
            let partition = partitions.entry(key.clone()).or_insert_with(Partition::new);

            // Drop-oldest on queue overflow: eject to make room.
            while partition.items.len() >= self.inner.config.max_size {
                partition.items.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }

            partition.bytes_approx += BufferInner::approx_size(&envelope);
            partition.items.push_back(envelope);
            self.inner.enqueued.fetch_add(1, Ordering::Relaxed);

            let oldest_age_ms = partition
                .items
                .front()
                .map(|envelope| (Utc::now() - envelope.queued_at).num_milliseconds().max(0) as u64)
                .unwrap_or(0);

            partition.items.len() >= self.inner.config.max_size
                || oldest_age_ms >= self.inner.config.max_age_ms
        };

        if flush_now {
            self.inner.trigger_flush(key);
        }

        // Delivery happens asynchronously on flush.
        Ok(StageFlow::Consumed)
    }

    async fn destroy(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        // Final drain, preserving per-partition order.
        let batches: Vec<Vec<Envelope>> = {
            let mut partitions = self.inner.partitions.lock();
            partitions
                .values_mut()
                .filter(|partition| !partition.items.is_empty())
                .map(|partition| std::mem::take(&mut partition.items).into())
                .collect()
        };

        for batch in batches {
            let count = batch.len() as u64;
            match self.inner.dispatcher.dispatch_batch(&batch).await {
                Ok(_) => {
                    self.inner.flushed_batches.fetch_add(1, Ordering::Relaxed);
                    self.inner.flushed_items.fetch_add(count, Ordering::Relaxed);
                }
                Err(error) => {
                    self.inner.publish_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%error, "final buffer drain failed");
                }
            }
        }
    }
}

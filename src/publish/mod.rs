use crate::envelope::Envelope;
use crate::exchange::ExchangeId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Downstream sink failures. Retryability follows the injected publisher's
/// semantics; batch publish may partially succeed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish rejected by sink: {0}")]
    Rejected(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("publisher is closed")]
    Closed,

    #[error("payload serialisation failed: {0}")]
    Serialise(#[from] serde_json::Error),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Timeout(_))
    }
}

/// One message of a batch publish.
#[derive(Clone, Debug)]
pub struct BatchEntry {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// Result of a batch publish, with partial success information.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BatchPublishResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// Indices (within the submitted batch) of entries that failed.
    pub failed_ids: Vec<usize>,
    pub publish_time: DateTime<Utc>,
}

impl BatchPublishResult {
    pub fn all_successful(count: usize) -> Self {
        Self {
            success_count: count,
            failure_count: 0,
            failed_ids: Vec::new(),
            publish_time: Utc::now(),
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failure_count == 0
    }

    /// Fold another batch result into this one. Failed ids keep their
    /// original per-batch indices.
    pub fn merge(&mut self, other: BatchPublishResult) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.failed_ids.extend(other.failed_ids);
        self.publish_time = self.publish_time.max(other.publish_time);
    }
}

/// Injected publish/subscribe client contract.
///
/// The concrete implementation lives outside the core; at-least-once
/// delivery with dedupe hints is assumed, never exactly-once.
#[async_trait]
pub trait Publisher
where
    Self: Send + Sync,
{
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<(), PublishError>;

    async fn publish_batch(
        &self,
        topic: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchPublishResult, PublishError>;
}

/// Default topic for an exchange: `{prefix}-market-data-{exchange}`. Router
/// targets may override to any string; topic names are treated opaquely.
pub fn default_topic(prefix: &str, exchange: ExchangeId) -> String {
    format!("{prefix}-market-data-{exchange}")
}

/// Facade resolving topics, payloads and message attributes for envelopes
/// handed to the injected [`Publisher`]. Shared by the output and buffer
/// stages.
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    topic_prefix: String,
    source: String,
}

impl Dispatcher {
    pub fn new<P, S>(publisher: Arc<dyn Publisher>, topic_prefix: P, source: S) -> Self
    where
        P: Into<String>,
        S: Into<String>,
    {
        Self {
            publisher,
            topic_prefix: topic_prefix.into(),
            source: source.into(),
        }
    }

    /// Destination topics for an envelope: the routing keys resolved by the
    /// router stage, or the exchange default when none were.
    pub fn topics_for(&self, envelope: &Envelope) -> Vec<String> {
        if envelope.metadata.routing_keys.is_empty() {
            vec![default_topic(&self.topic_prefix, envelope.event.exchange)]
        } else {
            envelope.metadata.routing_keys.clone()
        }
    }

    /// Required per-message attributes, merged over the envelope's bag.
    pub fn attributes(&self, envelope: &Envelope) -> HashMap<String, String> {
        let mut attributes = envelope.attributes.clone();
        attributes.insert(
            "exchange".to_string(),
            envelope.event.exchange.as_str().to_string(),
        );
        attributes.insert("symbol".to_string(), envelope.event.symbol.to_string());
        attributes.insert("type".to_string(), envelope.event.data_type().to_string());
        attributes.insert(
            "timestamp".to_string(),
            envelope.event.exchange_time.timestamp_millis().to_string(),
        );
        attributes.insert("source".to_string(), self.source.clone());
        attributes.insert(
            "processedAt".to_string(),
            envelope
                .processed_at
                .unwrap_or_else(Utc::now)
                .timestamp_millis()
                .to_string(),
        );
        attributes
    }

    fn payload(envelope: &Envelope) -> Result<Vec<u8>, PublishError> {
        Ok(serde_json::to_vec(&envelope.event)?)
    }

    /// Publish one envelope to every resolved topic.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), PublishError> {
        let payload = Self::payload(envelope)?;
        let attributes = self.attributes(envelope);

        for topic in self.topics_for(envelope) {
            self.publisher
                .publish(&topic, payload.clone(), attributes.clone())
                .await?;
        }
        Ok(())
    }

    /// Publish a batch of envelopes, grouped by topic with per-topic FIFO
    /// order preserved.
    pub async fn dispatch_batch(
        &self,
        envelopes: &[Envelope],
    ) -> Result<BatchPublishResult, PublishError> {
        let mut order = Vec::new();
        let mut grouped: HashMap<String, Vec<BatchEntry>> = HashMap::new();

        for envelope in envelopes {
            let payload = Self::payload(envelope)?;
            let attributes = self.attributes(envelope);

            for topic in self.topics_for(envelope) {
                if !grouped.contains_key(&topic) {
                    order.push(topic.clone());
                }
                grouped.entry(topic).or_default().push(BatchEntry {
                    payload: payload.clone(),
                    attributes: attributes.clone(),
                });
            }
        }

        let mut result = BatchPublishResult::all_successful(0);
        for topic in order {
            let entries = grouped.remove(&topic).unwrap_or_default();
            result.merge(self.publisher.publish_batch(&topic, entries).await?);
        }
        Ok(result)
    }
}

/// Recorded message captured by the [`MemoryPublisher`].
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// In-memory [`Publisher`] for tests and local runs. Collects every message
/// and can be toggled to fail.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Snapshot of every published message, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.messages.lock().clone()
    }

    /// Messages published to the provided topic, in publish order.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<(), PublishError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PublishError::Rejected("memory publisher failing".to_string()));
        }

        self.messages.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            attributes,
        });
        Ok(())
    }

    async fn publish_batch(
        &self,
        topic: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchPublishResult, PublishError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PublishError::Rejected("memory publisher failing".to_string()));
        }

        let count = entries.len();
        let mut messages = self.messages.lock();
        for entry in entries {
            messages.push(PublishedMessage {
                topic: topic.to_string(),
                payload: entry.payload,
                attributes: entry.attributes,
            });
        }
        Ok(BatchPublishResult::all_successful(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeId;
    use crate::event::test_util;
    use rust_decimal_macros::dec;

    fn envelope(id: u64, exchange: ExchangeId, symbol: &str) -> Envelope {
        Envelope::new(
            EnvelopeId(id),
            test_util::market_trade(exchange, symbol, dec!(100)),
        )
    }

    #[test]
    fn test_default_topic_naming() {
        assert_eq!(
            default_topic("prod", ExchangeId::Binance),
            "prod-market-data-binance"
        );
        assert_eq!(default_topic("t", ExchangeId::Okx), "t-market-data-okx");
    }

    #[tokio::test]
    async fn test_dispatch_applies_required_attributes() {
        let publisher = Arc::new(MemoryPublisher::new());
        let dispatcher = Dispatcher::new(publisher.clone(), "t", "ingest-1");

        let envelope = envelope(1, ExchangeId::Binance, "BTCUSDT");
        dispatcher.dispatch(&envelope).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.topic, "t-market-data-binance");
        assert_eq!(message.attributes["exchange"], "binance");
        assert_eq!(message.attributes["symbol"], "BTCUSDT");
        assert_eq!(message.attributes["type"], "trade");
        assert_eq!(message.attributes["source"], "ingest-1");
        assert!(message.attributes.contains_key("timestamp"));
        assert!(message.attributes.contains_key("processedAt"));
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_on_routing_keys() {
        let publisher = Arc::new(MemoryPublisher::new());
        let dispatcher = Dispatcher::new(publisher.clone(), "t", "ingest-1");

        let mut envelope = envelope(1, ExchangeId::Binance, "BTCUSDT");
        envelope.metadata.routing_keys = vec!["alpha".to_string(), "beta".to_string()];

        dispatcher.dispatch(&envelope).await.unwrap();
        assert_eq!(publisher.published_to("alpha").len(), 1);
        assert_eq!(publisher.published_to("beta").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_batch_groups_by_topic_preserving_order() {
        let publisher = Arc::new(MemoryPublisher::new());
        let dispatcher = Dispatcher::new(publisher.clone(), "t", "ingest-1");

        let envelopes = vec![
            envelope(1, ExchangeId::Binance, "BTCUSDT"),
            envelope(2, ExchangeId::Okx, "BTCUSDT"),
            envelope(3, ExchangeId::Binance, "ETHUSDT"),
        ];

        let result = dispatcher.dispatch_batch(&envelopes).await.unwrap();
        assert_eq!(result.success_count, 3);
        assert!(result.is_complete_success());

        let binance = publisher.published_to("t-market-data-binance");
        assert_eq!(binance.len(), 2);
        // FIFO within the topic: BTCUSDT before ETHUSDT.
        assert_eq!(binance[0].attributes["symbol"], "BTCUSDT");
        assert_eq!(binance[1].attributes["symbol"], "ETHUSDT");
        assert_eq!(publisher.published_to("t-market-data-okx").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_publisher_surfaces_error() {
        let publisher = Arc::new(MemoryPublisher::new());
        publisher.set_failing(true);
        let dispatcher = Dispatcher::new(publisher, "t", "ingest-1");

        let result = dispatcher.dispatch(&envelope(1, ExchangeId::Binance, "BTCUSDT")).await;
        assert!(matches!(result, Err(PublishError::Rejected(_))));
    }
}

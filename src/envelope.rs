use crate::event::MarketEvent;
use crate::exchange::ExchangeId;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Process-local identifier of a pipeline [`Envelope`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[display("env-{_0}")]
pub struct EnvelopeId(pub u64);

/// Pipeline metadata carried alongside a [`MarketEvent`].
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct EnvelopeMetadata {
    /// Scheduling priority, higher first.
    pub priority: u8,
    pub retry_count: u32,
    /// Destination topics resolved by the router stage.
    pub routing_keys: Vec<String>,
    /// Partition assignment resolved by the buffer stage.
    pub partition_key: Option<String>,
}

impl Default for EnvelopeMetadata {
    fn default() -> Self {
        Self {
            priority: 128,
            retry_count: 0,
            routing_keys: Vec::new(),
            partition_key: None,
        }
    }
}

/// Wrapper around a [`MarketEvent`] flowing through the pipeline.
///
/// Single-consumer: exactly one stage owns an envelope at a time, taking it
/// by value and either passing it (possibly replaced) onward or consuming it.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub source: ExchangeId,
    pub event: MarketEvent,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Mutable attribute bag stamped by stages, published as message
    /// attributes.
    pub attributes: HashMap<String, String>,
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    pub fn new(id: EnvelopeId, event: MarketEvent) -> Self {
        Self {
            id,
            source: event.exchange,
            event,
            queued_at: Utc::now(),
            processed_at: None,
            attributes: HashMap::new(),
            metadata: EnvelopeMetadata::default(),
        }
    }

    /// Independent copy routed to a single destination, used by router
    /// duplication mode. Copies share the original envelope id: they are the
    /// same ingested record.
    pub fn duplicate_for(&self, routing_key: &str) -> Self {
        let mut copy = self.clone();
        copy.metadata.routing_keys = vec![routing_key.to_string()];
        copy
    }
}

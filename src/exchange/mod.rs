use crate::connection::{ConnectionConfig, ConnectionId};
use crate::error::{DataError, ErrorRecord};
use crate::event::MarketEvent;
use crate::subscription::registry::{SubscribeSummary, UnsubscribeSummary};
use crate::subscription::{DataTypeKind, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

/// `Binance` adapter: combined-stream WebSocket ingest.
pub mod binance;

/// SerDe deserialisation helpers for exchange wire models.
pub mod de;

/// Identifier of a supported exchange venue.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename = "exchange", rename_all = "snake_case")]
pub enum ExchangeId {
    #[display("binance")]
    Binance,
    #[display("okx")]
    Okx,
    #[display("kraken")]
    Kraken,
}

impl ExchangeId {
    /// Return the &str representation this [`ExchangeId`] is associated with.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Okx => "okx",
            ExchangeId::Kraken => "kraken",
        }
    }

    /// Determines whether this [`ExchangeId`] supports the ingestion of the
    /// provided class of market data.
    pub fn supports(&self, kind: DataTypeKind) -> bool {
        match kind {
            DataTypeKind::Trade | DataTypeKind::Ticker | DataTypeKind::Depth => true,
            DataTypeKind::Kline => match self {
                ExchangeId::Binance => true,
                ExchangeId::Okx => true,
                ExchangeId::Kraken => false,
            },
        }
    }
}

/// Lifecycle status of a [`MarketDataAdapter`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    #[display("initializing")]
    Initializing,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("subscribing")]
    Subscribing,
    #[display("active")]
    Active,
    #[display("reconnecting")]
    Reconnecting,
    #[display("error")]
    Error,
    #[display("stopped")]
    Stopped,
}

/// Typed event stream emitted by a [`MarketDataAdapter`].
#[derive(Clone, Debug)]
pub enum AdapterEvent {
    StatusChanged {
        from: AdapterStatus,
        to: AdapterStatus,
    },
    Connected {
        connection: ConnectionId,
    },
    Disconnected {
        connection: ConnectionId,
    },
    Data(MarketEvent),
    Error(ErrorRecord),
    Subscribed(Vec<Subscription>),
    Unsubscribed(Vec<Subscription>),
}

/// Counters snapshot for the adapter stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct AdapterStats {
    pub messages: u64,
    pub parse_errors: u64,
    pub events: u64,
    pub reconnects: u64,
    pub active_subscriptions: usize,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Exchange adapter configuration surface.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub ws_endpoint: Url,
    pub rest_endpoint: Option<Url>,
    pub max_connections: usize,
    /// Clamped to the combined-stream protocol limit of 1024.
    pub max_streams_per_connection: usize,
    pub heartbeat_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    /// Debounce window for batching remote subscription updates.
    pub resubscribe_debounce_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: Url::parse("wss://stream.binance.com:9443")
                .expect("static default URL is valid"),
            rest_endpoint: None,
            max_connections: 4,
            max_streams_per_connection: crate::codec::DEFAULT_MAX_STREAMS,
            heartbeat_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            resubscribe_debounce_ms: 500,
        }
    }
}

impl AdapterConfig {
    /// Derive the per-connection behavioural configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            ping_timeout_ms: self.ping_timeout_ms,
            connection_timeout_ms: self.connection_timeout_ms,
            resubscribe_debounce_ms: self.resubscribe_debounce_ms,
            auto_manage_streams: true,
            idle_timeout_ms: ConnectionConfig::default().idle_timeout_ms,
            max_streams: self
                .max_streams_per_connection
                .min(crate::codec::DEFAULT_MAX_STREAMS),
        }
    }
}

/// Uniform contract implemented by every exchange adapter.
///
/// An adapter owns its connection pool and subscription registry, parses raw
/// exchange frames into normalised [`MarketEvent`]s, and reports lifecycle
/// transitions over its typed [`AdapterEvent`] channel.
#[async_trait]
pub trait MarketDataAdapter
where
    Self: Send + Sync,
{
    fn exchange(&self) -> ExchangeId;

    /// Validate configuration and prepare internal components.
    async fn initialize(&mut self) -> Result<(), DataError>;

    /// Begin consuming connection events and emitting [`AdapterEvent`]s.
    async fn start(&mut self) -> Result<(), DataError>;

    /// Stop ingress and close every connection.
    async fn stop(&mut self) -> Result<(), DataError>;

    /// Stop and release every owned resource, clearing the registry.
    async fn destroy(&mut self) -> Result<(), DataError>;

    /// Register subscriptions and apply the batched remote update.
    async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubscribeSummary, DataError>;

    /// Remove subscriptions and apply the batched remote update.
    async fn unsubscribe(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<UnsubscribeSummary, DataError>;

    fn status(&self) -> AdapterStatus;

    fn stats(&self) -> AdapterStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_id_as_str() {
        assert_eq!(ExchangeId::Binance.as_str(), "binance");
        assert_eq!(ExchangeId::Okx.as_str(), "okx");
        assert_eq!(ExchangeId::Binance.to_string(), "binance");
    }

    #[test]
    fn test_exchange_id_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExchangeId::Binance).unwrap(),
            "\"binance\""
        );
        assert_eq!(
            serde_json::from_str::<ExchangeId>("\"okx\"").unwrap(),
            ExchangeId::Okx
        );
    }

    #[test]
    fn test_adapter_config_clamps_stream_cap() {
        let config = AdapterConfig {
            max_streams_per_connection: 5_000,
            ..AdapterConfig::default()
        };
        assert_eq!(config.connection_config().max_streams, 1024);
    }
}

use crate::codec::CodecError;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::debug;
use url::Url;

/// Exponential backoff with jitter for reconnect scheduling.
pub mod backoff;

/// Actor owning one exchange WebSocket connection.
pub mod manager;

/// Set of [`manager::ConnectionManager`]s for one adapter, grown once the
/// per-connection stream cap is exceeded.
pub mod pool;

/// Convenient type alias for a tungstenite `WebSocketStream`.
pub type WebSocket = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Communicative type alias for a tungstenite [`WebSocket`] `Message`.
pub type WsMessage = tokio_tungstenite::tungstenite::Message;

/// Communicative type alias for a tungstenite [`WebSocket`] `Error`.
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Unique identifier of one WebSocket connection within an adapter.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[display("conn-{_0}")]
pub struct ConnectionId(pub u64);

/// Lifecycle state of a [`manager::ConnectionManager`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("disconnecting")]
    Disconnecting,
}

/// Behavioural configuration of a [`manager::ConnectionManager`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval_ms: u64,
    /// Missing pong after this long is treated as connection loss.
    pub ping_timeout_ms: u64,
    /// Deadline for establishing a connection.
    pub connection_timeout_ms: u64,
    /// Debounce window for batching remote stream set updates.
    pub resubscribe_debounce_ms: u64,
    /// Whether stream set changes schedule a remote update automatically.
    pub auto_manage_streams: bool,
    /// Idle pooled connections are closed after this long.
    pub idle_timeout_ms: u64,
    /// Maximum logical streams multiplexed onto this connection.
    pub max_streams: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            resubscribe_debounce_ms: 500,
            auto_manage_streams: true,
            idle_timeout_ms: 300_000,
            max_streams: crate::codec::DEFAULT_MAX_STREAMS,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn resubscribe_debounce(&self) -> Duration {
        Duration::from_millis(self.resubscribe_debounce_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Events emitted by a [`manager::ConnectionManager`] over its typed channel.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Connection established (initial or reconnect).
    Connected { connection: ConnectionId },
    /// Connection lost or closed.
    Disconnected { connection: ConnectionId },
    /// Inbound text frame.
    Message { connection: ConnectionId, text: String },
    /// Measured heartbeat round-trip latency.
    Latency { connection: ConnectionId, rtt: Duration },
}

/// Transport-level connection failures. Retryable with backoff; never fatal
/// on their own.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to establish WebSocket connection: {0}")]
    Connect(Box<WsError>),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<WsError>),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no pong received within {0:?}")]
    PongTimeout(Duration),

    #[error("connection is not established")]
    NotConnected,

    #[error("connection manager has stopped")]
    ManagerStopped,

    #[error("combined stream construction failed: {0}")]
    Codec(#[from] CodecError),
}

/// Connect asynchronously to a WebSocket server.
pub async fn connect(url: &Url) -> Result<WebSocket, ConnectionError> {
    debug!(%url, "attempting to establish WebSocket connection");
    connect_async(url.as_str())
        .await
        .map(|(websocket, _)| websocket)
        .map_err(|error| ConnectionError::Connect(Box::new(error)))
}

/// Determine whether a [`WsError`] indicates the [`WebSocket`] has
/// disconnected.
pub fn is_websocket_disconnected(error: &WsError) -> bool {
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

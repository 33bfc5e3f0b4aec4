use crate::connection::WsError;
use thiserror::Error;

/// Multi-dimensional per-client filter.
pub mod filter;

/// Wire frames exchanged with fan-out clients.
pub mod protocol;

/// WebSocket fan-out server.
pub mod server;

/// Per-client session state and the dispatch registry.
pub mod session;

pub use filter::{ClientFilter, PriceRange};
pub use protocol::{ClientFrame, ServerFrame, SubscriptionAck, SubscriptionRequest};
pub use server::{FanoutConfig, FanoutServer};
pub use session::{ClientId, ClientSession, FanoutStats, SessionRegistry};

/// Fan-out server failures.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("failed to bind fan-out listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to accept fan-out connection: {0}")]
    Accept(std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(Box<WsError>),
}

#![warn(rust_2018_idioms)]

//! # Feedline
//! High performance market data ingest, normalisation & fan-out for leading
//! cryptocurrency exchanges - batteries included.
//!
//! Feedline maintains persistent combined-stream WebSocket connections to
//! one or more exchanges (Binance is the reference adapter), normalises each
//! wire format into a single [`MarketEvent`] record type, routes every
//! record through a configurable processing pipeline, and emits the result
//! to downstream sinks: an injected publish/subscribe client, an in-process
//! last-value cache, and a WebSocket fan-out server pushing filtered streams
//! to clients.
//!
//! ## Architecture
//! - [`codec`]: bidirectional mapping between logical subscriptions and
//!   exchange wire stream names, plus combined-stream URL construction.
//! - [`connection`]: per-connection WebSocket actor with heartbeat,
//!   exponential backoff + jitter reconnect, and debounced batched remote
//!   subscription updates; pooled once the per-connection stream cap is hit.
//! - [`subscription`]: the logical subscription model and the authoritative
//!   per-adapter registry.
//! - [`exchange`]: the uniform adapter contract and the Binance reference
//!   implementation.
//! - [`pipeline`]: the ordered stage chain (validate, transform, filter,
//!   route, buffer, output) with per-stage circuit breakers, rate limiters
//!   and configurable error strategies.
//! - [`publish`]: the injected publish/subscribe client contract.
//! - [`fanout`]: the multi-client WebSocket fan-out server with per-client
//!   subscription sets and multi-dimensional filters.
//! - [`cache`]: the in-process last-value cache.
//! - [`engine`]: wiring of adapters, worker pool, pipeline and sinks into a
//!   running service.

/// In-process last-value cache.
pub mod cache;

/// Stream-name codec and combined-stream URL construction.
pub mod codec;

/// Typed service configuration surface.
pub mod config;

/// WebSocket connection manager, backoff and pooling.
pub mod connection;

/// Service wiring: adapters, worker pool, sinks.
pub mod engine;

/// Pipeline envelope wrapping normalised market events.
pub mod envelope;

/// Crate-level error taxonomy.
pub mod error;

/// Normalised market event model.
pub mod event;

/// Exchange adapter contract and implementations.
pub mod exchange;

/// WebSocket fan-out server and subscription engine.
pub mod fanout;

/// Ordered stage chain and shared stage policies.
pub mod pipeline;

/// Injected publish/subscribe client contract.
pub mod publish;

/// Logical subscription model and registry.
pub mod subscription;

pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::DataError;
pub use crate::event::{DataKind, MarketEvent};
pub use crate::exchange::ExchangeId;
pub use crate::subscription::{DataType, Subscription, Symbol};

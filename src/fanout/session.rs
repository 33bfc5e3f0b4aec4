use super::filter::ClientFilter;
use super::protocol::ServerFrame;
use crate::event::MarketEvent;
use crate::pipeline::limiter::{RateLimitConfig, TokenBucket};
use crate::subscription::{DataType, Symbol};
use chrono::Utc;
use derive_more::Display;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Unique identifier of one fan-out client connection.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[display("client-{_0}")]
pub struct ClientId(pub u64);

/// Outcome of dispatching one record to one client.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DispatchOutcome {
    Sent,
    /// Not subscribed, or excluded by the client filter.
    Skipped,
    RateLimited,
    /// The client's send queue was full.
    Backpressured,
}

struct SessionState {
    subscriptions: HashSet<(Symbol, DataType)>,
    filter: ClientFilter,
}

/// One fan-out client: subscription set, filter, rate-limit bucket and the
/// outbound frame queue.
///
/// Subscription and filter updates take the state write lock that dispatch
/// reads under, making updates atomic with respect to dispatch: a send
/// observes either the old state or the new one, never a torn mix.
pub struct ClientSession {
    id: ClientId,
    state: RwLock<SessionState>,
    bucket: Option<TokenBucket>,
    outbound: mpsc::Sender<ServerFrame>,
    last_activity_ms: AtomicI64,
    delivered: AtomicU64,
    dropped_rate_limited: AtomicU64,
    dropped_backpressure: AtomicU64,
}

impl ClientSession {
    fn new(
        id: ClientId,
        outbound: mpsc::Sender<ServerFrame>,
        rate_limit: Option<RateLimitConfig>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState {
                subscriptions: HashSet::new(),
                filter: ClientFilter::default(),
            }),
            bucket: rate_limit.map(TokenBucket::new),
            outbound,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            delivered: AtomicU64::new(0),
            dropped_rate_limited: AtomicU64::new(0),
            dropped_backpressure: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Add a subscription, returning the active count after the change.
    pub fn subscribe(&self, symbol: Symbol, data_type: DataType) -> usize {
        self.touch();
        let mut state = self.state.write();
        state.subscriptions.insert((symbol, data_type));
        state.subscriptions.len()
    }

    /// Remove a subscription, returning the active count after the change.
    pub fn unsubscribe(&self, symbol: &Symbol, data_type: &DataType) -> usize {
        self.touch();
        let mut state = self.state.write();
        state
            .subscriptions
            .remove(&(symbol.clone(), *data_type));
        state.subscriptions.len()
    }

    /// Replace the client filter atomically.
    pub fn set_filter(&self, filter: ClientFilter) {
        self.touch();
        self.state.write().filter = filter;
    }

    pub fn subscriptions(&self) -> Vec<(Symbol, DataType)> {
        self.state.read().subscriptions.iter().cloned().collect()
    }

    /// Enqueue a control frame for the writer task.
    pub fn send_frame(&self, frame: ServerFrame) {
        let _ = self.outbound.try_send(frame);
    }

    fn wants(&self, event: &MarketEvent) -> bool {
        let state = self.state.read();
        state
            .subscriptions
            .contains(&(event.symbol.clone(), event.data_type()))
            && state.filter.admits(event)
    }

    /// Apply subscription set, filter and rate limit to one record, then
    /// enqueue it for the writer task.
    pub fn dispatch(&self, event: &MarketEvent) -> DispatchOutcome {
        if !self.wants(event) {
            return DispatchOutcome::Skipped;
        }

        if let Some(bucket) = &self.bucket {
            if !bucket.try_acquire(1) {
                self.dropped_rate_limited.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::RateLimited;
            }
        }

        match self
            .outbound
            .try_send(ServerFrame::MarketData(event.clone()))
        {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Sent
            }
            Err(_) => {
                self.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Backpressured
            }
        }
    }
}

/// Per-dispatch aggregate of one broadcast pass over all clients.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct BroadcastSummary {
    pub sent: usize,
    pub skipped: usize,
    pub rate_limited: usize,
    pub backpressured: usize,
}

/// Counters snapshot for the fan-out stats surface.
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
pub struct FanoutStats {
    pub clients: usize,
    pub delivered: u64,
    pub dropped_rate_limited: u64,
    pub dropped_backpressure: u64,
}

/// Registry of connected client sessions and the per-record dispatch fan-out.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientId, Arc<ClientSession>>>,
    next_id: AtomicU64,
    rate_limit: Option<RateLimitConfig>,
    send_queue: usize,
}

impl SessionRegistry {
    pub fn new(rate_limit: Option<RateLimitConfig>, send_queue: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            rate_limit,
            send_queue: send_queue.max(1),
        }
    }

    /// Register a new client session, returning it with the receiving half
    /// of its outbound frame queue.
    pub fn register(&self) -> (Arc<ClientSession>, mpsc::Receiver<ServerFrame>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.send_queue);
        let session = Arc::new(ClientSession::new(id, outbound_tx, self.rate_limit));

        self.sessions.write().insert(id, Arc::clone(&session));
        debug!(client = %id, "fan-out client registered");
        (session, outbound_rx)
    }

    pub fn remove(&self, id: ClientId) {
        if self.sessions.write().remove(&id).is_some() {
            debug!(client = %id, "fan-out client removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Dispatch one record to every matching client.
    pub fn broadcast(&self, event: &MarketEvent) -> BroadcastSummary {
        let sessions: Vec<Arc<ClientSession>> =
            self.sessions.read().values().cloned().collect();

        let mut summary = BroadcastSummary::default();
        for session in sessions {
            match session.dispatch(event) {
                DispatchOutcome::Sent => summary.sent += 1,
                DispatchOutcome::Skipped => summary.skipped += 1,
                DispatchOutcome::RateLimited => summary.rate_limited += 1,
                DispatchOutcome::Backpressured => summary.backpressured += 1,
            }
        }
        summary
    }

    pub fn stats(&self) -> FanoutStats {
        let sessions = self.sessions.read();
        let mut stats = FanoutStats {
            clients: sessions.len(),
            ..FanoutStats::default()
        };

        for session in sessions.values() {
            stats.delivered += session.delivered.load(Ordering::Relaxed);
            stats.dropped_rate_limited +=
                session.dropped_rate_limited.load(Ordering::Relaxed);
            stats.dropped_backpressure +=
                session.dropped_backpressure.load(Ordering::Relaxed);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_util;
    use crate::exchange::ExchangeId;
    use rust_decimal_macros::dec;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(None, 16)
    }

    #[tokio::test]
    async fn test_dispatch_requires_subscription() {
        let registry = registry();
        let (session, mut outbound) = registry.register();

        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));

        // Not subscribed: skipped.
        assert_eq!(session.dispatch(&event), DispatchOutcome::Skipped);

        session.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);
        assert_eq!(session.dispatch(&event), DispatchOutcome::Sent);

        match outbound.recv().await {
            Some(ServerFrame::MarketData(received)) => {
                assert_eq!(received.symbol.as_str(), "BTCUSDT")
            }
            other => panic!("expected MarketData frame, got: {other:?}"),
        }

        // Every admitted record matches the client's subscription set.
        let other_type = test_util::market_ticker(ExchangeId::Binance, "BTCUSDT", dec!(100));
        assert_eq!(session.dispatch(&other_type), DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_filter_applies_after_subscription_match() {
        let registry = registry();
        let (session, _outbound) = registry.register();
        session.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);
        session.set_filter(ClientFilter {
            price_range: Some(crate::fanout::PriceRange {
                min: Some(dec!(200)),
                max: None,
            }),
            ..ClientFilter::default()
        });

        let cheap = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        let expensive = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(300));

        assert_eq!(session.dispatch(&cheap), DispatchOutcome::Skipped);
        assert_eq!(session.dispatch(&expensive), DispatchOutcome::Sent);
    }

    #[tokio::test]
    async fn test_rate_limit_drops_and_counts() {
        let registry = SessionRegistry::new(
            Some(RateLimitConfig {
                max_requests: 1,
                time_window_ms: 60_000,
                burst: 0,
            }),
            16,
        );
        let (session, _outbound) = registry.register();
        session.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);

        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        assert_eq!(session.dispatch(&event), DispatchOutcome::Sent);
        assert_eq!(session.dispatch(&event), DispatchOutcome::RateLimited);

        assert_eq!(registry.stats().dropped_rate_limited, 1);
        assert_eq!(registry.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_full_send_queue_counts_backpressure() {
        let registry = SessionRegistry::new(None, 1);
        let (session, _outbound) = registry.register();
        session.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);

        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        assert_eq!(session.dispatch(&event), DispatchOutcome::Sent);
        // The single-slot queue is full and the reader is idle.
        assert_eq!(session.dispatch(&event), DispatchOutcome::Backpressured);
        assert_eq!(registry.stats().dropped_backpressure, 1);
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_matching_clients_only() {
        let registry = registry();
        let (btc_client, _btc_rx) = registry.register();
        let (eth_client, _eth_rx) = registry.register();
        btc_client.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);
        eth_client.subscribe(Symbol::new("ETHUSDT"), DataType::Trade);

        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        let summary = registry.broadcast(&event);

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_remove() {
        let registry = registry();
        let (session, _outbound) = registry.register();
        let id = session.id();

        session.subscribe(Symbol::new("BTCUSDT"), DataType::Trade);
        assert_eq!(
            session.unsubscribe(&Symbol::new("BTCUSDT"), &DataType::Trade),
            0
        );

        let event = test_util::market_trade(ExchangeId::Binance, "BTCUSDT", dec!(100));
        assert_eq!(session.dispatch(&event), DispatchOutcome::Skipped);

        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert!(registry.is_empty());
    }
}

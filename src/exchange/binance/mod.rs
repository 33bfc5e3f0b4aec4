use super::{
    AdapterConfig, AdapterEvent, AdapterStats, AdapterStatus, ExchangeId, MarketDataAdapter,
};
use crate::codec::{binance::BinanceStreamCodec, StreamName};
use crate::connection::{
    backoff::RetryPolicy, pool::ConnectionPool, ConnectionEvent,
};
use crate::error::{DataError, ErrorRecord};
use crate::event::MarketEvent;
use crate::subscription::registry::{
    SubscribeSummary, SubscriptionPolicy, SubscriptionRegistry, UnsubscribeSummary,
};
use crate::subscription::Subscription;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `Binance` specific wire message models.
pub mod model;

use model::BinancePayload;

/// `Binance` market data adapter.
///
/// Owns a [`ConnectionPool`] of combined-stream WebSockets and a
/// [`SubscriptionRegistry`]; parses raw frames into normalised
/// [`MarketEvent`]s and emits them over its typed [`AdapterEvent`] channel.
///
/// Binance combined streams have no usable in-band subscribe, so batched
/// subscription changes are applied by the connection manager's debounced
/// clean reconnect, and new subscriptions are activated immediately rather
/// than awaiting a remote ack.
pub struct BinanceAdapter {
    config: AdapterConfig,
    registry: Arc<SubscriptionRegistry>,
    pool: Arc<Mutex<ConnectionPool>>,
    status: Arc<RwLock<AdapterStatus>>,
    stats: Arc<StatsRecorder>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    connection_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    ingress: Option<JoinHandle<()>>,
    pool_sweeper: Option<JoinHandle<()>>,
}

impl BinanceAdapter {
    /// Construct the adapter alongside the receiving half of its
    /// [`AdapterEvent`] channel.
    pub fn new(
        config: AdapterConfig,
        policy: SubscriptionPolicy,
        retry: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();

        let pool = ConnectionPool::new(
            config.ws_endpoint.clone(),
            config.connection_config(),
            retry,
            connection_tx,
        );
        let registry = SubscriptionRegistry::new(policy, Arc::new(BinanceStreamCodec));

        let adapter = Self {
            config,
            registry: Arc::new(registry),
            pool: Arc::new(Mutex::new(pool)),
            status: Arc::new(RwLock::new(AdapterStatus::Initializing)),
            stats: Arc::new(StatsRecorder::default()),
            events_tx,
            connection_events: Some(connection_rx),
            ingress: None,
            pool_sweeper: None,
        };

        (adapter, events_rx)
    }

    /// The adapter's subscription registry, for stats surfaces.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    fn set_status(&self, to: AdapterStatus) {
        set_status(&self.status, &self.events_tx, to);
    }
}

fn set_status(
    status: &RwLock<AdapterStatus>,
    events: &mpsc::UnboundedSender<AdapterEvent>,
    to: AdapterStatus,
) {
    let from = {
        let mut guard = status.write();
        if *guard == to {
            return;
        }
        let from = *guard;
        *guard = to;
        from
    };

    info!(%from, %to, "adapter status changed");
    let _ = events.send(AdapterEvent::StatusChanged { from, to });
}

#[async_trait]
impl MarketDataAdapter for BinanceAdapter {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn initialize(&mut self) -> Result<(), DataError> {
        match self.config.ws_endpoint.scheme() {
            "ws" | "wss" => Ok(()),
            scheme => Err(DataError::InvalidState(format!(
                "unsupported WebSocket endpoint scheme: {scheme}"
            ))),
        }
    }

    async fn start(&mut self) -> Result<(), DataError> {
        let mut connection_events = self
            .connection_events
            .take()
            .ok_or_else(|| DataError::InvalidState("adapter already started".to_string()))?;

        self.set_status(AdapterStatus::Connecting);

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let status = Arc::clone(&self.status);
        let events_tx = self.events_tx.clone();

        self.ingress = Some(tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                match event {
                    ConnectionEvent::Message { connection, text } => {
                        stats.record_message();
                        match serde_json::from_str::<BinancePayload>(&text) {
                            Ok(payload) => {
                                let stream = StreamName::new(payload.stream.as_str());
                                // Unmatched stream names race an unsubscribe
                                // and are dropped silently.
                                if registry.handle_stream_data(&stream, connection).is_some() {
                                    let event =
                                        MarketEvent::from((ExchangeId::Binance, payload.data));
                                    stats.record_event();
                                    let _ = events_tx.send(AdapterEvent::Data(event));
                                }
                            }
                            Err(error) => {
                                stats.record_parse_error();
                                debug!(%error, payload = %text, "failed to parse Binance frame");
                            }
                        }
                    }
                    ConnectionEvent::Connected { connection } => {
                        set_status(&status, &events_tx, AdapterStatus::Active);
                        let _ = events_tx.send(AdapterEvent::Connected { connection });
                    }
                    ConnectionEvent::Disconnected { connection } => {
                        if *status.read() != AdapterStatus::Stopped {
                            stats.record_reconnect();
                            set_status(&status, &events_tx, AdapterStatus::Reconnecting);
                        }
                        let _ = events_tx.send(AdapterEvent::Disconnected { connection });
                    }
                    ConnectionEvent::Latency { connection, rtt } => {
                        debug!(%connection, ?rtt, "heartbeat round trip measured");
                    }
                }
            }
        }));

        // Idle secondary connections are closed once untouched for the idle
        // timeout.
        let pool = Arc::clone(&self.pool);
        let sweep_interval = std::time::Duration::from_millis(
            self.config.connection_config().idle_timeout_ms.max(1_000),
        );
        self.pool_sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.lock().await.sweep_idle().await;
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DataError> {
        self.set_status(AdapterStatus::Stopped);
        self.pool.lock().await.close_all().await;

        if let Some(sweeper) = self.pool_sweeper.take() {
            sweeper.abort();
        }
        if let Some(ingress) = self.ingress.take() {
            ingress.abort();
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), DataError> {
        self.stop().await?;
        self.registry.clear();
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubscribeSummary, DataError> {
        let mut pool = self.pool.lock().await;

        let summary = self
            .registry
            .subscribe(subscriptions, |_| Ok(pool.assign_stream().id()));

        for record in &summary.successful {
            match pool.get(record.connection) {
                Some(manager) => {
                    if let Err(error) = manager.add_stream(record.stream.clone()) {
                        warn!(%error, stream = %record.stream, "failed to enqueue stream add");
                        let _ = self.events_tx.send(AdapterEvent::Error(
                            ErrorRecord::new("CONNECTION_NOT_AVAILABLE", error.to_string(), true)
                                .with_context("stream", record.stream.as_str()),
                        ));
                        continue;
                    }
                    // Combined streams carry no explicit remote ack.
                    self.registry.activate(&record.key);
                }
                None => {
                    warn!(connection = %record.connection, "assigned connection missing from pool");
                }
            }
        }
        drop(pool);

        if !summary.successful.is_empty() {
            if *self.status.read() != AdapterStatus::Active {
                self.set_status(AdapterStatus::Subscribing);
            }
            let _ = self
                .events_tx
                .send(AdapterEvent::Subscribed(summary.subscriptions()));
        }

        Ok(summary)
    }

    async fn unsubscribe(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<UnsubscribeSummary, DataError> {
        let summary = self.registry.unsubscribe(subscriptions);

        let mut pool = self.pool.lock().await;
        for record in &summary.cancelled {
            if let Some(manager) = pool.get(record.connection) {
                let _ = manager.remove_stream(record.stream.clone());
            }
            pool.release_stream(record.connection);
        }
        drop(pool);

        if !summary.cancelled.is_empty() {
            let _ = self.events_tx.send(AdapterEvent::Unsubscribed(
                summary
                    .cancelled
                    .iter()
                    .map(|record| record.subscription.clone())
                    .collect(),
            ));
        }

        Ok(summary)
    }

    fn status(&self) -> AdapterStatus {
        *self.status.read()
    }

    fn stats(&self) -> AdapterStats {
        self.stats.snapshot(self.registry.len())
    }
}

#[derive(Debug, Default)]
struct StatsRecorder {
    messages: AtomicU64,
    parse_errors: AtomicU64,
    events: AtomicU64,
    reconnects: AtomicU64,
    last_message_ms: AtomicI64,
}

impl StatsRecorder {
    fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, active_subscriptions: usize) -> AdapterStats {
        let last_message_ms = self.last_message_ms.load(Ordering::Relaxed);
        AdapterStats {
            messages: self.messages.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            active_subscriptions,
            last_message_at: (last_message_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_message_ms).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DataType;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use url::Url;

    /// WebSocket server that pushes the provided frame to every client after
    /// the handshake, then keeps reading to answer pings.
    async fn spawn_feed_server(frame: &str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frame = frame.to_string();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let frame = frame.clone();
                tokio::spawn(async move {
                    let Ok(mut websocket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if websocket
                        .send(crate::connection::WsMessage::Text(frame))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    while let Some(Ok(_)) = websocket.next().await {}
                });
            }
        });

        addr
    }

    fn test_adapter(addr: std::net::SocketAddr) -> (BinanceAdapter, mpsc::UnboundedReceiver<AdapterEvent>) {
        let config = AdapterConfig {
            ws_endpoint: Url::parse(&format!("ws://{addr}")).unwrap(),
            resubscribe_debounce_ms: 50,
            ..AdapterConfig::default()
        };
        BinanceAdapter::new(config, SubscriptionPolicy::default(), RetryPolicy::default())
    }

    const TRADE_FRAME: &str = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":1,"p":"16500.10","q":"0.5","T":1672515782134,"m":false}}"#;

    #[tokio::test]
    async fn test_subscribe_and_receive_normalised_data() {
        let addr = spawn_feed_server(TRADE_FRAME).await;
        let (mut adapter, mut events) = test_adapter(addr);

        adapter.initialize().await.unwrap();
        adapter.start().await.unwrap();

        let summary = adapter
            .subscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
            .await
            .unwrap();
        assert_eq!(summary.successful.len(), 1);

        let mut received = None;
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let AdapterEvent::Data(event) = event {
                    received = Some(event);
                    break;
                }
            }
        });
        deadline.await.unwrap();

        let event = received.expect("no market event received");
        assert_eq!(event.exchange, ExchangeId::Binance);
        assert_eq!(event.symbol.as_str(), "BTCUSDT");
        assert_eq!(event.data_type(), DataType::Trade);
        assert_eq!(adapter.status(), AdapterStatus::Active);

        let stats = adapter.stats();
        assert!(stats.messages >= 1);
        assert!(stats.events >= 1);
        assert_eq!(stats.active_subscriptions, 1);

        adapter.stop().await.unwrap();
        assert_eq!(adapter.status(), AdapterStatus::Stopped);
    }

    #[tokio::test]
    async fn test_second_subscribe_reports_existing() {
        let addr = spawn_feed_server(TRADE_FRAME).await;
        let (mut adapter, _events) = test_adapter(addr);
        adapter.initialize().await.unwrap();
        adapter.start().await.unwrap();

        let subscription = Subscription::new("BTCUSDT", DataType::Trade);
        adapter.subscribe(vec![subscription.clone()]).await.unwrap();
        let summary = adapter.subscribe(vec![subscription.clone()]).await.unwrap();

        assert!(summary.successful.is_empty());
        assert_eq!(summary.existing, vec![subscription]);
        assert_eq!(adapter.stats().active_subscriptions, 1);

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_registry_and_pool() {
        let addr = spawn_feed_server(TRADE_FRAME).await;
        let (mut adapter, _events) = test_adapter(addr);
        adapter.initialize().await.unwrap();
        adapter.start().await.unwrap();

        let subscription = Subscription::new("BTCUSDT", DataType::Trade);
        adapter.subscribe(vec![subscription.clone()]).await.unwrap();
        let summary = adapter.unsubscribe(vec![subscription]).await.unwrap();

        assert_eq!(summary.cancelled.len(), 1);
        assert_eq!(adapter.stats().active_subscriptions, 0);

        adapter.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frames_counted_and_dropped() {
        let addr = spawn_feed_server("not json at all").await;
        let (mut adapter, _events) = test_adapter(addr);
        adapter.initialize().await.unwrap();
        adapter.start().await.unwrap();

        adapter
            .subscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
            .await
            .unwrap();

        // Wait for the debounced connect and the pushed frame.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if adapter.stats().parse_errors >= 1 {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("parse error never recorded");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(adapter.stats().events, 0);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_rejects_non_websocket_endpoint() {
        let config = AdapterConfig {
            ws_endpoint: Url::parse("https://example.com").unwrap(),
            ..AdapterConfig::default()
        };
        let (mut adapter, _events) =
            BinanceAdapter::new(config, SubscriptionPolicy::default(), RetryPolicy::default());

        assert!(adapter.initialize().await.is_err());
    }
}

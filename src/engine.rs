use crate::cache::LastValueCache;
use crate::error::DataError;
use crate::event::MarketEvent;
use crate::exchange::{AdapterEvent, ExchangeId, MarketDataAdapter};
use crate::fanout::FanoutServer;
use crate::pipeline::buffer::BackpressureStrategy;
use crate::pipeline::{PerformanceConfig, Pipeline};
use crate::subscription::registry::{SubscribeSummary, UnsubscribeSummary};
use crate::subscription::Subscription;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Builder wiring adapters, the pipeline and the sinks into a running
/// [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    adapters: Vec<(
        Box<dyn MarketDataAdapter>,
        mpsc::UnboundedReceiver<AdapterEvent>,
    )>,
    pipeline: Option<Arc<Pipeline>>,
    fanout: Option<FanoutServer>,
    cache: Option<Arc<LastValueCache>>,
    performance: PerformanceConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter together with its event channel.
    pub fn adapter<A>(mut self, adapter: A, events: mpsc::UnboundedReceiver<AdapterEvent>) -> Self
    where
        A: MarketDataAdapter + 'static,
    {
        self.adapters.push((Box::new(adapter), events));
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Attach a bound fan-out server, started on `init`.
    pub fn fanout(mut self, fanout: FanoutServer) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Attach a last-value cache as a secondary sink on processed events.
    pub fn cache(mut self, cache: Arc<LastValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    /// Initialise every component and spawn the ingress, worker and fan-out
    /// tasks.
    pub async fn init(self) -> Result<Engine, DataError> {
        let pipeline = self
            .pipeline
            .ok_or_else(|| DataError::InvalidState("engine requires a pipeline".to_string()))?;
        pipeline.init().await?;

        let (processed_tx, _) = broadcast::channel(self.performance.queue_size.max(16));
        let (ingress_tx, ingress_rx) = mpsc::channel::<MarketEvent>(self.performance.queue_size.max(1));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut adapters = Vec::with_capacity(self.adapters.len());

        // One ingress task per adapter, pushing parsed records onto the
        // bounded queue. A full queue applies the configured backpressure
        // strategy to ingress.
        let backpressure = self.performance.backpressure_strategy;
        for (mut adapter, mut events) in self.adapters {
            adapter.initialize().await?;
            adapter.start().await?;

            let exchange = adapter.exchange();
            let ingress_tx = ingress_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        AdapterEvent::Data(event) => match backpressure {
                            BackpressureStrategy::Block => {
                                if ingress_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            BackpressureStrategy::Drop | BackpressureStrategy::Spill => {
                                match ingress_tx.try_send(event) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        debug!(%exchange, "ingress queue full, dropping record");
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                                }
                            }
                        },
                        AdapterEvent::Error(error) => {
                            warn!(%exchange, code = %error.code, message = %error.message, "adapter error");
                        }
                        _ => {}
                    }
                }
            }));
            adapters.push(adapter);
        }
        drop(ingress_tx);

        // Worker pool draining the ingress queue through the pipeline.
        let ingress_rx = Arc::new(Mutex::new(ingress_rx));
        for worker in 0..self.performance.max_concurrency.max(1) {
            let ingress_rx = Arc::clone(&ingress_rx);
            let pipeline = Arc::clone(&pipeline);
            let processed_tx = processed_tx.clone();
            let cache = self.cache.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let event = { ingress_rx.lock().await.recv().await };
                    let Some(event) = event else {
                        break;
                    };

                    match pipeline.process(event).await {
                        Ok(report) => {
                            for envelope in report.outputs {
                                if let Some(cache) = &cache {
                                    cache.insert(&envelope.event);
                                }
                                let _ = processed_tx.send(envelope.event);
                            }
                        }
                        Err(error) => {
                            warn!(worker, %error, "pipeline rejected event");
                        }
                    }
                }
            }));
        }

        if let Some(fanout) = self.fanout {
            let events = processed_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(error) = fanout.serve(events).await {
                    warn!(%error, "fan-out server stopped");
                }
            }));
        }

        info!(
            adapters = adapters.len(),
            workers = self.performance.max_concurrency.max(1),
            "engine initialised"
        );

        Ok(Engine {
            adapters,
            pipeline,
            cache: self.cache,
            processed_tx,
            tasks,
        })
    }
}

/// Running market-data service: adapters feeding a worker pool through the
/// pipeline, fanning processed events out to the pub/sub dispatcher (inside
/// the pipeline), the last-value cache and the WebSocket fan-out server.
pub struct Engine {
    adapters: Vec<Box<dyn MarketDataAdapter>>,
    pipeline: Arc<Pipeline>,
    cache: Option<Arc<LastValueCache>>,
    processed_tx: broadcast::Sender<MarketEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Subscribe to processed events, eg/ for embedding without the fan-out
    /// server.
    pub fn events(&self) -> broadcast::Receiver<MarketEvent> {
        self.processed_tx.subscribe()
    }

    /// [`events`](Self::events) as a `Stream` for use with `futures`
    /// combinators.
    pub fn event_stream(&self) -> BroadcastStream<MarketEvent> {
        BroadcastStream::new(self.processed_tx.subscribe())
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn cache(&self) -> Option<Arc<LastValueCache>> {
        self.cache.clone()
    }

    fn adapter(&self, exchange: ExchangeId) -> Result<&dyn MarketDataAdapter, DataError> {
        self.adapters
            .iter()
            .map(AsRef::as_ref)
            .find(|adapter| adapter.exchange() == exchange)
            .ok_or_else(|| {
                DataError::InvalidState(format!("no adapter registered for {exchange}"))
            })
    }

    /// Subscribe market data on the identified exchange.
    pub async fn subscribe(
        &self,
        exchange: ExchangeId,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubscribeSummary, DataError> {
        self.adapter(exchange)?.subscribe(subscriptions).await
    }

    /// Unsubscribe market data on the identified exchange.
    pub async fn unsubscribe(
        &self,
        exchange: ExchangeId,
        subscriptions: Vec<Subscription>,
    ) -> Result<UnsubscribeSummary, DataError> {
        self.adapter(exchange)?.unsubscribe(subscriptions).await
    }

    /// Stop components in reverse dependency order: adapters first (ending
    /// ingress), then the pipeline (draining buffers), then the remaining
    /// tasks.
    pub async fn shutdown(mut self) {
        for adapter in self.adapters.iter_mut().rev() {
            if let Err(error) = adapter.stop().await {
                warn!(%error, "adapter stop failed");
            }
        }

        self.pipeline.shutdown().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::connection::backoff::RetryPolicy;
    use crate::exchange::binance::BinanceAdapter;
    use crate::exchange::AdapterConfig;
    use crate::pipeline::output::OutputStage;
    use crate::pipeline::stage::StageConfig;
    use crate::pipeline::transform::TransformStage;
    use crate::pipeline::validate::{ValidateConfig, ValidateStage};
    use crate::publish::{Dispatcher, MemoryPublisher, Publisher};
    use crate::subscription::registry::SubscriptionPolicy;
    use crate::subscription::{DataType, Symbol};
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use url::Url;

    const TRADE_FRAME: &str = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":7,"p":"16500.42","q":"0.25","T":1672515782134,"m":false}}"#;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// WebSocket server pushing one combined-stream frame per connection.
    async fn spawn_feed_server(frame: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let Ok(mut websocket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if websocket
                        .send(crate::connection::WsMessage::Text(frame.to_string()))
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

    #[tokio::test]
    async fn test_engine_end_to_end_ingest_to_sinks() {
        init_tracing();
        let addr = spawn_feed_server(TRADE_FRAME).await;

        let (adapter, adapter_events) = BinanceAdapter::new(
            AdapterConfig {
                ws_endpoint: Url::parse(&format!("ws://{addr}")).unwrap(),
                resubscribe_debounce_ms: 50,
                ..AdapterConfig::default()
            },
            SubscriptionPolicy::default(),
            RetryPolicy::default(),
        );

        let publisher = Arc::new(MemoryPublisher::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&publisher) as Arc<dyn Publisher>,
            "t",
            "test-ingest",
        ));

        // Validation is pinned wide open: the canned frame carries a fixed
        // 2023 event time.
        let pipeline = Arc::new(
            Pipeline::builder()
                .stage(
                    ValidateStage::new(ValidateConfig {
                        max_age_ms: i64::MAX,
                        ..ValidateConfig::default()
                    }),
                    StageConfig::default(),
                )
                .stage(TransformStage::new(), StageConfig::default())
                .stage(OutputStage::new(dispatcher), StageConfig::default())
                .build(),
        );

        let cache = Arc::new(LastValueCache::new(CacheConfig {
            ttl_ms: None,
            ..CacheConfig::default()
        }));

        let engine = Engine::builder()
            .adapter(adapter, adapter_events)
            .pipeline(Arc::clone(&pipeline))
            .cache(Arc::clone(&cache))
            .init()
            .await
            .unwrap();

        let mut processed = engine.events();

        let summary = engine
            .subscribe(
                ExchangeId::Binance,
                vec![Subscription::new("BTCUSDT", DataType::Trade)],
            )
            .await
            .unwrap();
        assert_eq!(summary.successful.len(), 1);

        // Processed event reaches the broadcast sink.
        let event = tokio::time::timeout(Duration::from_secs(5), processed.recv())
            .await
            .expect("timed out waiting for processed event")
            .unwrap();
        assert_eq!(event.symbol.as_str(), "BTCUSDT");

        // Publisher sink received it with the default topic.
        assert!(!publisher.published_to("t-market-data-binance").is_empty());

        // Last-value cache holds it.
        assert!(cache
            .get(ExchangeId::Binance, &Symbol::new("BTCUSDT"), &DataType::Trade)
            .is_some());

        assert!(pipeline.is_healthy());
        engine.shutdown().await;
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_engine_requires_a_pipeline() {
        let result = Engine::builder().init().await;
        assert!(matches!(result, Err(DataError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_subscribe_on_unknown_exchange_fails() {
        let pipeline = Arc::new(Pipeline::builder().build());
        let engine = Engine::builder()
            .pipeline(pipeline)
            .init()
            .await
            .unwrap();

        let result = engine
            .subscribe(
                ExchangeId::Okx,
                vec![Subscription::new("BTCUSDT", DataType::Trade)],
            )
            .await;
        assert!(matches!(result, Err(DataError::InvalidState(_))));

        engine.shutdown().await;
    }
}

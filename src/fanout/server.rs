use super::protocol::{ClientFrame, FrameError, ServerFrame, SubscriptionAck};
use super::session::{ClientSession, SessionRegistry};
use super::FanoutError;
use crate::connection::WsMessage;
use crate::event::MarketEvent;
use crate::pipeline::limiter::RateLimitConfig;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

/// Fan-out server configuration.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub bind_addr: String,
    /// WebSocket endpoint path.
    pub path: String,
    pub max_clients: usize,
    /// Bound of each client's outbound frame queue.
    pub send_queue: usize,
    /// Per-client delivery rate limit.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path: "/ws".to_string(),
            max_clients: 1_024,
            send_queue: 256,
            rate_limit: None,
        }
    }
}

/// Multi-client WebSocket fan-out server.
///
/// One task per client connection handles egress; a shared broadcaster task
/// reads processed events and dispatches them through the
/// [`SessionRegistry`]. The broadcaster is a single task, so per-partition
/// ordering of the pipeline output is preserved into each client's queue.
pub struct FanoutServer {
    config: FanoutConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Arc<SessionRegistry>,
}

impl FanoutServer {
    /// Bind the listener. Events start flowing once [`serve`](Self::serve)
    /// is awaited.
    pub async fn bind(config: FanoutConfig) -> Result<Self, FanoutError> {
        let listener =
            TcpListener::bind(&config.bind_addr)
                .await
                .map_err(|source| FanoutError::Bind {
                    addr: config.bind_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr().map_err(FanoutError::Accept)?;
        let sessions = Arc::new(SessionRegistry::new(
            config.rate_limit,
            config.send_queue,
        ));

        Ok(Self {
            config,
            listener,
            local_addr,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Accept clients and broadcast processed events until the surrounding
    /// task is aborted.
    pub async fn serve(
        self,
        mut events: broadcast::Receiver<MarketEvent>,
    ) -> Result<(), FanoutError> {
        info!(addr = %self.local_addr, path = %self.config.path, "fan-out server listening");

        // Dropped with the serve task; it also ends on its own once the
        // pipeline side of the events channel closes.
        let registry = Arc::clone(&self.sessions);
        let _broadcaster = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        registry.broadcast(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out broadcaster lagged behind the pipeline");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept fan-out connection");
                    continue;
                }
            };

            if self.sessions.len() >= self.config.max_clients {
                warn!(%peer, "rejecting fan-out client: max clients reached");
                continue;
            }

            tokio::spawn(handle_client(
                stream,
                self.config.path.clone(),
                Arc::clone(&self.sessions),
            ));
        }
    }
}

async fn handle_client(stream: TcpStream, path: String, registry: Arc<SessionRegistry>) {
    let callback = |request: &Request, response: Response| {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(None);
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let websocket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(websocket) => websocket,
        Err(error) => {
            debug!(%error, "fan-out handshake failed");
            return;
        }
    };

    let (session, outbound_rx) = registry.register();
    let (sink, mut source) = websocket.split();

    let writer = tokio::spawn(write_frames(sink, outbound_rx));

    while let Some(message) = source.next().await {
        match message {
            Ok(WsMessage::Text(text)) => handle_frame(&session, &text),
            Ok(WsMessage::Binary(_)) | Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_))
            | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) => break,
            Err(error) => {
                debug!(client = %session.id(), %error, "fan-out client read error");
                break;
            }
        }
    }

    registry.remove(session.id());
    writer.abort();
}

async fn write_frames(
    mut sink: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        WsMessage,
    >,
    mut outbound: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "failed to serialise fan-out frame");
                continue;
            }
        };

        if sink.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

fn handle_frame(session: &Arc<ClientSession>, text: &str) {
    session.touch();

    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe(request)) => {
            let active = session.subscribe(request.symbol.clone(), request.data_type);
            session.send_frame(ServerFrame::SubscriptionAck(SubscriptionAck {
                symbol: request.symbol,
                data_type: request.data_type,
                subscribed: true,
                active,
            }));
        }
        Ok(ClientFrame::Unsubscribe(request)) => {
            let active = session.unsubscribe(&request.symbol, &request.data_type);
            session.send_frame(ServerFrame::SubscriptionAck(SubscriptionAck {
                symbol: request.symbol,
                data_type: request.data_type,
                subscribed: false,
                active,
            }));
        }
        Ok(ClientFrame::Filter(filter)) => session.set_filter(filter),
        Ok(ClientFrame::Ping) => session.send_frame(ServerFrame::Pong),
        Err(error) => {
            session.send_frame(ServerFrame::Error(FrameError {
                code: "BAD_FRAME".to_string(),
                message: error.to_string(),
            }));
        }
    }
}

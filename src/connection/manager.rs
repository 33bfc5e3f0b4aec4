use super::{
    backoff::{Backoff, RetryPolicy},
    connect, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionId, ConnectionState,
    WebSocket, WsError, WsMessage,
};
use crate::codec::{combined_stream_url, StreamName};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Handle to the actor owning one exchange WebSocket.
///
/// All mutation of the connection (stream set, heartbeat, reconnect) is
/// serialised through the actor mailbox; callers observe state via a watch
/// channel and the typed [`ConnectionEvent`] stream.
///
/// Stream set changes with `auto_manage_streams` enabled are debounced and
/// applied as one batched remote update: the combined-stream URL is rebuilt
/// from the current active set and the socket is cleanly reconnected to it
/// (Binance combined streams have no usable in-band subscribe). At most one
/// remote update is in flight at a time.
#[derive(Debug)]
pub struct ConnectionManager {
    id: ConnectionId,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

enum Command {
    Open {
        url: Url,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    AddStream(StreamName),
    RemoveStream(StreamName),
    Ping {
        reply: oneshot::Sender<Result<Duration, ConnectionError>>,
    },
    Streams {
        reply: oneshot::Sender<Vec<StreamName>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

impl ConnectionManager {
    /// Spawn the connection actor. The connection starts `Disconnected`; it
    /// is established either by [`open`](Self::open) or by the first
    /// debounced stream update.
    pub fn spawn(
        id: ConnectionId,
        base_url: Url,
        config: ConnectionConfig,
        retry: RetryPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ConnectionActor {
            id,
            base_url,
            config,
            commands: command_rx,
            events,
            state_tx,
            socket: None,
            explicit_url: None,
            stream_order: Vec::new(),
            stream_set: HashSet::new(),
            resubscribe_at: None,
            reconnect_at: None,
            backoff: Backoff::new(retry),
            ping_seq: 0,
            pending_pings: Vec::new(),
            closing: false,
        };
        tokio::spawn(actor.run());

        Self {
            id,
            command_tx,
            state_rx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Establish the connection to the provided URL, transitioning
    /// `Disconnected → Connecting → Connected`.
    pub async fn open(&self, url: Url) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Open { url, reply })
            .map_err(|_| ConnectionError::ManagerStopped)?;
        response.await.map_err(|_| ConnectionError::ManagerStopped)?
    }

    /// Add a stream to the active set. O(1); schedules a debounced remote
    /// update when auto-manage is on.
    pub fn add_stream(&self, name: StreamName) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::AddStream(name))
            .map_err(|_| ConnectionError::ManagerStopped)
    }

    /// Remove a stream from the active set. O(1); schedules a debounced
    /// remote update when auto-manage is on.
    pub fn remove_stream(&self, name: StreamName) -> Result<(), ConnectionError> {
        self.command_tx
            .send(Command::RemoveStream(name))
            .map_err(|_| ConnectionError::ManagerStopped)
    }

    /// Measure WebSocket round-trip latency with a ping frame.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Ping { reply })
            .map_err(|_| ConnectionError::ManagerStopped)?;
        response.await.map_err(|_| ConnectionError::ManagerStopped)?
    }

    /// Snapshot of the active stream set, in insertion order.
    pub async fn streams(&self) -> Result<Vec<StreamName>, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Streams { reply })
            .map_err(|_| ConnectionError::ManagerStopped)?;
        response.await.map_err(|_| ConnectionError::ManagerStopped)
    }

    /// Gracefully close the connection and stop the actor.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Close { reply })
            .map_err(|_| ConnectionError::ManagerStopped)?;
        response.await.map_err(|_| ConnectionError::ManagerStopped)
    }
}

struct PendingPing {
    payload: Vec<u8>,
    sent_at: Instant,
    reply: Option<oneshot::Sender<Result<Duration, ConnectionError>>>,
}

struct ConnectionActor {
    id: ConnectionId,
    base_url: Url,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    socket: Option<WebSocket>,
    /// URL passed to an explicit `Open`, used while the stream set is empty.
    explicit_url: Option<Url>,
    stream_order: Vec<StreamName>,
    stream_set: HashSet<StreamName>,
    resubscribe_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    backoff: Backoff,
    ping_seq: u64,
    pending_pings: Vec<PendingPing>,
    closing: bool,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                message = next_frame(&mut self.socket), if self.socket.is_some() => {
                    self.handle_frame(message).await;
                },
                _ = heartbeat.tick(), if self.socket.is_some() => {
                    self.heartbeat_tick().await;
                },
                _ = sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)),
                    if self.reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.try_reconnect().await;
                },
                _ = sleep_until(self.resubscribe_at.unwrap_or_else(Instant::now)),
                    if self.resubscribe_at.is_some() =>
                {
                    self.resubscribe_at = None;
                    self.apply_stream_update().await;
                },
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Open { url, reply } => {
                let result = self.establish(url).await;
                let _ = reply.send(result);
                false
            }
            Command::AddStream(name) => {
                if self.stream_set.insert(name.clone()) {
                    self.stream_order.push(name);
                    self.schedule_resubscribe();
                }
                false
            }
            Command::RemoveStream(name) => {
                if self.stream_set.remove(&name) {
                    self.stream_order.retain(|existing| existing != &name);
                    self.schedule_resubscribe();
                }
                false
            }
            Command::Ping { reply } => {
                self.send_ping(Some(reply)).await;
                false
            }
            Command::Streams { reply } => {
                let _ = reply.send(self.stream_order.clone());
                false
            }
            Command::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                true
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn schedule_resubscribe(&mut self) {
        if self.config.auto_manage_streams {
            // A fresh change resets the running debounce window.
            self.resubscribe_at = Some(Instant::now() + self.config.resubscribe_debounce());
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        info!(
            connection = %self.id,
            attempt = self.backoff.attempts(),
            ?delay,
            "scheduling reconnect attempt"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// Combined-stream URL for the current active set, or the explicit URL
    /// when no streams are registered yet.
    fn target_url(&self) -> Result<Option<Url>, ConnectionError> {
        if self.stream_order.is_empty() {
            return Ok(self.explicit_url.clone());
        }

        let url = combined_stream_url(
            self.base_url.as_str(),
            &self.stream_order,
            self.config.max_streams,
        )?;
        Ok(Some(url))
    }

    async fn establish(&mut self, url: Url) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);

        match tokio::time::timeout(self.config.connection_timeout(), connect(&url)).await {
            Ok(Ok(socket)) => {
                self.socket = Some(socket);
                self.explicit_url = Some(url);
                self.backoff.reset();
                self.pending_pings.clear();
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(ConnectionEvent::Connected {
                    connection: self.id,
                });
                info!(connection = %self.id, "WebSocket connection established");
                Ok(())
            }
            Ok(Err(error)) => {
                self.set_state(ConnectionState::Disconnected);
                Err(error)
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectionError::ConnectTimeout(
                    self.config.connection_timeout(),
                ))
            }
        }
    }

    async fn handle_frame(&mut self, message: Option<Result<WsMessage, WsError>>) {
        match message {
            Some(Ok(WsMessage::Text(text))) => {
                let _ = self.events.send(ConnectionEvent::Message {
                    connection: self.id,
                    text,
                });
            }
            Some(Ok(WsMessage::Binary(binary))) => match String::from_utf8(binary) {
                Ok(text) => {
                    let _ = self.events.send(ConnectionEvent::Message {
                        connection: self.id,
                        text,
                    });
                }
                Err(_) => {
                    debug!(connection = %self.id, "dropping non-utf8 binary WebSocket frame");
                }
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                if let Some(socket) = self.socket.as_mut() {
                    if let Err(error) = socket.send(WsMessage::Pong(payload)).await {
                        warn!(connection = %self.id, %error, "failed to answer server ping");
                        self.connection_lost("pong send failure").await;
                    }
                }
            }
            Some(Ok(WsMessage::Pong(payload))) => self.handle_pong(payload),
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(connection = %self.id, ?frame, "received close frame");
                self.connection_lost("close frame").await;
            }
            Some(Ok(WsMessage::Frame(_))) => {}
            Some(Err(error)) => {
                warn!(connection = %self.id, %error, "WebSocket read error");
                self.connection_lost("read error").await;
            }
            None => {
                self.connection_lost("stream ended").await;
            }
        }
    }

    fn handle_pong(&mut self, payload: Vec<u8>) {
        let Some(index) = self
            .pending_pings
            .iter()
            .position(|pending| pending.payload == payload)
        else {
            return;
        };

        let pending = self.pending_pings.remove(index);
        let rtt = pending.sent_at.elapsed();
        if let Some(reply) = pending.reply {
            let _ = reply.send(Ok(rtt));
        }
        let _ = self.events.send(ConnectionEvent::Latency {
            connection: self.id,
            rtt,
        });
    }

    async fn heartbeat_tick(&mut self) {
        if let Some(oldest) = self.pending_pings.first() {
            if oldest.sent_at.elapsed() >= self.config.ping_timeout() {
                warn!(
                    connection = %self.id,
                    timeout = ?self.config.ping_timeout(),
                    "no pong within ping timeout, treating as connection loss"
                );
                self.connection_lost("ping timeout").await;
                return;
            }
        }

        self.send_ping(None).await;
    }

    async fn send_ping(
        &mut self,
        reply: Option<oneshot::Sender<Result<Duration, ConnectionError>>>,
    ) {
        let Some(socket) = self.socket.as_mut() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ConnectionError::NotConnected));
            }
            return;
        };

        self.ping_seq = self.ping_seq.wrapping_add(1);
        let payload = self.ping_seq.to_be_bytes().to_vec();

        match socket.send(WsMessage::Ping(payload.clone())).await {
            Ok(()) => self.pending_pings.push(PendingPing {
                payload,
                sent_at: Instant::now(),
                reply,
            }),
            Err(error) => {
                warn!(connection = %self.id, %error, "failed to send heartbeat ping");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ConnectionError::WebSocket(Box::new(error))));
                }
                self.connection_lost("ping send failure").await;
            }
        }
    }

    async fn connection_lost(&mut self, reason: &str) {
        debug!(connection = %self.id, reason, "connection lost");
        self.socket = None;
        self.fail_pending_pings();
        let _ = self.events.send(ConnectionEvent::Disconnected {
            connection: self.id,
        });

        if self.closing {
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.schedule_reconnect();
    }

    fn fail_pending_pings(&mut self) {
        for pending in self.pending_pings.drain(..) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(ConnectionError::PongTimeout(
                    self.config.ping_timeout(),
                )));
            }
        }
    }

    async fn try_reconnect(&mut self) {
        let url = match self.target_url() {
            Ok(Some(url)) => url,
            Ok(None) => {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            Err(error) => {
                warn!(connection = %self.id, %error, "cannot rebuild combined stream URL");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        match self.establish(url).await {
            Ok(()) => {}
            Err(error) => {
                warn!(connection = %self.id, %error, "reconnect attempt failed");
                if self.backoff.exhausted() {
                    warn!(connection = %self.id, "reconnect attempts exhausted");
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    self.set_state(ConnectionState::Connecting);
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// Debounce window elapsed: apply the batched stream set change by
    /// reconnecting with the rebuilt combined-stream URL.
    async fn apply_stream_update(&mut self) {
        if self.stream_order.is_empty() {
            if let Some(mut socket) = self.socket.take() {
                let _ = socket.close(None).await;
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    connection: self.id,
                });
            }
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let url = match self.target_url() {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(error) => {
                warn!(connection = %self.id, %error, "cannot rebuild combined stream URL");
                return;
            }
        };

        info!(
            connection = %self.id,
            streams = self.stream_order.len(),
            "applying batched stream update via clean reconnect"
        );

        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            let _ = self.events.send(ConnectionEvent::Disconnected {
                connection: self.id,
            });
        }

        if let Err(error) = self.establish(url).await {
            warn!(connection = %self.id, %error, "stream update reconnect failed");
            self.set_state(ConnectionState::Connecting);
            self.schedule_reconnect();
        }
    }

    async fn shutdown(&mut self) {
        self.closing = true;
        self.reconnect_at = None;
        self.resubscribe_at = None;
        self.set_state(ConnectionState::Disconnecting);

        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            let _ = self.events.send(ConnectionEvent::Disconnected {
                connection: self.id,
            });
        }

        self.fail_pending_pings();
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn next_frame(socket: &mut Option<WebSocket>) -> Option<Result<WsMessage, WsError>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

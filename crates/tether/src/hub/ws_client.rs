//! Client-side WebSocket transport with automatic reconnect.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_protocol::HubMessage;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::error::HubError;
use super::subscription::{Observers, Unsubscribe};
use super::transport::{
    ConnectionHandler, ConnectionId, ConnectionState, IncomingMessage, MessageHandler, Transport,
    TransportEvent,
};

/// Connection id under which the server is known to the client hub.
pub const SERVER_CONNECTION_ID: &str = "server";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backoff for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up (state `failed`) after this many consecutive attempts.
    pub max_attempts: Option<u32>,
    pub initial_connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            initial_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

struct ClientInner {
    name: String,
    url: String,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    message_observers: Observers<IncomingMessage>,
    connection_observers: Observers<TransportEvent>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Connects to a daemon's `/ws` endpoint.
pub struct WebSocketClientTransport {
    inner: Arc<ClientInner>,
}

impl WebSocketClientTransport {
    pub fn new(name: impl Into<String>, url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                url: url.into(),
                policy,
                state,
                outbound: RwLock::new(None),
                message_observers: Observers::new(),
                connection_observers: Observers::new(),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Client transport '{}' {:?} -> {:?}", self.name, previous, next);
            self.connection_observers
                .emit(&TransportEvent::StateChanged(next));
        }
    }

    async fn connect(&self) -> Result<Socket, HubError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| HubError::Transport(format!("connect to {} failed: {}", self.url, e)))?;
        Ok(socket)
    }

    /// Pump one connected socket until it drops or the transport closes.
    async fn run_connection(&self, socket: Socket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.write().await = Some(tx);

        self.set_state(ConnectionState::Connected);
        self.connection_observers
            .emit(&TransportEvent::PeerConnected(SERVER_CONNECTION_ID.to_string()));
        info!("Client transport '{}' connected to {}", self.name, self.url);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(text) = outgoing else { break };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!("Client transport '{}' write failed: {}", self.name, e);
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.receive_text(text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Client transport '{}' read failed: {}", self.name, e);
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        *self.outbound.write().await = None;
        self.connection_observers
            .emit(&TransportEvent::PeerDisconnected(SERVER_CONNECTION_ID.to_string()));
    }

    fn receive_text(&self, text: &str) {
        match serde_json::from_str::<HubMessage>(text) {
            Ok(message) => self.message_observers.emit(&IncomingMessage {
                connection_id: SERVER_CONNECTION_ID.to_string(),
                message,
            }),
            Err(e) => warn!("Client transport '{}' got invalid frame: {}", self.name, e),
        }
    }

    /// Reconnect loop after the first successful connection.
    async fn supervise(self: Arc<Self>, first: Socket) {
        self.run_connection(first).await;

        let mut attempt: u32 = 0;
        while !self.shutdown.is_cancelled() {
            attempt += 1;
            if let Some(max) = self.policy.max_attempts
                && attempt > max
            {
                warn!(
                    "Client transport '{}' giving up after {} attempts",
                    self.name, max
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.policy.delay_for(attempt);
            debug!(
                "Client transport '{}' reconnecting in {:?} (attempt {})",
                self.name, delay, attempt
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }

            match self.connect().await {
                Ok(socket) => {
                    attempt = 0;
                    self.run_connection(socket).await;
                }
                Err(e) => debug!("{}", e),
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl Transport for WebSocketClientTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn initialize(&self) -> Result<(), HubError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.set_state(ConnectionState::Connecting);
        let connected =
            tokio::time::timeout(self.inner.policy.initial_connect_timeout, self.inner.connect())
                .await;
        let socket = match connected {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.inner.started.store(false, Ordering::SeqCst);
                self.inner.set_state(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                self.inner.started.store(false, Ordering::SeqCst);
                self.inner.set_state(ConnectionState::Failed);
                return Err(HubError::Transport(format!(
                    "connect to {} timed out",
                    self.inner.url
                )));
            }
        };

        tokio::spawn(Arc::clone(&self.inner).supervise(socket));
        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        let text = serde_json::to_string(message)?;
        let outbound = self.inner.outbound.read().await;
        let tx = outbound
            .as_ref()
            .ok_or_else(|| HubError::Transport("not connected".to_string()))?;
        tx.send(text)
            .map_err(|_| HubError::Transport("connection closed".to_string()))
    }

    async fn send_to(&self, connection_id: &str, message: &HubMessage) -> Result<(), HubError> {
        if connection_id != SERVER_CONNECTION_ID {
            return Err(HubError::Transport(format!(
                "unknown connection {connection_id}"
            )));
        }
        self.send(message).await
    }

    async fn close(&self) -> Result<(), HubError> {
        self.inner.shutdown.cancel();
        *self.inner.outbound.write().await = None;
        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn connections(&self) -> Vec<ConnectionId> {
        if self.is_ready() {
            vec![SERVER_CONNECTION_ID.to_string()]
        } else {
            Vec::new()
        }
    }

    fn on_message(&self, handler: MessageHandler) -> Unsubscribe {
        self.inner.message_observers.subscribe(handler)
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> Unsubscribe {
        self.inner.connection_observers.subscribe(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_initialize_fails_when_nothing_listens() {
        // Bind then drop to get a port nobody is listening on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = WebSocketClientTransport::new(
            "client",
            format!("ws://127.0.0.1:{port}/ws"),
            ReconnectPolicy {
                initial_connect_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        assert!(transport.initialize().await.is_err());
        assert_eq!(transport.state(), ConnectionState::Failed);
        assert!(transport.connections().is_empty());
    }
}

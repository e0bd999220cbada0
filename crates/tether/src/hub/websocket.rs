//! Server-side WebSocket transport.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::HubMessage;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::HubError;
use super::subscription::{Observers, Unsubscribe};
use super::transport::{
    ConnectionHandler, ConnectionId, ConnectionState, IncomingMessage, MessageHandler, Transport,
    TransportEvent,
};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Write side of one connected peer.
pub trait PeerSink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send_text(&self, text: &str) -> Result<(), HubError>;
}

/// Peer backed by the socket's writer task.
struct ChannelPeer {
    tx: mpsc::UnboundedSender<String>,
}

impl PeerSink for ChannelPeer {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_text(&self, text: &str) -> Result<(), HubError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| HubError::Transport("socket writer stopped".to_string()))
    }
}

struct Peer {
    sink: Arc<dyn PeerSink>,
    /// `connectionSessionId` the socket was opened with (`global` for the shared socket).
    connection_session_id: String,
}

/// Accepts browser sockets and fans messages out to them.
pub struct WebSocketServerTransport {
    name: String,
    peers: DashMap<ConnectionId, Peer>,
    state: watch::Sender<ConnectionState>,
    message_observers: Observers<IncomingMessage>,
    connection_observers: Observers<TransportEvent>,
    shutdown: CancellationToken,
}

impl WebSocketServerTransport {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            name: name.into(),
            peers: DashMap::new(),
            state,
            message_observers: Observers::new(),
            connection_observers: Observers::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connection_session_id(&self, connection_id: &str) -> Option<String> {
        self.peers
            .get(connection_id)
            .map(|peer| peer.connection_session_id.clone())
    }

    /// Add a peer and announce it. Returns the new connection id.
    pub fn add_peer(&self, sink: Arc<dyn PeerSink>, connection_session_id: &str) -> ConnectionId {
        let connection_id = Uuid::new_v4().to_string();
        self.peers.insert(
            connection_id.clone(),
            Peer {
                sink,
                connection_session_id: connection_session_id.to_string(),
            },
        );
        self.set_state(ConnectionState::Connected);
        self.connection_observers
            .emit(&TransportEvent::PeerConnected(connection_id.clone()));
        info!(
            "WebSocket connection {} opened ({}), {} open",
            connection_id,
            connection_session_id,
            self.peers.len()
        );
        connection_id
    }

    /// Remove a peer. The transport reports `disconnected` only once the
    /// last peer is gone.
    pub fn remove_peer(&self, connection_id: &str) {
        if self.peers.remove(connection_id).is_none() {
            return;
        }
        self.connection_observers
            .emit(&TransportEvent::PeerDisconnected(connection_id.to_string()));
        info!(
            "WebSocket connection {} closed, {} open",
            connection_id,
            self.peers.len()
        );
        if self.peers.is_empty() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Parse one text frame from a peer and hand it to the observers.
    pub fn receive_text(&self, connection_id: &str, text: &str) {
        match serde_json::from_str::<HubMessage>(text) {
            Ok(message) => self.message_observers.emit(&IncomingMessage {
                connection_id: connection_id.to_string(),
                message,
            }),
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!(
                    "Failed to parse message from connection {}: {} - {}",
                    connection_id, e, preview
                );
            }
        }
    }

    /// Drive one upgraded socket until it closes.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket, connection_session_id: String) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let connection_id = self.add_peer(Arc::new(ChannelPeer { tx }), &connection_session_id);

        let shutdown = self.shutdown.clone();
        let send_task = tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
            ping_interval.tick().await;

            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(text) = outgoing else { break };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        loop {
            let frame = tokio::select! {
                frame = receiver.next() => frame,
                _ = self.shutdown.cancelled() => break,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.receive_text(&connection_id, text.as_str()),
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from connection {}", connection_id);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("WebSocket error on connection {}: {}", connection_id, e);
                    break;
                }
            }
        }

        send_task.abort();
        self.remove_peer(&connection_id);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            self.connection_observers
                .emit(&TransportEvent::StateChanged(next));
        }
    }
}

#[async_trait]
impl Transport for WebSocketServerTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), HubError> {
        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        let text = serde_json::to_string(message)?;
        let mut delivered = 0usize;
        for entry in self.peers.iter() {
            let peer = entry.value();
            if !peer.sink.is_open() {
                continue;
            }
            match peer.sink.send_text(&text) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to connection {}: {}", entry.key(), e),
            }
        }
        if delivered == 0 {
            warn!(
                "No writable WebSocket connections; dropped {}",
                message.method
            );
        }
        Ok(())
    }

    async fn send_to(&self, connection_id: &str, message: &HubMessage) -> Result<(), HubError> {
        let sink = self
            .peers
            .get(connection_id)
            .map(|peer| Arc::clone(&peer.sink))
            .ok_or_else(|| HubError::Transport(format!("unknown connection {connection_id}")))?;
        if !sink.is_open() {
            return Err(HubError::Transport(format!(
                "connection {connection_id} is not open"
            )));
        }
        sink.send_text(&serde_json::to_string(message)?)
    }

    async fn close(&self) -> Result<(), HubError> {
        self.shutdown.cancel();
        let ids: Vec<ConnectionId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_peer(&id);
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.peers.is_empty()
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn on_message(&self, handler: MessageHandler) -> Unsubscribe {
        self.message_observers.subscribe(handler)
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> Unsubscribe {
        self.connection_observers.subscribe(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPeer {
        frames: Mutex<Vec<String>>,
    }

    impl PeerSink for RecordingPeer {
        fn is_open(&self) -> bool {
            true
        }

        fn send_text(&self, text: &str) -> Result<(), HubError> {
            self.frames.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct FailingPeer;

    impl PeerSink for FailingPeer {
        fn is_open(&self) -> bool {
            true
        }

        fn send_text(&self, _text: &str) -> Result<(), HubError> {
            Err(HubError::Transport("broken pipe".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_block_others() {
        let transport = WebSocketServerTransport::new("ws");
        let peers: Vec<Arc<RecordingPeer>> =
            (0..4).map(|_| Arc::new(RecordingPeer::default())).collect();

        transport.add_peer(peers[0].clone(), "global");
        transport.add_peer(peers[1].clone(), "global");
        transport.add_peer(Arc::new(FailingPeer), "global");
        transport.add_peer(peers[2].clone(), "global");
        transport.add_peer(peers[3].clone(), "global");

        let message = HubMessage::event("e1", "test.echo", json!({"message": "hi"}), "global");
        transport.send(&message).await.unwrap();

        for peer in &peers {
            assert_eq!(peer.frames.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_disconnected_only_when_last_peer_leaves() {
        let transport = WebSocketServerTransport::new("ws");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _hook = transport.on_connection_change(Arc::new(move |event: &TransportEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let a = transport.add_peer(Arc::new(RecordingPeer::default()), "global");
        let b = transport.add_peer(Arc::new(RecordingPeer::default()), "global");
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.remove_peer(&a);
        assert_eq!(transport.state(), ConnectionState::Connected);
        transport.remove_peer(&b);
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        let states: Vec<ConnectionState> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                TransportEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connected, ConnectionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_send_with_no_peers_is_not_an_error() {
        let transport = WebSocketServerTransport::new("ws");
        let message = HubMessage::event("e1", "state.system", json!({}), "global");
        assert!(transport.send(&message).await.is_ok());
        assert!(!transport.is_ready());
    }
}

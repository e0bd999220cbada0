//! Loopback transport connecting two hubs inside one process.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_protocol::HubMessage;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::error::HubError;
use super::subscription::{Observers, Unsubscribe};
use super::transport::{
    ConnectionHandler, ConnectionId, ConnectionState, IncomingMessage, MessageHandler, Transport,
    TransportEvent,
};

/// One end of an in-process pair. Messages sent on one end arrive on the other.
pub struct InProcessTransport {
    name: String,
    /// Connection id under which the other end is known.
    peer_id: ConnectionId,
    outbound: mpsc::UnboundedSender<HubMessage>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<HubMessage>>>,
    ready: Arc<AtomicBool>,
    message_observers: Arc<Observers<IncomingMessage>>,
    connection_observers: Observers<TransportEvent>,
    shutdown: CancellationToken,
}

impl InProcessTransport {
    /// Create both ends. `a` sees the peer as `b` and vice versa.
    pub fn pair(a: &str, b: &str) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self::end(a, b, a_tx, a_rx)),
            Arc::new(Self::end(b, a, b_tx, b_rx)),
        )
    }

    fn end(
        name: &str,
        peer: &str,
        outbound: mpsc::UnboundedSender<HubMessage>,
        inbound: mpsc::UnboundedReceiver<HubMessage>,
    ) -> Self {
        Self {
            name: name.to_string(),
            peer_id: peer.to_string(),
            outbound,
            inbound: Mutex::new(Some(inbound)),
            ready: Arc::new(AtomicBool::new(false)),
            message_observers: Arc::new(Observers::new()),
            connection_observers: Observers::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), HubError> {
        let Some(mut rx) = self.inbound.lock().await.take() else {
            return Ok(());
        };

        let observers = Arc::clone(&self.message_observers);
        let peer_id = self.peer_id.clone();
        let shutdown = self.shutdown.clone();
        let ready = Arc::clone(&self.ready);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = rx.recv() => message,
                    _ = shutdown.cancelled() => break,
                };
                let Some(message) = message else { break };
                observers.emit(&IncomingMessage {
                    connection_id: peer_id.clone(),
                    message,
                });
            }
            ready.store(false, Ordering::SeqCst);
            debug!("In-process pump for peer {} stopped", peer_id);
        });

        self.ready.store(true, Ordering::SeqCst);
        self.connection_observers
            .emit(&TransportEvent::StateChanged(ConnectionState::Connected));
        self.connection_observers
            .emit(&TransportEvent::PeerConnected(self.peer_id.clone()));
        Ok(())
    }

    async fn send(&self, message: &HubMessage) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| HubError::Transport(format!("peer {} is gone", self.peer_id)))
    }

    async fn send_to(&self, connection_id: &str, message: &HubMessage) -> Result<(), HubError> {
        if connection_id != self.peer_id {
            return Err(HubError::Transport(format!(
                "unknown connection {connection_id}"
            )));
        }
        self.send(message).await
    }

    async fn close(&self) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        let was_ready = self.ready.swap(false, Ordering::SeqCst);
        if was_ready {
            self.connection_observers
                .emit(&TransportEvent::PeerDisconnected(self.peer_id.clone()));
        }
        self.connection_observers
            .emit(&TransportEvent::StateChanged(ConnectionState::Disconnected));
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn connections(&self) -> Vec<ConnectionId> {
        if self.is_ready() {
            vec![self.peer_id.clone()]
        } else {
            Vec::new()
        }
    }

    fn on_message(&self, handler: MessageHandler) -> Unsubscribe {
        self.message_observers.subscribe(handler)
    }

    fn on_connection_change(&self, handler: ConnectionHandler) -> Unsubscribe {
        self.connection_observers.subscribe(handler)
    }
}

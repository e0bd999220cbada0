//! The transport seam between the hub and the wire.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tether_protocol::HubMessage;

use super::error::HubError;
use super::subscription::Unsubscribe;

pub type ConnectionId = String;

/// A message received from one peer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub connection_id: ConnectionId,
    pub message: HubMessage,
}

/// Aggregate connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(ConnectionId),
    PeerDisconnected(ConnectionId),
    StateChanged(ConnectionState),
}

pub type MessageHandler = Arc<dyn Fn(&IncomingMessage) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Bidirectional message channel to one or more peers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<(), HubError>;

    /// Deliver to every open peer. Per-peer failures are logged, not returned.
    async fn send(&self, message: &HubMessage) -> Result<(), HubError>;

    /// Deliver to a single peer.
    async fn send_to(&self, connection_id: &str, message: &HubMessage) -> Result<(), HubError>;

    async fn close(&self) -> Result<(), HubError>;

    /// At least one peer is connected.
    fn is_ready(&self) -> bool;

    /// Currently connected peers.
    fn connections(&self) -> Vec<ConnectionId>;

    fn on_message(&self, handler: MessageHandler) -> Unsubscribe;

    fn on_connection_change(&self, handler: ConnectionHandler) -> Unsubscribe;
}

//! Messaging core: the networked [`MessageHub`], its transports, and the
//! typed [`InProcessHub`] used between daemon components.

pub mod error;
pub mod in_process;
pub mod in_process_hub;
pub mod message_hub;
pub mod room;
pub mod subscription;
pub mod transport;
pub mod websocket;
pub mod ws_client;

pub use error::{HubError, InProcessHubError};
pub use in_process::InProcessTransport;
pub use in_process_hub::{HubEvent, InProcessHub};
pub use message_hub::{DEFAULT_REQUEST_TIMEOUT, MessageHub, RequestContext};
pub use room::RoomManager;
pub use subscription::Unsubscribe;
pub use transport::{ConnectionId, ConnectionState, IncomingMessage, Transport, TransportEvent};
pub use websocket::{PeerSink, WebSocketServerTransport};
pub use ws_client::{ReconnectPolicy, SERVER_CONNECTION_ID, WebSocketClientTransport};

//! HTTP surface: the `/ws` hub endpoint and `/health`.

pub mod handlers;
mod routes;

pub use routes::create_router;

use std::sync::Arc;

use crate::hub::WebSocketServerTransport;
use crate::state::StateManager;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub ws: Arc<WebSocketServerTransport>,
    pub state: Arc<StateManager>,
}

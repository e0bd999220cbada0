//! HTTP handlers.

use axum::Json;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tether_protocol::channels::GLOBAL_CHANNEL;
use tracing::{error, info, instrument};

use super::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Scope of the connection. The shared daemon socket uses `global`.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Upgrade to a hub connection.
#[instrument(skip(state, ws))]
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection_session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| GLOBAL_CHANNEL.to_string());
    info!(%connection_session_id, "WebSocket upgrade request");

    let transport = state.ws.clone();
    ws.on_upgrade(move |socket| transport.serve_socket(socket, connection_session_id))
}

pub async fn health(State(state): State<AppState>) -> Response {
    match state.state.health().await {
        Ok(health) => Json(health).into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

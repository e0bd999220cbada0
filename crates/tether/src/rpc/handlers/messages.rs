//! `message.*` handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_protocol::session::StoredMessage;
use tracing::{debug, instrument};

use super::SessionParams;
use crate::rpc::{RpcContext, RpcResult};
use crate::session::MessagePage;
use crate::session::query::SentMessage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub session_id: String,
    pub content: String,
}

/// Start a query. Returns once the agent accepted it; progress arrives as
/// events on the session channel.
#[instrument(skip(ctx, params), fields(session_id = %params.session_id))]
pub async fn send(ctx: RpcContext, params: SendParams) -> RpcResult<SentMessage> {
    let session = ctx.session(&params.session_id).await?;
    let sent = session.send_message(&params.content).await?;
    debug!(generation = sent.generation, "Message accepted");
    Ok(sent)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub session_id: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    /// Only messages at or after this timestamp (Unix ms).
    #[serde(default)]
    pub since: Option<i64>,
}

impl ListParams {
    fn page(&self) -> MessagePage {
        MessagePage {
            limit: self.limit,
            offset: self.offset,
            since: self.since,
        }
    }
}

pub async fn list(ctx: RpcContext, params: ListParams) -> RpcResult<Vec<StoredMessage>> {
    ctx.ensure_session_exists(&params.session_id).await?;
    let messages = ctx
        .sessions
        .services()
        .messages
        .list(&params.session_id, params.page())
        .await?;
    Ok(messages)
}

/// Raw agent messages, in order, for clients that render the agent's own
/// format.
pub async fn sdk_messages(ctx: RpcContext, params: ListParams) -> RpcResult<Vec<Value>> {
    ctx.ensure_session_exists(&params.session_id).await?;
    Ok(ctx
        .sessions
        .services()
        .messages
        .sdk_messages(&params.session_id, params.page())
        .await?)
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

pub async fn count(ctx: RpcContext, params: SessionParams) -> RpcResult<CountResponse> {
    ctx.ensure_session_exists(&params.session_id).await?;
    let count = ctx
        .sessions
        .services()
        .messages
        .count(&params.session_id)
        .await?;
    Ok(CountResponse { count })
}

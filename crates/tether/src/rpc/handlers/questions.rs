//! `question.*` handlers for the agent's interactive questions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_protocol::session::PendingQuestion;
use tracing::instrument;

use crate::rpc::{RpcContext, RpcResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondParams {
    pub session_id: String,
    pub tool_use_id: String,
    pub responses: Value,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[instrument(skip(ctx, params), fields(session_id = %params.session_id, tool_use_id = %params.tool_use_id))]
pub async fn respond(ctx: RpcContext, params: RespondParams) -> RpcResult<SuccessResponse> {
    let session = ctx.session(&params.session_id).await?;
    session
        .handle_question_response(&params.tool_use_id, params.responses)
        .await?;
    Ok(SuccessResponse { success: true })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftParams {
    pub session_id: String,
    pub responses: Value,
}

/// Store unsubmitted answers so other clients and reloads see them.
pub async fn save_draft(ctx: RpcContext, params: DraftParams) -> RpcResult<PendingQuestion> {
    let session = ctx.session(&params.session_id).await?;
    Ok(session.update_question_draft(params.responses).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub session_id: String,
    pub tool_use_id: String,
}

pub async fn cancel(ctx: RpcContext, params: CancelParams) -> RpcResult<SuccessResponse> {
    let session = ctx.session(&params.session_id).await?;
    session.handle_question_cancel(&params.tool_use_id).await?;
    Ok(SuccessResponse { success: true })
}

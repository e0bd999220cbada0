//! `rewind.*` handlers.
//!
//! These answer with a structured result instead of an RPC error, including
//! for unknown sessions, so clients can show why a rewind is unavailable.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_protocol::session::{RewindMode, RewindPoint, RewindPreview, RewindResult};
use tracing::{info, instrument, warn};

use super::SessionParams;
use crate::rpc::{RpcContext, RpcResult};
use crate::session::AgentSession;

async fn lookup(ctx: &RpcContext, session_id: &str) -> Result<Arc<AgentSession>, String> {
    ctx.session(session_id).await.map_err(|e| e.to_string())
}

#[derive(Debug, Default, Serialize)]
pub struct CheckpointsResponse {
    pub checkpoints: Vec<RewindPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn checkpoints(ctx: RpcContext, params: SessionParams) -> RpcResult<CheckpointsResponse> {
    let session = match lookup(&ctx, &params.session_id).await {
        Ok(session) => session,
        Err(error) => {
            return Ok(CheckpointsResponse {
                error: Some(error),
                ..Default::default()
            });
        }
    };
    Ok(match session.get_rewind_points().await {
        Ok(checkpoints) => CheckpointsResponse {
            checkpoints,
            error: None,
        },
        Err(e) => {
            warn!(session_id = %params.session_id, error = %e, "Failed to list rewind points");
            CheckpointsResponse {
                error: Some(format!("{e:#}")),
                ..Default::default()
            }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewParams {
    pub session_id: String,
    pub checkpoint_id: String,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub preview: RewindPreview,
}

pub async fn preview(ctx: RpcContext, params: PreviewParams) -> RpcResult<PreviewResponse> {
    let preview = match lookup(&ctx, &params.session_id).await {
        Ok(session) => session.preview_rewind(&params.checkpoint_id).await,
        Err(error) => RewindPreview::unavailable(error),
    };
    Ok(PreviewResponse { preview })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub session_id: String,
    pub checkpoint_id: String,
    #[serde(default)]
    pub mode: RewindMode,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub result: RewindResult,
}

#[instrument(skip(ctx))]
pub async fn execute(ctx: RpcContext, params: ExecuteParams) -> RpcResult<ExecuteResponse> {
    let result = match lookup(&ctx, &params.session_id).await {
        Ok(session) => {
            session
                .execute_rewind(&params.checkpoint_id, params.mode)
                .await
        }
        Err(error) => RewindResult::failed(error),
    };
    info!(success = result.success, "Rewind finished");
    Ok(ExecuteResponse { result })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectiveParams {
    pub session_id: String,
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub mode: RewindMode,
}

pub async fn preview_selective(
    ctx: RpcContext,
    params: SelectiveParams,
) -> RpcResult<PreviewResponse> {
    let preview = match lookup(&ctx, &params.session_id).await {
        Ok(session) => session.preview_selective_rewind(&params.message_ids).await,
        Err(error) => RewindPreview::unavailable(error),
    };
    Ok(PreviewResponse { preview })
}

#[instrument(skip(ctx))]
pub async fn execute_selective(
    ctx: RpcContext,
    params: SelectiveParams,
) -> RpcResult<ExecuteResponse> {
    let result = match lookup(&ctx, &params.session_id).await {
        Ok(session) => {
            session
                .execute_selective_rewind(&params.message_ids, params.mode)
                .await
        }
        Err(error) => RewindResult::failed(error),
    };
    info!(success = result.success, "Selective rewind finished");
    Ok(ExecuteResponse { result })
}

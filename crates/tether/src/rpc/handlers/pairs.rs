//! `pair.*` handlers for manager/worker session pairs.

use serde::Deserialize;
use tether_protocol::pair::{CreatePairRequest, PairStatus, SessionPair};
use tracing::{info, instrument};

use super::SessionParams;
use crate::rpc::{RpcContext, RpcError, RpcResult};

#[instrument(skip(ctx))]
pub async fn create(ctx: RpcContext, request: CreatePairRequest) -> RpcResult<SessionPair> {
    if request.manager_session_id == request.worker_session_id {
        return Err(RpcError::bad_request(
            "manager and worker must be different sessions",
        ));
    }
    let pair = ctx.pairs.create(&request).await?;
    info!(pair_id = %pair.id, room_id = %pair.room_id, "Created session pair");
    Ok(pair)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairParams {
    pub pair_id: String,
}

fn pair_not_found(id: &str) -> RpcError {
    RpcError::not_found(format!("Pair not found: {id}"))
}

pub async fn get(ctx: RpcContext, params: PairParams) -> RpcResult<SessionPair> {
    ctx.pairs
        .get(&params.pair_id)
        .await?
        .ok_or_else(|| pair_not_found(&params.pair_id))
}

/// The pair a session belongs to, or `null`.
pub async fn get_by_session(
    ctx: RpcContext,
    params: SessionParams,
) -> RpcResult<Option<SessionPair>> {
    Ok(ctx.pairs.get_by_session(&params.session_id).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusParams {
    pub pair_id: String,
    pub status: PairStatus,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

#[instrument(skip(ctx))]
pub async fn update_status(ctx: RpcContext, params: UpdateStatusParams) -> RpcResult<SessionPair> {
    ctx.pairs
        .update_status(
            &params.pair_id,
            params.status,
            params.current_task_id.as_deref(),
        )
        .await?
        .ok_or_else(|| pair_not_found(&params.pair_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub room_id: String,
}

pub async fn list(ctx: RpcContext, params: ListParams) -> RpcResult<Vec<SessionPair>> {
    Ok(ctx.pairs.list_by_room(&params.room_id).await?)
}

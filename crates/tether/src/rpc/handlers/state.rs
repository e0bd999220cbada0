//! Snapshot and catch-up methods of the state channels.

use serde::Deserialize;
use tether_protocol::state::{
    DeltaCatchUp, SessionSnapshot, SessionsSnapshot, SettingsSnapshot, SystemSnapshot,
};

use super::{NoParams, SessionParams};
use crate::rpc::{RpcContext, RpcResult};

pub async fn sessions_snapshot(ctx: RpcContext, _: NoParams) -> RpcResult<SessionsSnapshot> {
    Ok(ctx.state.sessions_snapshot().await?)
}

#[derive(Debug, Deserialize)]
pub struct DeltasParams {
    pub since: i64,
}

pub async fn sessions_deltas(ctx: RpcContext, params: DeltasParams) -> RpcResult<DeltaCatchUp> {
    Ok(ctx.state.deltas_since(params.since))
}

pub async fn system_snapshot(ctx: RpcContext, _: NoParams) -> RpcResult<SystemSnapshot> {
    Ok(ctx.state.system_snapshot().await?)
}

pub async fn settings_snapshot(ctx: RpcContext, _: NoParams) -> RpcResult<SettingsSnapshot> {
    Ok(ctx.state.settings_snapshot().await?)
}

pub async fn session_snapshot(ctx: RpcContext, params: SessionParams) -> RpcResult<SessionSnapshot> {
    Ok(ctx.state.session_snapshot(&params.session_id).await?)
}

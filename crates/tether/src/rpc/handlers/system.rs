//! `system.*` and `test.echo`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_protocol::channels::{GLOBAL_CHANNEL, events};
use tether_protocol::state::{DaemonConfigInfo, HealthStatus};

use super::NoParams;
use crate::rpc::{RpcContext, RpcResult};

pub async fn health(ctx: RpcContext, _: NoParams) -> RpcResult<HealthStatus> {
    Ok(ctx.state.health().await?)
}

pub async fn config(ctx: RpcContext, _: NoParams) -> RpcResult<DaemonConfigInfo> {
    Ok(ctx.state.config_info())
}

#[derive(Debug, Deserialize)]
pub struct EchoParams {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub message: String,
}

/// Answer with `message` (default `echo`) and broadcast it as a `test.echo`
/// event on `global`.
pub async fn echo(ctx: RpcContext, params: EchoParams) -> RpcResult<EchoResponse> {
    let message = params.message.unwrap_or_else(|| "echo".to_string());
    ctx.hub
        .event(events::TEST_ECHO, json!({ "message": message }), Some(GLOBAL_CHANNEL))
        .await;
    Ok(EchoResponse { message })
}

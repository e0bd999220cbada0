//! `settings.*` handlers.
//!
//! Every change is announced as `settings.updated`; flipping `showArchived`
//! also republishes the sessions list under the new filter.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_protocol::channels::{GLOBAL_CHANNEL, events};
use tether_protocol::session::SessionConfig;
use tether_protocol::settings::GlobalSettings;
use tracing::{info, instrument, warn};

use super::{NoParams, SessionParams};
use crate::events::DaemonEvent;
use crate::rpc::{RpcContext, RpcResult};

pub async fn global_get(ctx: RpcContext, _: NoParams) -> RpcResult<GlobalSettings> {
    Ok(ctx.settings.get_global().await?)
}

/// Merge a partial settings object into the global settings.
#[instrument(skip(ctx))]
pub async fn global_update(ctx: RpcContext, patch: Value) -> RpcResult<GlobalSettings> {
    let before = ctx.settings.get_global().await?;
    let after = ctx.settings.update_global(&patch).await?;
    info!("Updated global settings");
    announce(&ctx, &before, &after).await?;
    Ok(after)
}

/// Replace the global settings document.
#[instrument(skip(ctx))]
pub async fn global_save(ctx: RpcContext, settings: GlobalSettings) -> RpcResult<GlobalSettings> {
    let before = ctx.settings.get_global().await?;
    ctx.settings.save_global(&settings).await?;
    info!("Saved global settings");
    announce(&ctx, &before, &settings).await?;
    Ok(settings)
}

async fn announce(ctx: &RpcContext, before: &GlobalSettings, after: &GlobalSettings) -> RpcResult<()> {
    ctx.publish(DaemonEvent::global_settings(serde_json::to_value(after).map_err(anyhow::Error::from)?));

    if before.show_archived != after.show_archived {
        ctx.hub
            .event(
                events::SESSIONS_FILTER_CHANGED,
                json!({ "showArchived": after.show_archived }),
                Some(GLOBAL_CHANNEL),
            )
            .await;
        if let Err(e) = ctx.state.publish_sessions_snapshot().await {
            warn!(error = %e, "Failed to republish sessions after filter change");
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct McpToggleParams {
    pub server: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledMcpServers {
    pub disabled_mcp_servers: Vec<String>,
}

/// Enable or disable one MCP server for new queries.
pub async fn mcp_toggle(ctx: RpcContext, params: McpToggleParams) -> RpcResult<DisabledMcpServers> {
    let mut servers = ctx.settings.get_global().await?.disabled_mcp_servers;
    servers.retain(|s| s != &params.server);
    if !params.enabled {
        servers.push(params.server);
    }
    set_disabled(&ctx, servers).await
}

pub async fn mcp_get_disabled(ctx: RpcContext, _: NoParams) -> RpcResult<DisabledMcpServers> {
    Ok(DisabledMcpServers {
        disabled_mcp_servers: ctx.settings.get_global().await?.disabled_mcp_servers,
    })
}

#[derive(Debug, Deserialize)]
pub struct McpSetDisabledParams {
    pub servers: Vec<String>,
}

pub async fn mcp_set_disabled(
    ctx: RpcContext,
    params: McpSetDisabledParams,
) -> RpcResult<DisabledMcpServers> {
    set_disabled(&ctx, params.servers).await
}

async fn set_disabled(ctx: &RpcContext, mut servers: Vec<String>) -> RpcResult<DisabledMcpServers> {
    servers.sort();
    servers.dedup();
    let before = ctx.settings.get_global().await?;
    let after = ctx
        .settings
        .update_global(&json!({ "disabledMcpServers": servers }))
        .await?;
    announce(ctx, &before, &after).await?;
    Ok(DisabledMcpServers {
        disabled_mcp_servers: after.disabled_mcp_servers,
    })
}

pub async fn session_get(ctx: RpcContext, params: SessionParams) -> RpcResult<SessionConfig> {
    let session = ctx.session(&params.session_id).await?;
    Ok(session.session().await.config)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    pub session_id: String,
    pub settings: Value,
}

#[instrument(skip(ctx))]
pub async fn session_update(ctx: RpcContext, params: SessionUpdateParams) -> RpcResult<SessionConfig> {
    let session = ctx.session(&params.session_id).await?;
    let config = session.update_config(&params.settings).await?;
    ctx.publish(DaemonEvent::SettingsUpdated {
        scope: params.session_id,
        settings: serde_json::to_value(&config).map_err(anyhow::Error::from)?,
    });
    Ok(config)
}

//! `session.*` and `context.*` handlers.

use serde::{Deserialize, Serialize};
use tether_protocol::session::{ContextInfo, Session, SessionConfig};
use tracing::{info, instrument};

use super::SessionParams;
use crate::rpc::{RpcContext, RpcError, RpcResult};
use crate::session::{CreateSessionParams, SessionError};

/// Create a session. Its workspace is initialized by the first message.
#[instrument(skip(ctx))]
pub async fn create(ctx: RpcContext, params: CreateSessionParams) -> RpcResult<Session> {
    let session = ctx.sessions.create_session(params).await?;
    info!(session_id = %session.id, "Created session");
    Ok(session)
}

pub async fn get(ctx: RpcContext, params: SessionParams) -> RpcResult<Session> {
    ctx.sessions
        .get(&params.session_id)
        .await?
        .ok_or_else(|| RpcError::not_found(SessionError::NotFound(params.session_id).to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Defaults to the `showArchived` setting.
    #[serde(default)]
    pub include_archived: Option<bool>,
}

pub async fn list(ctx: RpcContext, params: ListParams) -> RpcResult<Vec<Session>> {
    let include_archived = match params.include_archived {
        Some(include) => include,
        None => ctx.settings.get_global().await?.show_archived,
    };
    Ok(ctx.sessions.list(include_archived).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

#[instrument(skip(ctx))]
pub async fn update(ctx: RpcContext, params: UpdateParams) -> RpcResult<Session> {
    if params.title.is_none() && params.config.is_none() {
        return Err(RpcError::bad_request("Nothing to update: pass title or config"));
    }
    let session = ctx
        .sessions
        .update(&params.session_id, params.title, params.config)
        .await?;
    info!(session_id = %session.id, "Updated session");
    Ok(session)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveParams {
    pub session_id: String,
    #[serde(default)]
    pub cleanup_worktree: bool,
}

#[instrument(skip(ctx))]
pub async fn archive(ctx: RpcContext, params: ArchiveParams) -> RpcResult<Session> {
    let session = ctx
        .sessions
        .archive(&params.session_id, params.cleanup_worktree)
        .await?;
    info!(session_id = %session.id, cleanup_worktree = params.cleanup_worktree, "Archived session");
    Ok(session)
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[instrument(skip(ctx))]
pub async fn delete(ctx: RpcContext, params: SessionParams) -> RpcResult<DeleteResponse> {
    let deleted = ctx.sessions.delete(&params.session_id).await?;
    if !deleted {
        return Err(RpcError::not_found(
            SessionError::NotFound(params.session_id).to_string(),
        ));
    }
    Ok(DeleteResponse { deleted })
}

#[derive(Debug, Serialize)]
pub struct InterruptResponse {
    pub interrupted: bool,
}

/// Stop the running query. `interrupted` is false when nothing was running.
pub async fn interrupt(ctx: RpcContext, params: SessionParams) -> RpcResult<InterruptResponse> {
    let session = ctx.session(&params.session_id).await?;
    Ok(InterruptResponse {
        interrupted: session.interrupt().await,
    })
}

pub async fn context_get(ctx: RpcContext, params: SessionParams) -> RpcResult<ContextInfo> {
    let session = ctx.session(&params.session_id).await?;
    Ok(session.context_info().await?)
}

#[derive(Debug, Serialize)]
pub struct CompactResponse {
    pub compacted: bool,
    pub context: ContextInfo,
}

pub async fn context_compact(ctx: RpcContext, params: SessionParams) -> RpcResult<CompactResponse> {
    let session = ctx.session(&params.session_id).await?;
    let compacted = session.compact().await?;
    Ok(CompactResponse {
        compacted,
        context: session.context_info().await?,
    })
}

//! `worktree.*` handlers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tether_protocol::session::CommitsAhead;
use tracing::{info, instrument, warn};

use super::SessionParams;
use crate::rpc::{RpcContext, RpcResult};

/// Commits on the session branch that its base branch lacks. Sessions
/// without a worktree have none.
pub async fn commits_ahead(ctx: RpcContext, params: SessionParams) -> RpcResult<CommitsAhead> {
    let session = ctx.session(&params.session_id).await?;
    let Some(worktree) = session.session().await.worktree.filter(|wt| wt.is_worktree) else {
        return Ok(CommitsAhead::default());
    };
    Ok(ctx.worktrees.get_commits_ahead(&worktree).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupParams {
    /// Sweep only this repository instead of every repository with session
    /// worktrees.
    #[serde(default)]
    pub repo_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: Vec<String>,
}

#[instrument(skip(ctx))]
pub async fn cleanup_orphans(ctx: RpcContext, params: CleanupParams) -> RpcResult<CleanupResponse> {
    if let Some(repo) = params.repo_path {
        let removed = ctx
            .worktrees
            .cleanup_orphaned_worktrees(&PathBuf::from(repo))
            .await?;
        return Ok(CleanupResponse { removed });
    }

    let mut removed = Vec::new();
    for repo in ctx.sessions.services().sessions.worktree_repositories().await? {
        match ctx
            .worktrees
            .cleanup_orphaned_worktrees(&PathBuf::from(&repo))
            .await
        {
            Ok(paths) => removed.extend(paths),
            Err(e) => warn!(repo = %repo, error = %format!("{e:#}"), "Orphan cleanup failed"),
        }
    }
    info!(count = removed.len(), "Removed orphaned worktrees");
    Ok(CleanupResponse { removed })
}

//! Session lifecycle and the registry of live [`AgentSession`]s.
//!
//! Creating a session only inserts its row. The runtime is built lazily by
//! [`SessionManager::get_session_async`], at most once per id: concurrent
//! callers wait on the same cell and get the same instance.

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tether_protocol::session::{Session, SessionConfig, SessionMetadata, SessionStatus};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agent_session::AgentSession;
use super::context::ContextManager;
use super::title::DEFAULT_TITLE;
use super::{SessionError, SessionServices};
use crate::events::DaemonEvent;
use crate::worktree::snapshot;

/// Parameters of `session.create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    pub workspace_path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

type LiveCell = Arc<OnceCell<Arc<AgentSession>>>;

pub struct SessionManager {
    services: Arc<SessionServices>,
    live: DashMap<String, LiveCell>,
}

impl SessionManager {
    pub fn new(services: Arc<SessionServices>) -> Self {
        Self {
            services,
            live: DashMap::new(),
        }
    }

    pub fn services(&self) -> &Arc<SessionServices> {
        &self.services
    }

    /// Stage 1: insert the row and return. Title, branch and worktree are
    /// settled by the first message.
    pub async fn create_session(&self, params: CreateSessionParams) -> Result<Session> {
        let workspace_path = params.workspace_path.trim();
        if workspace_path.is_empty() {
            bail!("workspacePath must not be empty");
        }
        if !Path::new(workspace_path).is_dir() {
            bail!("Workspace path does not exist: {workspace_path}");
        }

        let now = chrono::Utc::now().to_rfc3339();
        let title = params
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let session = Session {
            id: Uuid::new_v4().to_string(),
            metadata: SessionMetadata {
                title_generated: title.is_some(),
                ..Default::default()
            },
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            workspace_path: workspace_path.to_string(),
            status: SessionStatus::Active,
            config: params.config.unwrap_or_default(),
            workspace_initialized: false,
            worktree: None,
            created_at: now.clone(),
            last_active_at: now,
            archived_at: None,
        };

        self.services
            .sessions
            .create(&session)
            .await
            .context("Failed to create session")?;
        info!(session_id = %session.id, workspace = %session.workspace_path, "created session");

        self.services.publish(DaemonEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// The live session for `id`, constructing it on first use. `None` when
    /// no such session row exists.
    pub async fn get_session_async(&self, id: &str) -> Result<Option<Arc<AgentSession>>> {
        let cell = self
            .live
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                let session = self
                    .services
                    .sessions
                    .get(id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
                let agent = AgentSession::open(session, Arc::clone(&self.services)).await?;
                debug!(session_id = %id, "instantiated live session");
                Ok::<_, SessionError>(agent)
            })
            .await;

        match result {
            Ok(agent) => Ok(Some(Arc::clone(agent))),
            Err(e) => {
                // Only drop the cell we created; a concurrent call may have
                // replaced it already.
                self.live
                    .remove_if(id, |_, existing| Arc::ptr_eq(existing, &cell) && !cell.initialized());
                match e {
                    SessionError::NotFound(_) => Ok(None),
                    other => Err(anyhow::Error::from(other)),
                }
            }
        }
    }

    /// Like [`Self::get_session_async`] but a missing session is an error.
    pub async fn require(&self, id: &str) -> Result<Arc<AgentSession>> {
        self.get_session_async(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()).into())
    }

    /// Live instance without constructing one.
    pub fn live_session(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.live.get(id).and_then(|cell| cell.get().cloned())
    }

    /// Sessions with a live runtime.
    pub fn active_sessions(&self) -> usize {
        self.live.iter().filter(|cell| cell.initialized()).count()
    }

    pub async fn total_sessions(&self) -> Result<u64> {
        self.services.sessions.count().await
    }

    pub async fn list(&self, include_archived: bool) -> Result<Vec<Session>> {
        self.services.sessions.list(include_archived).await
    }

    /// The current row; taken from the live instance when there is one.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        if let Some(agent) = self.live_session(id) {
            return Ok(Some(agent.session().await));
        }
        self.services.sessions.get(id).await
    }

    pub async fn update(
        &self,
        id: &str,
        title: Option<String>,
        config: Option<SessionConfig>,
    ) -> Result<Session> {
        self.require(id).await?.update(title, config).await
    }

    /// Archive and drop the live instance.
    pub async fn archive(&self, id: &str, cleanup_worktree: bool) -> Result<Session> {
        let agent = self.require(id).await?;
        let session = agent.archive(cleanup_worktree).await?;
        self.destroy(id).await;
        Ok(session)
    }

    /// Remove the session with its messages, context, checkpoints and
    /// worktree. Returns false if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.destroy(id).await;
        let Some(session) = self.services.sessions.get(id).await? else {
            return Ok(false);
        };

        let workspace = Path::new(session.effective_workspace()).to_path_buf();
        if let Err(e) = snapshot::delete_checkpoints(&workspace, id).await {
            warn!(session_id = %id, error = %format!("{e:#}"), "failed to drop checkpoints");
        }
        if let Some(worktree) = session.worktree.as_ref().filter(|wt| wt.is_worktree)
            && let Err(e) = self.services.worktrees.remove_worktree(worktree).await
        {
            warn!(session_id = %id, error = %format!("{e:#}"), "failed to remove worktree");
        }

        self.services.messages.delete_for_session(id).await?;
        ContextManager::open(
            self.services.pool.clone(),
            id,
            Arc::clone(&self.services.estimator),
            self.services.options.compaction,
        )
        .await?
        .destroy()
        .await?;
        let deleted = self.services.sessions.delete(id).await?;

        if deleted {
            info!(session_id = %id, "deleted session");
            self.services.publish(DaemonEvent::SessionDeleted {
                session_id: id.to_string(),
            });
        }
        Ok(deleted)
    }

    /// Drop the live instance of `id`, stopping its query.
    pub async fn destroy(&self, id: &str) {
        let Some((_, cell)) = self.live.remove(id) else {
            return;
        };
        if let Some(agent) = cell.get() {
            agent.cleanup().await;
        }
    }

    /// Destroy every live instance.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.live.iter().map(|entry| entry.key().clone()).collect();
        for id in &ids {
            self.destroy(id).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "destroyed live sessions");
        }
    }
}

//! Sessions: persistence, the live [`AgentSession`] runtime and the
//! [`SessionManager`] that owns it.

pub mod agent_session;
pub mod context;
pub mod error_manager;
pub mod manager;
pub mod message_repository;
pub mod models;
pub mod query;
pub mod questions;
pub mod repository;
pub mod rewind;
pub mod title;

use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

pub use agent_session::AgentSession;
pub use context::{CharRatioEstimator, CompactionPolicy, ContextManager, TokenEstimator};
pub use manager::{CreateSessionParams, SessionManager};
pub use message_repository::{MessagePage, MessageRepository};
pub use repository::SessionRepository;
pub use rewind::RewindHandler;

use crate::agent::AgentEngine;
use crate::events::DaemonEvent;
use crate::hub::InProcessHub;
use crate::settings::SettingsRepository;
use crate::worktree::WorktreeManager;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub default_model: String,
    pub context_capacity: u64,
    pub compaction: CompactionPolicy,
    pub worktrees_enabled: bool,
    pub error_history: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            context_capacity: 200_000,
            compaction: CompactionPolicy::default(),
            worktrees_enabled: true,
            error_history: 20,
        }
    }
}

/// Everything a session needs from the daemon.
pub struct SessionServices {
    pub pool: SqlitePool,
    pub sessions: SessionRepository,
    pub messages: MessageRepository,
    pub settings: SettingsRepository,
    pub worktrees: Arc<WorktreeManager>,
    pub engine: Arc<dyn AgentEngine>,
    pub events: InProcessHub<DaemonEvent>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub options: SessionOptions,
}

impl SessionServices {
    /// Emit on the in-process hub. A hub that is not running drops the event.
    pub fn publish(&self, event: DaemonEvent) {
        if let Err(e) = self.events.emit(event) {
            debug!(error = %e, "dropping daemon event");
        }
    }
}

//! Database rows for sessions and messages.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::FromRow;
use tether_protocol::session::{MessageRole, Session, StoredMessage};

/// Row of the `sessions` table. JSON columns are kept as text.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub title: String,
    pub workspace_path: String,
    pub status: String,
    pub config: String,
    pub metadata: String,
    pub workspace_initialized: bool,
    pub worktree: Option<String>,
    pub created_at: String,
    pub last_active_at: String,
    pub archived_at: Option<String>,
}

impl SessionRow {
    pub fn into_session(self) -> Result<Session> {
        let status = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let config = serde_json::from_str(&self.config)
            .with_context(|| format!("parsing config of session {}", self.id))?;
        let metadata = serde_json::from_str(&self.metadata)
            .with_context(|| format!("parsing metadata of session {}", self.id))?;
        let worktree = self
            .worktree
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("parsing worktree of session {}", self.id))?;

        Ok(Session {
            id: self.id,
            title: self.title,
            workspace_path: self.workspace_path,
            status,
            config,
            metadata,
            workspace_initialized: self.workspace_initialized,
            worktree,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            archived_at: self.archived_at,
        })
    }
}

/// Row of the `messages` table.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub sdk_message: Option<String>,
    /// Git tree of the workspace when the message was stored (user messages).
    pub checkpoint: Option<String>,
    pub timestamp: i64,
}

impl MessageRow {
    pub fn to_stored(&self) -> Result<StoredMessage> {
        let role: MessageRole = self
            .role
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let sdk_message = self
            .sdk_message
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .with_context(|| format!("parsing sdk message {}", self.id))?;
        Ok(StoredMessage {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            role,
            content: self.content.clone(),
            sdk_message,
            timestamp: self.timestamp,
        })
    }
}

//! Session database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tether_protocol::session::{Session, SessionMetadata, SessionStatus, WorktreeMetadata};

use super::models::SessionRow;

const SESSION_COLUMNS: &str = "id, title, workspace_path, status, config, metadata, \
     workspace_initialized, worktree, created_at, last_active_at, archived_at";

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, title, workspace_path, status, config, metadata,
                workspace_initialized, worktree, created_at, last_active_at, archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(&session.workspace_path)
        .bind(session.status.as_str())
        .bind(serde_json::to_string(&session.config)?)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(session.workspace_initialized)
        .bind(worktree_json(session.worktree.as_ref())?)
        .bind(&session.created_at)
        .bind(&session.last_active_at)
        .bind(&session.archived_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Most recently active first.
    pub async fn list(&self, include_archived: bool) -> Result<Vec<Session>> {
        let sql = if include_archived {
            format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_active_at DESC")
        } else {
            format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active' \
                 ORDER BY last_active_at DESC"
            )
        };
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await
            .context("counting sessions")?;
        Ok(count as u64)
    }

    /// Write every mutable column of `session`.
    pub async fn update(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET title = ?, workspace_path = ?, status = ?, config = ?, metadata = ?,
                workspace_initialized = ?, worktree = ?, last_active_at = ?, archived_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&session.title)
        .bind(&session.workspace_path)
        .bind(session.status.as_str())
        .bind(serde_json::to_string(&session.config)?)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(session.workspace_initialized)
        .bind(worktree_json(session.worktree.as_ref())?)
        .bind(&session.last_active_at)
        .bind(&session.archived_at)
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .context("updating session")?;

        Ok(())
    }

    pub async fn update_metadata(&self, id: &str, metadata: &SessionMetadata) -> Result<()> {
        sqlx::query("UPDATE sessions SET metadata = ? WHERE id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session metadata")?;
        Ok(())
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching session")?;
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let archived_at = match status {
            SessionStatus::Archived => Some(chrono::Utc::now().to_rfc3339()),
            SessionStatus::Active => None,
        };
        sqlx::query("UPDATE sessions SET status = ?, archived_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(archived_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;
        Ok(())
    }

    /// Returns false if no such session existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(result.rows_affected() > 0)
    }

    /// Main repositories of every session that has a worktree.
    pub async fn worktree_repositories(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT worktree FROM sessions WHERE worktree IS NOT NULL")
                .fetch_all(&self.pool)
                .await
                .context("listing session worktrees")?;

        let mut repos: Vec<String> = rows
            .into_iter()
            .filter_map(|(json,)| serde_json::from_str::<WorktreeMetadata>(&json).ok())
            .filter(|wt| wt.is_worktree)
            .map(|wt| wt.main_repo_path)
            .collect();
        repos.sort();
        repos.dedup();
        Ok(repos)
    }
}

fn worktree_json(worktree: Option<&WorktreeMetadata>) -> Result<Option<String>> {
    Ok(worktree.map(serde_json::to_string).transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tether_protocol::session::{SessionConfig, SessionMetadata};

    fn session(id: &str, last_active_at: &str) -> Session {
        Session {
            id: id.to_string(),
            title: "New session".to_string(),
            workspace_path: "/tmp/ws".to_string(),
            status: SessionStatus::Active,
            config: SessionConfig::default(),
            metadata: SessionMetadata::default(),
            workspace_initialized: false,
            worktree: None,
            created_at: last_active_at.to_string(),
            last_active_at: last_active_at.to_string(),
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn test_session_crud() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        // Create
        repo.create(&session("a", "2024-01-01T00:00:00Z")).await.unwrap();
        repo.create(&session("b", "2024-01-02T00:00:00Z")).await.unwrap();

        // Read
        let fetched = repo.get("a").await.unwrap().unwrap();
        assert_eq!(fetched.title, "New session");
        assert!(!fetched.workspace_initialized);
        assert!(repo.get("missing").await.unwrap().is_none());

        // Update
        let mut updated = fetched.clone();
        updated.title = "Fix the parser".to_string();
        updated.workspace_initialized = true;
        updated.worktree = Some(WorktreeMetadata {
            is_worktree: true,
            worktree_path: "/wt/a".into(),
            main_repo_path: "/repo".into(),
            branch: "session/fix-the-parser-a".into(),
        });
        updated.metadata.message_count = 3;
        repo.update(&updated).await.unwrap();
        assert_eq!(repo.get("a").await.unwrap().unwrap(), updated);
        assert_eq!(repo.worktree_repositories().await.unwrap(), vec!["/repo"]);

        // List orders by activity
        let ids: Vec<String> = repo.list(false).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        // Archive hides from the default listing
        repo.set_status("b", SessionStatus::Archived).await.unwrap();
        assert_eq!(repo.list(false).await.unwrap().len(), 1);
        assert_eq!(repo.list(true).await.unwrap().len(), 2);
        assert!(repo.get("b").await.unwrap().unwrap().archived_at.is_some());

        // Delete
        assert!(repo.delete("b").await.unwrap());
        assert!(!repo.delete("b").await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}

//! Conversation message storage.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use tether_protocol::session::{MessageRole, StoredMessage};
use uuid::Uuid;

use super::models::MessageRow;

const MESSAGE_COLUMNS: &str =
    "id, session_id, seq, role, content, sdk_message, checkpoint, timestamp";

/// Pagination for message listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePage {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Only messages with a timestamp at or after this (Unix ms). Callers
    /// catching up pass the newest timestamp they hold and dedupe by id.
    pub since: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub session_id: &'a str,
    pub role: MessageRole,
    pub content: &'a str,
    pub sdk_message: Option<&'a Value>,
    pub checkpoint: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a message; its sequence number is the next in the session.
    pub async fn insert(&self, message: NewMessage<'_>) -> Result<MessageRow> {
        let id = Uuid::new_v4().to_string();
        let timestamp = tether_protocol::now_ms();
        let sdk_message = message.sdk_message.map(Value::to_string);

        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, seq, role, content, sdk_message, checkpoint, timestamp)
            SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?, ?
            FROM messages WHERE session_id = ?
            "#,
        )
        .bind(&id)
        .bind(message.session_id)
        .bind(message.role.as_str())
        .bind(message.content)
        .bind(&sdk_message)
        .bind(message.checkpoint)
        .bind(timestamp)
        .bind(message.session_id)
        .execute(&self.pool)
        .await
        .context("inserting message")?;

        self.get(&id)
            .await?
            .with_context(|| format!("message {id} vanished after insert"))
    }

    pub async fn get(&self, id: &str) -> Result<Option<MessageRow>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching message")
    }

    /// Oldest first.
    pub async fn list(&self, session_id: &str, page: MessagePage) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = ? AND timestamp >= ? \
             ORDER BY seq ASC LIMIT ? OFFSET ?"
        ))
        .bind(session_id)
        .bind(page.since.unwrap_or(i64::MIN))
        .bind(page.limit.unwrap_or(-1))
        .bind(page.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        rows.iter().map(MessageRow::to_stored).collect()
    }

    /// Every row of a session, oldest first, including checkpoints.
    pub async fn rows(&self, session_id: &str) -> Result<Vec<MessageRow>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? ORDER BY seq ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing message rows")
    }

    /// Raw SDK messages, oldest first.
    pub async fn sdk_messages(&self, session_id: &str, page: MessagePage) -> Result<Vec<Value>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT sdk_message FROM messages
            WHERE session_id = ? AND sdk_message IS NOT NULL AND timestamp >= ?
            ORDER BY seq ASC LIMIT ? OFFSET ?
            "#,
        )
        .bind(session_id)
        .bind(page.since.unwrap_or(i64::MIN))
        .bind(page.limit.unwrap_or(-1))
        .bind(page.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .context("listing sdk messages")?;

        rows.into_iter()
            .map(|(raw,)| serde_json::from_str(&raw).context("parsing sdk message"))
            .collect()
    }

    pub async fn count(&self, session_id: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .context("counting messages")?;
        Ok(count as u64)
    }

    pub async fn set_checkpoint(&self, id: &str, checkpoint: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET checkpoint = ? WHERE id = ?")
            .bind(checkpoint)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("recording checkpoint")?;
        Ok(())
    }

    /// Delete the message at `seq` and everything after it.
    pub async fn delete_from_seq(&self, session_id: &str, seq: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ? AND seq >= ?")
            .bind(session_id)
            .bind(seq)
            .execute(&self.pool)
            .await
            .context("deleting messages")?;
        Ok(result.rows_affected())
    }

    pub async fn delete_ids(&self, ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for id in ids {
            deleted += sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .context("deleting message")?
                .rows_affected();
        }
        Ok(deleted)
    }

    pub async fn delete_for_session(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("deleting session messages")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn user<'a>(session_id: &'a str, content: &'a str) -> NewMessage<'a> {
        NewMessage {
            session_id,
            role: MessageRole::User,
            content,
            sdk_message: None,
            checkpoint: None,
        }
    }

    #[tokio::test]
    async fn test_sequence_is_per_session() {
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());

        let a1 = repo.insert(user("a", "one")).await.unwrap();
        let b1 = repo.insert(user("b", "other")).await.unwrap();
        let a2 = repo.insert(user("a", "two")).await.unwrap();

        assert_eq!((a1.seq, a2.seq, b1.seq), (1, 2, 1));
        assert_eq!(repo.count("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pagination_and_sdk_messages() {
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        let raw = json!({"type": "assistant", "message": {"content": "hi"}});

        for i in 0..5 {
            repo.insert(user("s", &format!("m{i}"))).await.unwrap();
        }
        repo.insert(NewMessage {
            session_id: "s",
            role: MessageRole::Assistant,
            content: "hi",
            sdk_message: Some(&raw),
            checkpoint: None,
        })
        .await
        .unwrap();

        let page = repo
            .list(
                "s",
                MessagePage {
                    limit: Some(2),
                    offset: Some(1),
                    since: None,
                },
            )
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);

        let sdk = repo.sdk_messages("s", MessagePage::default()).await.unwrap();
        assert_eq!(sdk, vec![raw]);
    }

    #[tokio::test]
    async fn test_since_includes_boundary_timestamp() {
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        let first = repo.insert(user("s", "first")).await.unwrap();
        repo.insert(user("s", "second")).await.unwrap();

        let page = repo
            .list(
                "s",
                MessagePage {
                    since: Some(first.timestamp),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_delete_from_seq() {
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        for i in 0..4 {
            repo.insert(user("s", &format!("m{i}"))).await.unwrap();
        }

        assert_eq!(repo.delete_from_seq("s", 3).await.unwrap(), 2);
        let rest = repo.list("s", MessagePage::default()).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].content, "m1");
    }
}

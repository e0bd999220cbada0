//! Token accounting and compaction for one conversation context.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tether_protocol::session::StoredMessage;
use tracing::{debug, info};
use uuid::Uuid;

/// Estimates how many tokens a piece of text costs.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// `ceil(len / ratio)`, where `len` counts UTF-16 code units so astral
/// characters such as emoji weigh two.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        text.encode_utf16().count().div_ceil(self.chars_per_token) as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    pub token_limit: u64,
    /// Non-system messages kept when compacting.
    pub keep_recent: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            token_limit: 150_000,
            keep_recent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    pub id: String,
    pub context_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub token_count: i64,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Messages and token total of one context row. Contexts are keyed by owner
/// (a session or room id) and never see each other's messages.
pub struct ContextManager {
    pool: SqlitePool,
    context_id: String,
    owner_id: String,
    estimator: Arc<dyn TokenEstimator>,
    policy: CompactionPolicy,
}

impl ContextManager {
    /// Load the context of `owner_id`, creating it on first use.
    pub async fn open(
        pool: SqlitePool,
        owner_id: &str,
        estimator: Arc<dyn TokenEstimator>,
        policy: CompactionPolicy,
    ) -> Result<Self> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM contexts WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_optional(&pool)
                .await
                .context("fetching context")?;

        let context_id = match existing {
            Some((id,)) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO contexts (id, owner_id, total_tokens, created_at) VALUES (?, ?, 0, ?)",
                )
                .bind(&id)
                .bind(owner_id)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&pool)
                .await
                .context("creating context")?;
                id
            }
        };

        Ok(Self {
            pool,
            context_id,
            owner_id: owner_id.to_string(),
            estimator,
            policy,
        })
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn policy(&self) -> CompactionPolicy {
        self.policy
    }

    pub fn estimate(&self, text: &str) -> u64 {
        self.estimator.estimate(text)
    }

    pub async fn add_message(
        &self,
        role: &str,
        content: &str,
        metadata: Option<&Value>,
    ) -> Result<ContextMessage> {
        let message = ContextMessage {
            id: Uuid::new_v4().to_string(),
            context_id: self.context_id.clone(),
            seq: 0,
            role: role.to_string(),
            content: content.to_string(),
            token_count: self.estimator.estimate(content) as i64,
            metadata: metadata.map(Value::to_string),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut tx = self.pool.begin().await.context("starting transaction")?;
        let (seq,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM context_messages WHERE context_id = ?",
        )
        .bind(&self.context_id)
        .fetch_one(&mut *tx)
        .await
        .context("allocating context sequence")?;

        sqlx::query(
            r#"
            INSERT INTO context_messages (id, context_id, seq, role, content, token_count, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.context_id)
        .bind(seq)
        .bind(&message.role)
        .bind(&message.content)
        .bind(message.token_count)
        .bind(&message.metadata)
        .bind(&message.created_at)
        .execute(&mut *tx)
        .await
        .context("inserting context message")?;

        sqlx::query("UPDATE contexts SET total_tokens = total_tokens + ? WHERE id = ?")
            .bind(message.token_count)
            .bind(&self.context_id)
            .execute(&mut *tx)
            .await
            .context("updating context total")?;

        tx.commit().await.context("committing context message")?;
        Ok(ContextMessage { seq, ..message })
    }

    pub async fn messages(&self) -> Result<Vec<ContextMessage>> {
        sqlx::query_as::<_, ContextMessage>(
            r#"
            SELECT id, context_id, seq, role, content, token_count, metadata, created_at
            FROM context_messages WHERE context_id = ? ORDER BY seq ASC
            "#,
        )
        .bind(&self.context_id)
        .fetch_all(&self.pool)
        .await
        .context("listing context messages")
    }

    /// Sum of the stored messages' token counts.
    pub async fn get_token_count(&self) -> Result<u64> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(token_count), 0) FROM context_messages WHERE context_id = ?",
        )
        .bind(&self.context_id)
        .fetch_one(&self.pool)
        .await
        .context("summing context tokens")?;
        Ok(total.max(0) as u64)
    }

    pub async fn last_compacted_at(&self) -> Result<Option<String>> {
        let (at,): (Option<String>,) =
            sqlx::query_as("SELECT last_compacted_at FROM contexts WHERE id = ?")
                .bind(&self.context_id)
                .fetch_one(&self.pool)
                .await
                .context("fetching context")?;
        Ok(at)
    }

    /// Below the token limit this does nothing and returns false. Otherwise
    /// keeps every system message plus the most recent non-system messages,
    /// drops the rest and returns true. Returns false if there was nothing
    /// to drop.
    pub async fn compact_if_necessary(&self) -> Result<bool> {
        let total = self.get_token_count().await?;
        if total < self.policy.token_limit {
            return Ok(false);
        }

        let messages = self.messages().await?;
        let non_system: Vec<&ContextMessage> =
            messages.iter().filter(|m| m.role != "system").collect();
        let drop_count = non_system.len().saturating_sub(self.policy.keep_recent);
        if drop_count == 0 {
            debug!(context_id = %self.context_id, total, "over limit but nothing to compact");
            return Ok(false);
        }
        let dropped: Vec<&str> = non_system[..drop_count]
            .iter()
            .map(|m| m.id.as_str())
            .collect();

        let mut tx = self.pool.begin().await.context("starting transaction")?;
        for id in &dropped {
            sqlx::query("DELETE FROM context_messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("compacting context")?;
        }
        let (remaining,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(token_count), 0) FROM context_messages WHERE context_id = ?",
        )
        .bind(&self.context_id)
        .fetch_one(&mut *tx)
        .await
        .context("summing context tokens")?;
        sqlx::query("UPDATE contexts SET total_tokens = ?, last_compacted_at = ? WHERE id = ?")
            .bind(remaining)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(&self.context_id)
            .execute(&mut *tx)
            .await
            .context("stamping compaction")?;
        tx.commit().await.context("committing compaction")?;

        info!(
            context_id = %self.context_id,
            dropped = dropped.len(),
            before = total,
            after = remaining,
            "compacted context"
        );
        Ok(true)
    }

    /// Remove every message; the context keeps its id.
    pub async fn clear_context(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        sqlx::query("DELETE FROM context_messages WHERE context_id = ?")
            .bind(&self.context_id)
            .execute(&mut *tx)
            .await
            .context("clearing context")?;
        sqlx::query("UPDATE contexts SET total_tokens = 0 WHERE id = ?")
            .bind(&self.context_id)
            .execute(&mut *tx)
            .await
            .context("resetting context total")?;
        tx.commit().await.context("committing context clear")?;
        Ok(())
    }

    /// Replace the context with `messages`, e.g. after the conversation was
    /// rewound.
    pub async fn rebuild_from(&self, messages: &[StoredMessage]) -> Result<()> {
        self.clear_context().await?;
        for message in messages {
            self.add_message(message.role.as_str(), &message.content, None)
                .await?;
        }
        Ok(())
    }

    /// Delete the context row and its messages.
    pub async fn destroy(&self) -> Result<()> {
        self.clear_context().await?;
        sqlx::query("DELETE FROM contexts WHERE id = ?")
            .bind(&self.context_id)
            .execute(&self.pool)
            .await
            .context("deleting context")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn open(db: &Database, owner: &str, policy: CompactionPolicy) -> ContextManager {
        ContextManager::open(
            db.pool().clone(),
            owner,
            Arc::new(CharRatioEstimator::default()),
            policy,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_char_ratio_rounds_up() {
        let estimator = CharRatioEstimator::new(4);
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
    }

    #[test]
    fn test_char_ratio_counts_utf16_units() {
        let estimator = CharRatioEstimator::new(4);
        // Each emoji is a surrogate pair; accented Latin stays one unit.
        assert_eq!(estimator.estimate("😀😀"), 1);
        assert_eq!(estimator.estimate("😀😀😀"), 2);
        assert_eq!(estimator.estimate("éééé"), 1);
    }

    #[tokio::test]
    async fn test_add_message_counts_tokens() {
        let db = Database::in_memory().await.unwrap();
        let ctx = open(&db, "s1", CompactionPolicy::default()).await;

        let msg = ctx.add_message("user", &"x".repeat(10), None).await.unwrap();
        assert_eq!(msg.token_count, 3);
        assert_eq!(msg.context_id, ctx.context_id());
        ctx.add_message("assistant", "abcd", None).await.unwrap();

        assert_eq!(ctx.get_token_count().await.unwrap(), 4);
        assert!(!ctx.compact_if_necessary().await.unwrap());
    }

    #[tokio::test]
    async fn test_compaction_keeps_system_and_recent() {
        let db = Database::in_memory().await.unwrap();
        let ctx = open(
            &db,
            "s1",
            CompactionPolicy {
                token_limit: 20,
                keep_recent: 2,
            },
        )
        .await;

        ctx.add_message("system", "you are helpful", None).await.unwrap();
        for i in 0..6 {
            ctx.add_message("user", &format!("message number {i}"), None)
                .await
                .unwrap();
        }
        ctx.add_message("system", "late system note", None).await.unwrap();

        let before_messages = ctx.messages().await.unwrap();
        let before_tokens = ctx.get_token_count().await.unwrap();
        assert!(ctx.compact_if_necessary().await.unwrap());

        let after = ctx.messages().await.unwrap();
        assert!(after.len() < before_messages.len());
        assert!(ctx.get_token_count().await.unwrap() <= before_tokens);
        for system in before_messages.iter().filter(|m| m.role == "system") {
            assert!(after.iter().any(|m| m.id == system.id));
        }
        let kept: Vec<&str> = after
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(kept, vec!["message number 4", "message number 5"]);
        assert!(ctx.last_compacted_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_keeps_identity_and_contexts_are_isolated() {
        let db = Database::in_memory().await.unwrap();
        let a = open(&db, "room-a", CompactionPolicy::default()).await;
        let b = open(&db, "room-b", CompactionPolicy::default()).await;

        a.add_message("user", "hello from a", None).await.unwrap();
        b.add_message("user", "hello from b", None).await.unwrap();

        let id = a.context_id().to_string();
        a.clear_context().await.unwrap();
        assert_eq!(a.get_token_count().await.unwrap(), 0);
        assert!(a.messages().await.unwrap().is_empty());

        let reopened = open(&db, "room-a", CompactionPolicy::default()).await;
        assert_eq!(reopened.context_id(), id);
        assert_eq!(b.messages().await.unwrap().len(), 1);
    }
}

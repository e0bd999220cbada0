//! Session-pair persistence.

use anyhow::{Context, Result};
use sqlx::{FromRow, SqlitePool};
use tether_protocol::now_ms;
use tether_protocol::pair::{CreatePairRequest, PairStatus, SessionPair};
use uuid::Uuid;

const PAIR_COLUMNS: &str = "id, room_id, room_session_id, manager_session_id, worker_session_id, \
     status, current_task_id, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct PairRow {
    id: String,
    room_id: String,
    room_session_id: String,
    manager_session_id: String,
    worker_session_id: String,
    status: String,
    current_task_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl PairRow {
    fn into_pair(self) -> Result<SessionPair> {
        let status = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(SessionPair {
            id: self.id,
            room_id: self.room_id,
            room_session_id: self.room_session_id,
            manager_session_id: self.manager_session_id,
            worker_session_id: self.worker_session_id,
            status,
            current_task_id: self.current_task_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PairRepository {
    pool: SqlitePool,
}

impl PairRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// New pairs start `active`.
    pub async fn create(&self, request: &CreatePairRequest) -> Result<SessionPair> {
        let now = now_ms();
        let pair = SessionPair {
            id: Uuid::new_v4().to_string(),
            room_id: request.room_id.clone(),
            room_session_id: request.room_session_id.clone(),
            manager_session_id: request.manager_session_id.clone(),
            worker_session_id: request.worker_session_id.clone(),
            status: PairStatus::Active,
            current_task_id: request.current_task_id.clone(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(&format!(
            "INSERT INTO session_pairs ({PAIR_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&pair.id)
        .bind(&pair.room_id)
        .bind(&pair.room_session_id)
        .bind(&pair.manager_session_id)
        .bind(&pair.worker_session_id)
        .bind(pair.status.as_str())
        .bind(&pair.current_task_id)
        .bind(pair.created_at)
        .bind(pair.updated_at)
        .execute(&self.pool)
        .await
        .context("creating session pair")?;

        Ok(pair)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionPair>> {
        let row = sqlx::query_as::<_, PairRow>(&format!(
            "SELECT {PAIR_COLUMNS} FROM session_pairs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session pair")?;

        row.map(PairRow::into_pair).transpose()
    }

    /// The pair `session_id` belongs to. A pair where it is the manager wins
    /// over one where it is the worker.
    // TODO: confirm with product whether a session may hold both roles; the
    // manager-first order is kept for compatibility with existing clients.
    pub async fn get_by_session(&self, session_id: &str) -> Result<Option<SessionPair>> {
        for column in ["manager_session_id", "worker_session_id"] {
            let row = sqlx::query_as::<_, PairRow>(&format!(
                "SELECT {PAIR_COLUMNS} FROM session_pairs WHERE {column} = ? \
                 ORDER BY created_at DESC LIMIT 1"
            ))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session pair")?;

            if let Some(row) = row {
                return row.into_pair().map(Some);
            }
        }
        Ok(None)
    }

    pub async fn list_by_room(&self, room_id: &str) -> Result<Vec<SessionPair>> {
        let rows = sqlx::query_as::<_, PairRow>(&format!(
            "SELECT {PAIR_COLUMNS} FROM session_pairs WHERE room_id = ? ORDER BY created_at ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .context("listing session pairs")?;

        rows.into_iter().map(PairRow::into_pair).collect()
    }

    /// Any status may follow any other. `updated_at` strictly increases even
    /// when two updates land in the same millisecond.
    pub async fn update_status(
        &self,
        id: &str,
        status: PairStatus,
        current_task_id: Option<&str>,
    ) -> Result<Option<SessionPair>> {
        let result = sqlx::query(
            r#"
            UPDATE session_pairs
            SET status = ?,
                current_task_id = COALESCE(?, current_task_id),
                updated_at = MAX(?, updated_at + 1)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(current_task_id)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating session pair")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_pairs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session pair")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn request(room: &str, manager: &str, worker: &str) -> CreatePairRequest {
        CreatePairRequest {
            room_id: room.into(),
            room_session_id: format!("{room}-session"),
            manager_session_id: manager.into(),
            worker_session_id: worker.into(),
            current_task_id: None,
        }
    }

    #[tokio::test]
    async fn test_status_round_trip_increases_updated_at() {
        let db = Database::in_memory().await.unwrap();
        let repo = PairRepository::new(db.pool().clone());
        let created = repo.create(&request("room", "m", "w")).await.unwrap();
        assert_eq!(created.status, PairStatus::Active);

        let mut last = created.clone();
        for status in [
            PairStatus::Active,
            PairStatus::Idle,
            PairStatus::Active,
            PairStatus::Completed,
        ] {
            let updated = repo
                .update_status(&created.id, status, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.status, status);
            assert!(updated.updated_at > last.updated_at);
            assert_eq!(updated.manager_session_id, created.manager_session_id);
            assert_eq!(updated.worker_session_id, created.worker_session_id);
            assert_eq!(updated.room_id, created.room_id);
            assert_eq!(updated.created_at, created.created_at);
            assert_eq!(repo.get(&created.id).await.unwrap().unwrap(), updated);
            last = updated;
        }
    }

    #[tokio::test]
    async fn test_get_by_session_prefers_manager_role() {
        let db = Database::in_memory().await.unwrap();
        let repo = PairRepository::new(db.pool().clone());

        let worker_pair = repo.create(&request("r1", "other", "shared-id")).await.unwrap();
        let manager_pair = repo.create(&request("r2", "shared-id", "w")).await.unwrap();

        let found = repo.get_by_session("shared-id").await.unwrap().unwrap();
        assert_eq!(found.id, manager_pair.id);

        let found = repo.get_by_session("other").await.unwrap().unwrap();
        assert_eq!(found.id, worker_pair.id);
        assert!(repo.get_by_session("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_pair() {
        let db = Database::in_memory().await.unwrap();
        let repo = PairRepository::new(db.pool().clone());
        assert!(
            repo.update_status("missing", PairStatus::Crashed, None)
                .await
                .unwrap()
                .is_none()
        );
        assert!(repo.list_by_room("r").await.unwrap().is_empty());
    }
}

//! Rewind points, previews and rewinds of one session.
//!
//! Every user message is a rewind point. User messages stored while the
//! workspace was a git repository carry the tree of the workspace at that
//! moment, which is what file rewinds restore.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tether_protocol::session::{RewindMode, RewindPoint, RewindPreview, RewindResult};
use tracing::info;

use super::message_repository::MessageRepository;
use super::models::MessageRow;
use crate::worktree::snapshot::{self, FileChange};

pub const POINT_NOT_FOUND: &str = "Rewind point not found";

/// Files one rewind would touch, grouped by the tree they come back from.
#[derive(Debug, Default)]
struct FilePlan {
    /// source tree -> (end of the interval, changes)
    groups: BTreeMap<String, (String, Vec<FileChange>)>,
}

impl FilePlan {
    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .groups
            .values()
            .flat_map(|(_, changes)| changes.iter().map(|c| c.path.clone()))
            .collect();
        paths.sort();
        paths
    }
}

#[derive(Debug, Clone)]
pub struct RewindHandler {
    messages: MessageRepository,
}

impl RewindHandler {
    pub fn new(messages: MessageRepository) -> Self {
        Self { messages }
    }

    /// Chronological, numbered from 1.
    pub async fn get_rewind_points(&self, session_id: &str) -> Result<Vec<RewindPoint>> {
        let rows = self.messages.rows(session_id).await?;
        Ok(rows
            .iter()
            .filter(|row| is_turn(row))
            .enumerate()
            .map(|(i, row)| RewindPoint {
                uuid: row.id.clone(),
                timestamp: row.timestamp,
                content: row.content.clone(),
                turn_number: i as u32 + 1,
            })
            .collect())
    }

    pub async fn preview(
        &self,
        session_id: &str,
        workspace: &Path,
        checkpoint_id: &str,
    ) -> Result<RewindPreview> {
        let rows = self.messages.rows(session_id).await?;
        let Some(pos) = find_turn(&rows, checkpoint_id) else {
            return Ok(RewindPreview::unavailable(POINT_NOT_FOUND));
        };

        let plan = self.plan_since(workspace, &rows[pos]).await?;
        let (insertions, deletions) = plan_stats(workspace, &plan).await?;
        Ok(RewindPreview {
            can_rewind: true,
            messages_affected: Some((rows.len() - pos) as u64),
            files_changed: Some(plan.paths()),
            insertions: Some(insertions),
            deletions: Some(deletions),
            error: None,
        })
    }

    /// Reverting the conversation deletes the rewind point itself and
    /// everything after it.
    pub async fn execute(
        &self,
        session_id: &str,
        workspace: &Path,
        checkpoint_id: &str,
        mode: RewindMode,
    ) -> Result<RewindResult> {
        let rows = self.messages.rows(session_id).await?;
        let Some(pos) = find_turn(&rows, checkpoint_id) else {
            return Ok(RewindResult::failed(POINT_NOT_FOUND));
        };

        let mut result = RewindResult {
            success: true,
            ..Default::default()
        };
        if mode.reverts_files() {
            let plan = self.plan_since(workspace, &rows[pos]).await?;
            result.files_changed = Some(apply_plan(workspace, &plan).await?);
        }
        if mode.reverts_conversation() {
            let deleted = self
                .messages
                .delete_from_seq(session_id, rows[pos].seq)
                .await?;
            result.messages_deleted = Some(deleted);
        }

        info!(
            %session_id,
            %checkpoint_id,
            ?mode,
            files = result.files_changed.as_ref().map(Vec::len).unwrap_or(0),
            messages = result.messages_deleted.unwrap_or(0),
            "rewound session"
        );
        Ok(result)
    }

    /// Preview reverting exactly `message_ids`: those messages, and the file
    /// changes made during each listed turn.
    pub async fn preview_selective(
        &self,
        session_id: &str,
        workspace: &Path,
        message_ids: &[String],
    ) -> Result<RewindPreview> {
        let rows = self.messages.rows(session_id).await?;
        if let Some(missing) = first_missing(&rows, message_ids) {
            return Ok(RewindPreview::unavailable(format!("Message not found: {missing}")));
        }

        let plan = self.plan_turns(workspace, &rows, message_ids).await?;
        let (insertions, deletions) = plan_stats(workspace, &plan).await?;
        Ok(RewindPreview {
            can_rewind: true,
            messages_affected: Some(message_ids.len() as u64),
            files_changed: Some(plan.paths()),
            insertions: Some(insertions),
            deletions: Some(deletions),
            error: None,
        })
    }

    pub async fn execute_selective(
        &self,
        session_id: &str,
        workspace: &Path,
        message_ids: &[String],
        mode: RewindMode,
    ) -> Result<RewindResult> {
        let rows = self.messages.rows(session_id).await?;
        if let Some(missing) = first_missing(&rows, message_ids) {
            return Ok(RewindResult::failed(format!("Message not found: {missing}")));
        }

        let mut result = RewindResult {
            success: true,
            ..Default::default()
        };
        if mode.reverts_files() {
            let plan = self.plan_turns(workspace, &rows, message_ids).await?;
            result.files_changed = Some(apply_plan(workspace, &plan).await?);
        }
        if mode.reverts_conversation() {
            result.messages_deleted = Some(self.messages.delete_ids(message_ids).await?);
        }
        Ok(result)
    }

    /// Everything that changed since `point` was stored.
    async fn plan_since(&self, workspace: &Path, point: &MessageRow) -> Result<FilePlan> {
        let mut plan = FilePlan::default();
        let Some(ref tree) = point.checkpoint else {
            return Ok(plan);
        };
        let Some(current) = snapshot::snapshot_tree(workspace).await? else {
            return Ok(plan);
        };
        let changes = snapshot::changed_files(workspace, tree, &current).await?;
        if !changes.is_empty() {
            plan.groups.insert(tree.clone(), (current, changes));
        }
        Ok(plan)
    }

    /// Changes made during each selected turn, from its checkpoint to the
    /// next one. A file touched in several turns comes back from the earliest.
    async fn plan_turns(
        &self,
        workspace: &Path,
        rows: &[MessageRow],
        message_ids: &[String],
    ) -> Result<FilePlan> {
        let mut plan = FilePlan::default();
        let mut claimed: Vec<String> = Vec::new();
        let mut current: Option<String> = None;

        for (i, row) in rows.iter().enumerate() {
            if !is_turn(row) || !message_ids.contains(&row.id) {
                continue;
            }
            let Some(ref from) = row.checkpoint else {
                continue;
            };

            let next = rows[i + 1..]
                .iter()
                .filter(|r| is_turn(r))
                .find_map(|r| r.checkpoint.clone());
            let to = match next {
                Some(tree) => tree,
                None => {
                    if current.is_none() {
                        current = snapshot::snapshot_tree(workspace).await?;
                    }
                    match current.clone() {
                        Some(tree) => tree,
                        None => continue,
                    }
                }
            };

            let changes: Vec<FileChange> = snapshot::changed_files(workspace, from, &to)
                .await?
                .into_iter()
                .filter(|c| !claimed.contains(&c.path))
                .collect();
            if changes.is_empty() {
                continue;
            }
            claimed.extend(changes.iter().map(|c| c.path.clone()));
            plan.groups.insert(from.clone(), (to, changes));
        }
        Ok(plan)
    }
}

fn is_turn(row: &MessageRow) -> bool {
    row.role == "user"
}

fn find_turn(rows: &[MessageRow], id: &str) -> Option<usize> {
    rows.iter().position(|row| row.id == id && is_turn(row))
}

fn first_missing<'a>(rows: &[MessageRow], ids: &'a [String]) -> Option<&'a str> {
    ids.iter()
        .find(|id| !rows.iter().any(|row| &row.id == *id))
        .map(String::as_str)
}

async fn plan_stats(workspace: &Path, plan: &FilePlan) -> Result<(u64, u64)> {
    let mut insertions = 0;
    let mut deletions = 0;
    for (from, (to, changes)) in &plan.groups {
        let paths: Vec<String> = changes.iter().map(|c| c.path.clone()).collect();
        let stats = snapshot::diff_stats_for(workspace, from, to, &paths).await?;
        insertions += stats.insertions;
        deletions += stats.deletions;
    }
    Ok((insertions, deletions))
}

async fn apply_plan(workspace: &Path, plan: &FilePlan) -> Result<Vec<String>> {
    let mut restored = Vec::new();
    for (source, (_, changes)) in &plan.groups {
        restored.extend(snapshot::restore_files(workspace, source, changes).await?);
    }
    restored.sort();
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::session::message_repository::NewMessage;
    use crate::worktree::git::git_available;
    use std::process::Command;
    use tempfile::TempDir;
    use tether_protocol::session::MessageRole;

    async fn store(
        repo: &MessageRepository,
        role: MessageRole,
        content: &str,
        checkpoint: Option<&str>,
    ) -> String {
        repo.insert(NewMessage {
            session_id: "s",
            role,
            content,
            sdk_message: None,
            checkpoint,
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_points_and_conversation_rewind() {
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        let handler = RewindHandler::new(repo.clone());
        let dir = TempDir::new().unwrap();

        let first = store(&repo, MessageRole::User, "first", None).await;
        store(&repo, MessageRole::Assistant, "reply", None).await;
        let second = store(&repo, MessageRole::User, "second", None).await;
        store(&repo, MessageRole::Assistant, "reply 2", None).await;

        let points = handler.get_rewind_points("s").await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].uuid, second);
        assert_eq!(points[1].turn_number, 2);

        let preview = handler.preview("s", dir.path(), &second).await.unwrap();
        assert!(preview.can_rewind);
        assert_eq!(preview.messages_affected, Some(2));
        assert_eq!(preview.files_changed, Some(vec![]));

        let unknown = handler.preview("s", dir.path(), "nope").await.unwrap();
        assert!(!unknown.can_rewind);
        assert_eq!(unknown.error.as_deref(), Some(POINT_NOT_FOUND));

        let result = handler
            .execute("s", dir.path(), &second, RewindMode::Conversation)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.messages_deleted, Some(2));
        assert_eq!(repo.count("s").await.unwrap(), 2);

        let points = handler.get_rewind_points("s").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].uuid, first);
    }

    #[tokio::test]
    async fn test_selective_rewind_reverts_one_turn() {
        if !git_available().await {
            return;
        }
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "dev@example.com"],
            vec!["config", "user.name", "Dev"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .status()
                .unwrap();
        }
        let ws = dir.path();
        let db = Database::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        let handler = RewindHandler::new(repo.clone());

        std::fs::write(ws.join("a.txt"), "a0\n").unwrap();
        let cp1 = snapshot::snapshot_tree(ws).await.unwrap().unwrap();
        let turn1 = store(&repo, MessageRole::User, "edit a", Some(&cp1)).await;
        std::fs::write(ws.join("a.txt"), "a1\n").unwrap();

        let cp2 = snapshot::snapshot_tree(ws).await.unwrap().unwrap();
        let turn2 = store(&repo, MessageRole::User, "add b", Some(&cp2)).await;
        std::fs::write(ws.join("b.txt"), "b\n").unwrap();

        let preview = handler
            .preview_selective("s", ws, &[turn1.clone()])
            .await
            .unwrap();
        assert_eq!(preview.files_changed, Some(vec!["a.txt".to_string()]));

        let result = handler
            .execute_selective("s", ws, &[turn1], RewindMode::Files)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(ws.join("a.txt")).unwrap(), "a0\n");
        assert!(ws.join("b.txt").exists());

        let full = handler.preview("s", ws, &turn2).await.unwrap();
        assert!(full.files_changed.unwrap().contains(&"b.txt".to_string()));
    }
}

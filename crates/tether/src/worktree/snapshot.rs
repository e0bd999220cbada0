//! Filesystem checkpoints as git tree objects.
//!
//! A checkpoint is the tree of the workspace (tracked and untracked files,
//! honouring `.gitignore`) written through a throwaway index, so the user's
//! real index and history are never touched. Each checkpoint is pinned with a
//! ref under `refs/tether/checkpoints/` to keep it from being collected.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use super::git::{is_git_repo, run_git, run_git_with_env};

const CHECKPOINT_REF_PREFIX: &str = "refs/tether/checkpoints";

/// How one path differs between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    /// `A`dded, `D`eleted, `M`odified or `T`ype-changed going from the first
    /// tree to the second.
    pub status: char,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: Vec<String>,
    pub insertions: u64,
    pub deletions: u64,
}

/// Snapshot the workspace and pin it. `None` when it is not a git repository.
pub async fn create_checkpoint(
    workspace: &Path,
    session_id: &str,
    message_id: &str,
) -> Result<Option<String>> {
    let Some(tree) = snapshot_tree(workspace).await? else {
        return Ok(None);
    };
    let ref_name = format!("{CHECKPOINT_REF_PREFIX}/{session_id}/{message_id}");
    run_git(workspace, &["update-ref", &ref_name, &tree])
        .await
        .context("Failed to pin checkpoint")?;
    debug!(%session_id, %message_id, %tree, "recorded checkpoint");
    Ok(Some(tree))
}

/// Write the current workspace state as a tree without touching the index.
pub async fn snapshot_tree(workspace: &Path) -> Result<Option<String>> {
    if !is_git_repo(workspace).await {
        return Ok(None);
    }
    let git_dir = run_git(workspace, &["rev-parse", "--absolute-git-dir"])
        .await
        .context("Failed to locate git directory")?;
    let index_path = Path::new(&git_dir)
        .join(format!("tether-index-{}", Uuid::new_v4().simple()))
        .to_string_lossy()
        .to_string();

    let env = [("GIT_INDEX_FILE", index_path.as_str())];
    let result = async {
        run_git_with_env(workspace, &["add", "-A", "--", "."], &env).await?;
        run_git_with_env(workspace, &["write-tree"], &env).await
    }
    .await;
    let _ = tokio::fs::remove_file(&index_path).await;

    result.context("Failed to snapshot workspace").map(Some)
}

/// Drop every pinned checkpoint of a session.
pub async fn delete_checkpoints(workspace: &Path, session_id: &str) -> Result<()> {
    if !is_git_repo(workspace).await {
        return Ok(());
    }
    let prefix = format!("{CHECKPOINT_REF_PREFIX}/{session_id}/");
    let refs = run_git(workspace, &["for-each-ref", "--format=%(refname)", &prefix]).await?;
    for ref_name in refs.lines().filter(|l| !l.is_empty()) {
        run_git(workspace, &["update-ref", "-d", ref_name]).await?;
    }
    Ok(())
}

pub async fn changed_files(workspace: &Path, from: &str, to: &str) -> Result<Vec<FileChange>> {
    let output = run_git(
        workspace,
        &["diff", "--name-status", "--no-renames", "--relative", from, to],
    )
    .await
    .context("Failed to diff checkpoints")?;
    Ok(output
        .lines()
        .filter_map(|line| {
            let (status, path) = line.split_once('\t')?;
            Some(FileChange {
                path: path.to_string(),
                status: status.chars().next()?,
            })
        })
        .collect())
}

pub async fn diff_stats(workspace: &Path, from: &str, to: &str) -> Result<DiffStats> {
    let output = run_git(
        workspace,
        &["diff", "--numstat", "--no-renames", "--relative", from, to],
    )
    .await
    .context("Failed to diff checkpoints")?;
    Ok(parse_numstat(&output))
}

/// Like [`diff_stats`], restricted to `paths`.
pub async fn diff_stats_for(
    workspace: &Path,
    from: &str,
    to: &str,
    paths: &[String],
) -> Result<DiffStats> {
    if paths.is_empty() {
        return Ok(DiffStats::default());
    }
    let mut args = vec!["diff", "--numstat", "--no-renames", "--relative", from, to, "--"];
    args.extend(paths.iter().map(String::as_str));
    let output = run_git(workspace, &args)
        .await
        .context("Failed to diff checkpoints")?;
    Ok(parse_numstat(&output))
}

/// Bring `changes` (computed from `source` to the current state) back to
/// their state in `source`. Returns the affected paths.
pub async fn restore_files(
    workspace: &Path,
    source: &str,
    changes: &[FileChange],
) -> Result<Vec<String>> {
    let mut to_restore = Vec::new();
    let mut affected = Vec::new();
    for change in changes {
        if change.status == 'A' {
            let path = workspace.join(&change.path);
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", change.path))?;
            }
        } else {
            to_restore.push(change.path.as_str());
        }
        affected.push(change.path.clone());
    }

    if !to_restore.is_empty() {
        let source_arg = format!("--source={source}");
        let mut args = vec!["restore", source_arg.as_str(), "--worktree", "--"];
        args.extend(to_restore);
        run_git(workspace, &args)
            .await
            .context("Failed to restore files")?;
    }
    Ok(affected)
}

fn parse_numstat(output: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        // Binary files report `-`.
        stats.insertions += added.parse::<u64>().unwrap_or(0);
        stats.deletions += removed.parse::<u64>().unwrap_or(0);
        stats.files.push(path.to_string());
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::git::git_available;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "dev@example.com"],
            vec!["config", "user.name", "Dev"],
        ] {
            assert!(
                Command::new("git")
                    .args(&args)
                    .current_dir(dir)
                    .status()
                    .unwrap()
                    .success()
            );
        }
    }

    #[test]
    fn test_parse_numstat() {
        let stats = parse_numstat("3\t1\tsrc/a.rs\n-\t-\timg.png\n");
        assert_eq!(stats.files, vec!["src/a.rs", "img.png"]);
        assert_eq!(stats.insertions, 3);
        assert_eq!(stats.deletions, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        if !git_available().await {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("keep.txt"), "one\n").unwrap();

        let checkpoint = create_checkpoint(dir.path(), "s1", "m1")
            .await
            .unwrap()
            .unwrap();

        std::fs::write(dir.path().join("keep.txt"), "one\ntwo\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "fresh\n").unwrap();
        let current = snapshot_tree(dir.path()).await.unwrap().unwrap();

        let stats = diff_stats(dir.path(), &checkpoint, &current).await.unwrap();
        assert_eq!(stats.files.len(), 2);
        assert_eq!(stats.insertions, 2);

        let changes = changed_files(dir.path(), &checkpoint, &current).await.unwrap();
        let restored = restore_files(dir.path(), &checkpoint, &changes).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(),
            "one\n"
        );
        assert!(!dir.path().join("new.txt").exists());

        delete_checkpoints(dir.path(), "s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_non_repo_has_no_checkpoint() {
        if !git_available().await {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(create_checkpoint(dir.path(), "s1", "m1").await.unwrap().is_none());
    }
}

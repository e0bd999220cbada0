//! Per-session git worktrees.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tether_protocol::session::{CommitInfo, CommitsAhead, WorktreeMetadata};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::git::{git_branch_exists, git_ref_exists, is_git_repo, run_git};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: String,
    pub commit: String,
    pub branch: Option<String>,
    pub is_prunable: bool,
}

#[derive(Debug, Clone)]
pub struct CreateWorktreeOptions {
    pub session_id: String,
    pub repo_path: PathBuf,
    pub branch_name: Option<String>,
}

/// Creates, verifies and removes session worktrees under one root directory.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    worktree_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(worktree_dir: impl Into<PathBuf>) -> Self {
        Self {
            worktree_dir: worktree_dir.into(),
        }
    }

    pub fn worktree_dir(&self) -> &Path {
        &self.worktree_dir
    }

    /// `<worktree_dir>/<encoded repo path>/<session id>`
    pub fn worktree_path_for(&self, repo_path: &Path, session_id: &str) -> PathBuf {
        self.worktree_dir
            .join(encode_repo_path(repo_path))
            .join(session_id)
    }

    /// Walk up from `path` to the directory holding `.git`, confirmed by git.
    pub async fn find_git_root(&self, path: &Path) -> Option<PathBuf> {
        for dir in path.ancestors() {
            if !dir.join(".git").exists() {
                continue;
            }
            let toplevel = run_git(dir, &["rev-parse", "--show-toplevel"]).await.ok()?;
            let toplevel = PathBuf::from(toplevel);
            let same = match (toplevel.canonicalize(), dir.canonicalize()) {
                (Ok(a), Ok(b)) => a == b,
                _ => toplevel == dir,
            };
            return same.then(|| dir.to_path_buf());
        }
        None
    }

    /// Returns `None` when `repo_path` is not a git repository.
    pub async fn create_worktree(
        &self,
        options: CreateWorktreeOptions,
    ) -> Result<Option<WorktreeMetadata>> {
        let repo_path = options.repo_path.as_path();
        if !is_git_repo(repo_path).await {
            debug!(repo = %repo_path.display(), "not a git repository, skipping worktree");
            return Ok(None);
        }

        let target = self.worktree_path_for(repo_path, &options.session_id);
        if target.exists() {
            bail!("Worktree directory already exists: {}", target.display());
        }

        let fallback = format!("session/{}", options.session_id);
        let mut branch = options.branch_name.unwrap_or_else(|| fallback.clone());
        if git_branch_exists(repo_path, &branch).await? {
            debug!(%branch, "branch exists, falling back");
            branch = fallback;
            if git_branch_exists(repo_path, &branch).await? {
                branch = format!("{}-{}", branch, &Uuid::new_v4().simple().to_string()[..8]);
            }
        }

        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create worktree directory {}", target.display()))?;

        let target_str = target.to_string_lossy().to_string();
        if let Err(e) = run_git(
            repo_path,
            &["worktree", "add", "-b", &branch, &target_str, "HEAD"],
        )
        .await
        {
            if let Err(cleanup_err) = tokio::fs::remove_dir_all(&target).await {
                warn!(path = %target_str, error = %cleanup_err, "failed to remove partial worktree");
            }
            return Err(e.context("Failed to create worktree"));
        }

        info!(path = %target_str, %branch, "created worktree");
        Ok(Some(WorktreeMetadata {
            is_worktree: true,
            worktree_path: target_str,
            main_repo_path: repo_path.to_string_lossy().to_string(),
            branch,
        }))
    }

    /// Empty for non-repositories or when git fails.
    pub async fn list_worktrees(&self, repo_path: &Path) -> Vec<WorktreeInfo> {
        if !repo_path.is_dir() {
            return Vec::new();
        }
        match try_list_worktrees(repo_path).await {
            Ok(worktrees) => worktrees,
            Err(e) => {
                debug!(repo = %repo_path.display(), error = %e, "git worktree list failed");
                Vec::new()
            }
        }
    }

    /// False when the directory is gone or git no longer lists it. Never fails.
    pub async fn verify_worktree(&self, metadata: &WorktreeMetadata) -> bool {
        let path = Path::new(&metadata.worktree_path);
        if !path.is_dir() {
            return false;
        }
        let listed = self
            .list_worktrees(Path::new(&metadata.main_repo_path))
            .await;
        listed
            .iter()
            .any(|wt| same_path(Path::new(&wt.path), path))
    }

    /// Prune git's worktree list and remove worktrees whose directory is gone
    /// or that git reports as prunable. Returns the removed paths.
    pub async fn cleanup_orphaned_worktrees(&self, repo_path: &Path) -> Result<Vec<String>> {
        let before = try_list_worktrees(repo_path)
            .await
            .context("Failed to cleanup orphaned worktrees")?;

        run_git(repo_path, &["worktree", "prune"])
            .await
            .context("Failed to cleanup orphaned worktrees")?;

        let after = try_list_worktrees(repo_path)
            .await
            .context("Failed to cleanup orphaned worktrees")?;

        let mut removed = Vec::new();
        // The first entry is the main working tree.
        for wt in before.iter().skip(1) {
            let missing = !Path::new(&wt.path).exists();
            if !(missing || wt.is_prunable) {
                continue;
            }
            let still_listed = after.iter().any(|a| a.path == wt.path);
            if still_listed {
                if let Err(e) = run_git(repo_path, &["worktree", "remove", "--force", &wt.path]).await
                {
                    warn!(path = %wt.path, error = %e, "failed to remove orphaned worktree");
                    continue;
                }
            }
            if Path::new(&wt.path).exists()
                && let Err(e) = tokio::fs::remove_dir_all(&wt.path).await
            {
                warn!(path = %wt.path, error = %e, "failed to delete orphaned worktree directory");
            }
            removed.push(wt.path.clone());
        }

        if !removed.is_empty() {
            info!(repo = %repo_path.display(), count = removed.len(), "removed orphaned worktrees");
        }
        Ok(removed)
    }

    /// Remove a session worktree. A worktree git no longer knows about is not
    /// an error.
    pub async fn remove_worktree(&self, metadata: &WorktreeMetadata) -> Result<()> {
        let repo_path = Path::new(&metadata.main_repo_path);
        if let Err(e) = run_git(
            repo_path,
            &["worktree", "remove", "--force", &metadata.worktree_path],
        )
        .await
        {
            let msg = e.to_string();
            if !msg.contains("is not a working tree") && Path::new(&metadata.worktree_path).exists()
            {
                return Err(e.context("Failed to cleanup worktree"));
            }
        }
        if Path::new(&metadata.worktree_path).exists() {
            tokio::fs::remove_dir_all(&metadata.worktree_path)
                .await
                .context("Failed to cleanup worktree directory")?;
        }
        info!(path = %metadata.worktree_path, "removed worktree");
        Ok(())
    }

    /// Returns false, without renaming, when `new_name` already exists.
    pub async fn rename_branch(&self, repo_path: &Path, old_name: &str, new_name: &str) -> Result<bool> {
        if git_branch_exists(repo_path, new_name).await? {
            return Ok(false);
        }
        run_git(repo_path, &["branch", "-m", old_name, new_name])
            .await
            .context("Failed to rename branch")?;
        Ok(true)
    }

    /// Commits on the session branch that the default base branch lacks.
    pub async fn get_commits_ahead(&self, metadata: &WorktreeMetadata) -> Result<CommitsAhead> {
        let repo_path = Path::new(&metadata.main_repo_path);
        if !git_branch_exists(repo_path, &metadata.branch)
            .await
            .context("Failed to check commits")?
        {
            return Ok(CommitsAhead::default());
        }

        let base = detect_base_branch(repo_path).await;
        let range = format!("{}..{}", base, metadata.branch);
        let output = run_git(repo_path, &["log", "--format=%H|%an|%aI|%s", &range])
            .await
            .context("Failed to check commits")?;

        let commits = parse_commit_log(&output);
        Ok(CommitsAhead {
            has_commits_ahead: !commits.is_empty(),
            commits,
            base_branch: Some(base),
        })
    }
}

/// Replace path separators with `-`.
pub fn encode_repo_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '-' } else { c })
        .collect()
}

async fn try_list_worktrees(repo_path: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = run_git(repo_path, &["worktree", "list", "--porcelain"]).await?;
    Ok(parse_worktree_list(&output))
}

pub(crate) fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            worktrees.extend(current.take());
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "worktree" => {
                worktrees.extend(current.take());
                current = Some(WorktreeInfo {
                    path: value.to_string(),
                    commit: String::new(),
                    branch: None,
                    is_prunable: false,
                });
            }
            "HEAD" => {
                if let Some(wt) = current.as_mut() {
                    wt.commit = value.to_string();
                }
            }
            "branch" => {
                if let Some(wt) = current.as_mut() {
                    wt.branch = Some(value.trim_start_matches("refs/heads/").to_string());
                }
            }
            "prunable" => {
                if let Some(wt) = current.as_mut() {
                    wt.is_prunable = true;
                }
            }
            _ => {}
        }
    }
    worktrees.extend(current);
    worktrees
}

fn parse_commit_log(output: &str) -> Vec<CommitInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '|');
            Some(CommitInfo {
                hash: parts.next()?.to_string(),
                author: parts.next()?.to_string(),
                date: parts.next()?.to_string(),
                message: parts.next().unwrap_or("").to_string(),
            })
        })
        .collect()
}

/// origin/HEAD, then main, then master, then HEAD.
async fn detect_base_branch(repo_path: &Path) -> String {
    if let Ok(remote_head) = run_git(repo_path, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await
    {
        let name = remote_head.trim_start_matches("refs/remotes/").to_string();
        if !name.is_empty() {
            return name;
        }
    }
    for candidate in ["main", "master"] {
        if git_ref_exists(repo_path, &format!("refs/heads/{candidate}")).await {
            return candidate.to_string();
        }
    }
    "HEAD".to_string()
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

//! Thin async wrappers around the `git` binary.

use anyhow::{Context, Result, anyhow};
use std::path::Path;
use tokio::process::Command;

/// Run git in `repo_path` and return trimmed stdout. On failure the error
/// carries git's stderr (or stdout when stderr is empty).
pub async fn run_git(repo_path: &Path, args: &[&str]) -> Result<String> {
    run_git_with_env(repo_path, args, &[]).await
}

pub async fn run_git_with_env(
    repo_path: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
) -> Result<String> {
    let mut command = Command::new("git");
    command.args(args).current_dir(repo_path);
    for (key, value) in envs {
        command.env(key, value);
    }
    let output = command
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.first().unwrap_or(&"")))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    if detail.is_empty() {
        Err(anyhow!("git {} failed", args.join(" ")))
    } else {
        Err(anyhow!("{}", detail))
    }
}

/// Whether `refs/heads/<branch>` exists.
pub async fn git_branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let status = Command::new("git")
        .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
        .current_dir(repo_path)
        .status()
        .await
        .context("failed to run git show-ref")?;
    Ok(status.success())
}

/// Whether `rev` resolves in the repository.
pub async fn git_ref_exists(repo_path: &Path, rev: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", rev])
        .current_dir(repo_path)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Whether git considers `path` part of a work tree.
pub async fn is_git_repo(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    run_git(path, &["rev-parse", "--is-inside-work-tree"])
        .await
        .map(|out| out == "true")
        .unwrap_or(false)
}

/// Whether a `git` binary is on PATH.
pub async fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

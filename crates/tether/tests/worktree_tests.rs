//! Worktree-backed sessions. Skipped when `git` is not on PATH.

use serde_json::{Value, json};
use std::path::Path;
use std::process::Command;
use tether::agent::ScriptedEngine;
use tether::worktree::git::git_available;
use tether_protocol::channels::methods;
use tether_protocol::session::{CommitsAhead, Session};

mod common;
use common::{test_daemon_with, wait_until_idle};

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

async fn start_session(
    client: &tether::hub::MessageHub,
    t: &common::TestDaemon,
    prompt: &str,
) -> Session {
    let session = t.create_session(client).await;
    client
        .request(
            methods::MESSAGE_SEND,
            json!({ "sessionId": session.id, "content": prompt }),
        )
        .await
        .unwrap();
    wait_until_idle(client, &session.id, 3).await;
    client
        .request_as(methods::SESSION_GET, json!({ "sessionId": session.id }))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_message_creates_worktree() {
    if !git_available().await {
        return;
    }
    let t = test_daemon_with(ScriptedEngine::echo(), true).await;
    init_repo(t.workspace.path());
    let client = t.client("ui").await;

    let session = start_session(&client, &t, "Refactor the parser").await;
    let worktree = session.worktree.clone().expect("session worktree");
    assert!(worktree.is_worktree);
    assert!(
        worktree.branch.starts_with("session/refactor-the-parser-"),
        "{}",
        worktree.branch
    );
    let wt_path = Path::new(&worktree.worktree_path);
    assert!(wt_path.join("README.md").exists());

    // The agent ran inside the worktree, not the main checkout.
    assert_eq!(t.engine.requests()[0].workspace, wt_path);

    let ahead: CommitsAhead = client
        .request_as(
            methods::WORKTREE_COMMITS_AHEAD,
            json!({ "sessionId": session.id }),
        )
        .await
        .unwrap();
    assert!(!ahead.has_commits_ahead);

    std::fs::write(wt_path.join("parser.rs"), "// new\n").unwrap();
    git(wt_path, &["add", "."]);
    git(wt_path, &["commit", "-q", "-m", "add parser"]);

    let ahead: CommitsAhead = client
        .request_as(
            methods::WORKTREE_COMMITS_AHEAD,
            json!({ "sessionId": session.id }),
        )
        .await
        .unwrap();
    assert!(ahead.has_commits_ahead);
    assert_eq!(ahead.commits.len(), 1);
    assert_eq!(ahead.commits[0].message, "add parser");
    assert_eq!(ahead.base_branch.as_deref(), Some("main"));

    client
        .request(methods::SESSION_DELETE, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert!(!wt_path.exists());
}

#[tokio::test]
async fn test_file_rewind_restores_checkpoint() {
    if !git_available().await {
        return;
    }
    let t = test_daemon_with(ScriptedEngine::echo(), true).await;
    init_repo(t.workspace.path());
    let client = t.client("ui").await;

    let session = start_session(&client, &t, "Edit the readme").await;
    let worktree = session.worktree.clone().expect("session worktree");
    let readme = Path::new(&worktree.worktree_path).join("README.md");
    std::fs::write(&readme, "changed by the agent\n").unwrap();

    let checkpoints: Value = client
        .request(methods::REWIND_CHECKPOINTS, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    let checkpoint = checkpoints["checkpoints"][0]["uuid"]
        .as_str()
        .unwrap()
        .to_string();

    let preview: Value = client
        .request(
            methods::REWIND_PREVIEW,
            json!({ "sessionId": session.id, "checkpointId": checkpoint }),
        )
        .await
        .unwrap();
    assert_eq!(preview["preview"]["canRewind"], true);
    assert_eq!(preview["preview"]["filesChanged"], json!(["README.md"]));

    let executed: Value = client
        .request(
            methods::REWIND_EXECUTE,
            json!({ "sessionId": session.id, "checkpointId": checkpoint, "mode": "files" }),
        )
        .await
        .unwrap();
    assert_eq!(executed["result"]["success"], true, "{executed}");
    assert_eq!(std::fs::read_to_string(&readme).unwrap(), "hello\n");

    // Files-only rewind keeps the conversation.
    let count: Value = client
        .request(methods::MESSAGE_COUNT, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(count["count"], 3);
}

#[tokio::test]
async fn test_cleanup_orphans_removes_missing_worktrees() {
    if !git_available().await {
        return;
    }
    let t = test_daemon_with(ScriptedEngine::echo(), true).await;
    init_repo(t.workspace.path());
    let client = t.client("ui").await;

    let session = start_session(&client, &t, "Orphan me").await;
    let worktree = session.worktree.clone().expect("session worktree");
    std::fs::remove_dir_all(&worktree.worktree_path).unwrap();

    let result: Value = client
        .request(methods::WORKTREE_CLEANUP_ORPHANS, json!({}))
        .await
        .unwrap();
    let removed: Vec<String> = serde_json::from_value(result["removed"].clone()).unwrap();
    assert_eq!(removed.len(), 1);
    assert!(removed[0].ends_with(&session.id));
}

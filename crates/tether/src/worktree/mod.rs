//! Git worktree isolation and filesystem checkpoints.

pub mod git;
pub mod manager;
pub mod snapshot;

pub use manager::{CreateWorktreeOptions, WorktreeInfo, WorktreeManager, encode_repo_path};

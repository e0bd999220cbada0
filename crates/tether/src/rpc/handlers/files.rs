//! `file.*` handlers: read-only access to a session's workspace.
//!
//! Paths are relative to the session's effective workspace (its worktree
//! when it has one) and must resolve inside it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::rpc::{RpcContext, RpcError, RpcResult};

pub const MAX_READ_BYTES: u64 = 1024 * 1024;
const DEFAULT_TREE_DEPTH: usize = 3;
const MAX_TREE_DEPTH: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileParams {
    pub session_id: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

async fn workspace(ctx: &RpcContext, session_id: &str) -> RpcResult<PathBuf> {
    let session = ctx.session(session_id).await?;
    Ok(session.workspace().await)
}

/// Canonical `root` and `root/relative`, rejecting anything outside `root`.
fn resolve(root: &Path, relative: &str) -> RpcResult<(PathBuf, PathBuf)> {
    let root = root
        .canonicalize()
        .map_err(|e| RpcError::not_found(format!("Workspace not found: {e}")))?;
    let target = root
        .join(relative.trim_start_matches('/'))
        .canonicalize()
        .map_err(|_| RpcError::not_found(format!("Path not found: {relative}")))?;
    if !target.starts_with(&root) {
        return Err(RpcError::bad_request("Path must be inside the session workspace"));
    }
    Ok((root, target))
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_hidden_vcs(name: &str) -> bool {
    name == ".git"
}

pub async fn read(ctx: RpcContext, params: FileParams) -> RpcResult<FileContent> {
    let root = workspace(&ctx, &params.session_id).await?;
    let requested = params.path.unwrap_or_default();
    let (root, target) = resolve(&root, &requested)?;

    let metadata = tokio::fs::metadata(&target).await.map_err(anyhow::Error::from)?;
    if metadata.is_dir() {
        return Err(RpcError::bad_request(format!("{requested} is a directory")));
    }
    if metadata.len() > MAX_READ_BYTES {
        return Err(RpcError::bad_request(format!(
            "File is too large: cannot read files over {MAX_READ_BYTES} bytes"
        )));
    }
    let bytes = tokio::fs::read(&target).await.map_err(anyhow::Error::from)?;
    let content = String::from_utf8(bytes)
        .map_err(|_| RpcError::bad_request(format!("{requested} is binary and cannot be read as text")))?;

    Ok(FileContent {
        path: relative_path(&root, &target),
        size: metadata.len(),
        content,
    })
}

/// Direct children of a directory, directories first.
pub async fn list(ctx: RpcContext, params: FileParams) -> RpcResult<Vec<FileEntry>> {
    let root = workspace(&ctx, &params.session_id).await?;
    let (root, target) = resolve(&root, params.path.as_deref().unwrap_or("."))?;
    if !target.is_dir() {
        return Err(RpcError::bad_request("Path must be a directory"));
    }

    let entries = tokio::task::spawn_blocking(move || list_dir(&root, &target))
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;
    Ok(entries)
}

fn list_dir(root: &Path, dir: &Path) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !is_hidden_vcs(&e.file_name().to_string_lossy()))
        .map(|e| {
            let is_dir = e.file_type().is_dir();
            FileEntry {
                name: e.file_name().to_string_lossy().into_owned(),
                path: relative_path(root, e.path()),
                is_dir,
                size: if is_dir {
                    0
                } else {
                    e.metadata().map(|m| m.len()).unwrap_or(0)
                },
            }
        })
        .collect();
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    entries
}

/// Nested listing, `depth` levels deep (default 3).
pub async fn tree(ctx: RpcContext, params: FileParams) -> RpcResult<TreeNode> {
    let root = workspace(&ctx, &params.session_id).await?;
    let (root, target) = resolve(&root, params.path.as_deref().unwrap_or("."))?;
    let depth = params
        .depth
        .unwrap_or(DEFAULT_TREE_DEPTH)
        .clamp(1, MAX_TREE_DEPTH);

    tokio::task::spawn_blocking(move || build_tree(&root, &target, depth))
        .await
        .map_err(|e| RpcError::internal(e.to_string()))
}

fn build_tree(root: &Path, path: &Path, depth: usize) -> TreeNode {
    let is_dir = path.is_dir();
    let children = if is_dir && depth > 0 {
        list_dir(root, path)
            .into_iter()
            .map(|entry| build_tree(root, &root.join(&entry.path), depth - 1))
            .collect()
    } else {
        Vec::new()
    };
    TreeNode {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: relative_path(root, path),
        is_dir,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("ws");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "x").unwrap();

        let err = resolve(&inner, "../secret.txt").unwrap_err();
        assert!(matches!(err, RpcError::BadRequest(_)));
        assert!(matches!(resolve(&inner, "missing.txt"), Err(RpcError::NotFound(_))));
    }

    #[test]
    fn test_tree_respects_depth_and_skips_git() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src/nested/deep")).unwrap();
        std::fs::create_dir(root.join(".git")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "").unwrap();
        std::fs::write(root.join("README.md"), "hi").unwrap();

        let node = build_tree(&root, &root, 2);
        let names: Vec<_> = node.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["src", "README.md"]);

        let src = &node.children[0];
        assert_eq!(src.path, "src");
        let nested = src.children.iter().find(|c| c.name == "nested").unwrap();
        assert!(nested.children.is_empty());
        assert!(src.children.iter().any(|c| c.path == "src/lib.rs"));
    }
}

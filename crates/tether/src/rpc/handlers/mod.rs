//! RPC handlers, one module per method family.

pub mod files;
pub mod messages;
pub mod pairs;
pub mod questions;
pub mod rewind;
pub mod sessions;
pub mod settings;
pub mod state;
pub mod system;
pub mod worktrees;

use serde::Deserialize;

/// Params of methods that take none. Any payload is accepted.
#[derive(Debug, Default, Deserialize)]
pub struct NoParams {}

/// Params naming one session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub session_id: String,
}

//! Global and per-session settings.

use serde::{Deserialize, Serialize};

/// Daemon-wide user settings, persisted as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub show_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u32>,
    pub disabled_mcp_servers: Vec<String>,
    pub auto_scroll: bool,
    pub use_worktrees: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            show_archived: false,
            model: None,
            permission_mode: None,
            max_thinking_tokens: None,
            disabled_mcp_servers: Vec::new(),
            auto_scroll: true,
            use_worktrees: true,
        }
    }
}

/// `settings.updated` event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdated {
    /// `global` or the session id the change applies to.
    pub scope: String,
    pub settings: serde_json::Value,
}

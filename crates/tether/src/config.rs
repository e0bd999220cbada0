//! Daemon configuration.
//!
//! Loaded by the binary with the `config` crate (defaults, then
//! `config.toml`, then `TETHER__*` environment overrides) and passed down as
//! plain values. Library code never reads the environment itself.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub agent: AgentConfig,
    pub context: ContextConfig,
    pub hub: HubConfig,
    pub state: StateConfig,
    pub worktree: WorktreeConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3457,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Database location. Defaults to `$XDG_DATA_HOME/tether`.
    pub data_dir: Option<String>,
    /// Root for session worktrees. Defaults to `<data_dir>/worktrees`.
    pub worktree_dir: Option<String>,
}

/// The external agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `command` runs `command` below; `echo` answers every prompt with itself.
    pub engine: String,
    /// Executable speaking JSON lines on stdin/stdout.
    pub command: String,
    pub args: Vec<String>,
    pub default_model: String,
    /// Size of the model context window, in tokens.
    pub context_capacity: u64,
    pub auth_method: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            engine: "command".to_string(),
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--input-format".to_string(),
                "stream-json".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            default_model: "default".to_string(),
            context_capacity: 200_000,
            auth_method: "cli".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Compaction threshold in tokens.
    pub token_limit: u64,
    /// Non-system messages kept on compaction.
    pub keep_recent: usize,
    /// Divisor of the character-count token estimate.
    pub chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_limit: 150_000,
            keep_recent: 10,
            chars_per_token: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub request_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Clients older than this fetch a snapshot instead of replaying deltas.
    pub stale_threshold_secs: u64,
    /// Number of session-list deltas retained for catch-up.
    pub delta_log_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 300,
            delta_log_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

/// Resolved filesystem locations.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub data_dir: PathBuf,
    pub worktree_dir: PathBuf,
}

impl DaemonPaths {
    pub fn database(&self) -> PathBuf {
        self.data_dir.join("tether.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.context.token_limit, 150_000);
        assert_eq!(config.context.chars_per_token, 4);
        assert_eq!(config.state.stale_threshold_secs, 300);
        assert_eq!(config.shutdown.timeout_secs, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.worktree.enabled);
    }
}

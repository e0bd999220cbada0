//! State-channel payloads: snapshots, deltas and catch-up answers.

use serde::{Deserialize, Serialize};

use crate::session::{ContextInfo, PendingQuestion, ProcessingStatus, Session, StoredMessage};
use crate::settings::GlobalSettings;

/// Live vs persisted session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub active: u64,
    pub total: u64,
}

/// `system.health` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Seconds since daemon start.
    pub uptime: u64,
    pub sessions: SessionCounts,
}

/// `system.config` answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfigInfo {
    pub version: String,
    pub default_model: String,
    pub engine: String,
    pub auth_method: String,
    pub context_capacity: u64,
    pub worktrees_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsSnapshot {
    pub sessions: Vec<Session>,
    pub timestamp: i64,
}

/// Incremental change to the sessions list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsDelta {
    #[serde(default)]
    pub added: Vec<Session>,
    #[serde(default)]
    pub updated: Vec<Session>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub timestamp: i64,
}

/// Answer to `state.sessions.deltas {since}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaCatchUp {
    pub deltas: Vec<SessionsDelta>,
    /// `since` predates the retained log; the client must fetch a snapshot.
    pub resync: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub health: HealthStatus,
    pub config: DaemonConfigInfo,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub settings: GlobalSettings,
    pub timestamp: i64,
}

/// Per-session state published on `session:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: Session,
    pub processing_status: ProcessingStatus,
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<PendingQuestion>,
    pub timestamp: i64,
}

/// Messages appended to a session since the last event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesDelta {
    pub session_id: String,
    pub added: Vec<StoredMessage>,
    pub timestamp: i64,
}

/// `session.status` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub session_id: String,
    pub status: ProcessingStatus,
    pub generation: u64,
}

/// `session.error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorEvent {
    pub session_id: String,
    pub message: String,
    pub category: String,
    pub timestamp: i64,
}

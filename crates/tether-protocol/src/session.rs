//! Session, message, context and rewind payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            _ => Err(format!("invalid session status: {s}")),
        }
    }
}

/// Runtime processing status of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Idle,
    Queued,
    Thinking,
    Streaming,
    Finalizing,
    Error,
}

impl ProcessingStatus {
    /// Whether a query is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Queued
                | ProcessingStatus::Thinking
                | ProcessingStatus::Streaming
                | ProcessingStatus::Finalizing
        )
    }

    /// Allowed transitions: the forward pipeline, `error` from any active
    /// state, and back to `idle` from anywhere (interrupt or recovery).
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        if next == Idle || *self == next {
            return true;
        }
        match (self, next) {
            (Idle, Queued) | (Error, Queued) => true,
            (Queued, Thinking) => true,
            (Thinking, Streaming) | (Thinking, Finalizing) => true,
            (Streaming, Thinking) | (Streaming, Finalizing) => true,
            (from, Error) => from.is_active(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingStatus::Idle => "idle",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Thinking => "thinking",
            ProcessingStatus::Streaming => "streaming",
            ProcessingStatus::Finalizing => "finalizing",
            ProcessingStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tool/model configuration of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thinking_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disabled_mcp_servers: Vec<String>,
    /// Whether Stage-2 initialization may create a git worktree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_worktree: Option<bool>,
}

/// Counters and bookkeeping stored alongside a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetadata {
    pub message_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub tool_call_count: u64,
    pub title_generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unsubmitted answers to the pending question.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_draft: Option<Value>,
}

/// A git worktree bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeMetadata {
    pub is_worktree: bool,
    pub worktree_path: String,
    pub main_repo_path: String,
    pub branch: String,
}

/// Persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub workspace_path: String,
    pub status: SessionStatus,
    pub config: SessionConfig,
    pub metadata: SessionMetadata,
    pub workspace_initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeMetadata>,
    /// RFC3339
    pub created_at: String,
    /// RFC3339
    pub last_active_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

impl Session {
    /// Directory the agent works in: the worktree when one exists.
    pub fn effective_workspace(&self) -> &str {
        match &self.worktree {
            Some(wt) if wt.is_worktree => &wt.worktree_path,
            _ => &self.workspace_path,
        }
    }
}

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    /// Tool output fed back to the agent.
    Tool,
    Result,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
            MessageRole::Result => "result",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            "tool" => Ok(MessageRole::Tool),
            "result" => Ok(MessageRole::Result),
            _ => Err(format!("invalid message role: {s}")),
        }
    }
}

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    /// Plain-text rendering of the message.
    pub content: String,
    /// Raw SDK message, when the message came from the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_message: Option<Value>,
    /// Unix ms.
    pub timestamp: i64,
}

/// Token usage per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCategories {
    pub system_prompt: u64,
    pub system_tools: u64,
    pub messages: u64,
    pub autocompact_buffer: u64,
    pub free_space: u64,
}

/// Token-usage breakdown of a session's context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub model: String,
    pub total_capacity: u64,
    pub categories: ContextCategories,
    pub total_used: u64,
    pub percent_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compacted_at: Option<String>,
}

impl ContextInfo {
    /// Build from the non-free categories; free space and totals are derived.
    pub fn compute(
        model: impl Into<String>,
        total_capacity: u64,
        system_prompt: u64,
        system_tools: u64,
        messages: u64,
        autocompact_buffer: u64,
    ) -> Self {
        let total_used = system_prompt + system_tools + messages + autocompact_buffer;
        let percent_used = if total_capacity == 0 {
            0
        } else {
            ((total_used as f64 / total_capacity as f64) * 100.0).round() as u64
        };
        Self {
            model: model.into(),
            total_capacity,
            categories: ContextCategories {
                system_prompt,
                system_tools,
                messages,
                autocompact_buffer,
                free_space: total_capacity.saturating_sub(total_used),
            },
            total_used,
            percent_used,
            last_compacted_at: None,
        }
    }
}

/// A message the conversation can be rewound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPoint {
    pub uuid: String,
    pub timestamp: i64,
    pub content: String,
    pub turn_number: u32,
}

/// What a rewind reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewindMode {
    Files,
    Conversation,
    #[default]
    Both,
}

impl RewindMode {
    pub fn reverts_files(&self) -> bool {
        matches!(self, RewindMode::Files | RewindMode::Both)
    }

    pub fn reverts_conversation(&self) -> bool {
        matches!(self, RewindMode::Conversation | RewindMode::Both)
    }
}

/// Feasibility of a rewind, computed without mutating anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPreview {
    pub can_rewind: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insertions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RewindPreview {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            can_rewind: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Outcome of an executed rewind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_deleted: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RewindResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A question the agent is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub tool_use_id: String,
    pub questions: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<Value>,
    pub asked_at: i64,
}

/// A commit on a session branch that the base branch lacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub date: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitsAhead {
    pub has_commits_ahead: bool,
    pub commits: Vec<CommitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

//! The seam between sessions and whatever runs the agent.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tether_protocol::session::{MessageRole, SessionConfig};
use tokio::sync::mpsc;

/// One user turn handed to the engine.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session_id: String,
    pub prompt: String,
    /// Directory the agent works in.
    pub workspace: PathBuf,
    pub model: String,
    /// Engine-side conversation to continue.
    pub resume: Option<String>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What an engine reports while a query runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Started {
        sdk_session_id: String,
    },
    TextDelta {
        text: String,
    },
    Message {
        role: MessageRole,
        content: String,
        raw: Value,
        tool_calls: u32,
    },
    Question {
        tool_use_id: String,
        questions: Value,
    },
    Result {
        text: String,
        usage: Usage,
        cost: f64,
        raw: Value,
    },
    Error {
        message: String,
    },
}

/// Sent to a running query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryControl {
    AnswerQuestion { tool_use_id: String, responses: Value },
    CancelQuestion { tool_use_id: String },
    Interrupt,
}

/// Handle to a running query. The event stream ends when the query does.
pub struct AgentQuery {
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
    pub control: mpsc::UnboundedSender<QueryControl>,
}

#[async_trait]
pub trait AgentEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn start_query(&self, request: QueryRequest) -> Result<AgentQuery>;
}

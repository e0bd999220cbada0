//! In-process engine that replays scripted events.
//!
//! Used as the `echo` engine (answers every prompt with the prompt itself)
//! and by tests that need a deterministic agent.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_protocol::session::MessageRole;
use tokio::sync::mpsc;

use super::engine::{AgentEngine, AgentEvent, AgentQuery, QueryControl, QueryRequest, Usage};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(AgentEvent),
    Sleep(Duration),
    /// Block until a control message arrives. An interrupt ends the script.
    WaitForControl,
}

type Script = dyn Fn(&QueryRequest) -> Vec<ScriptStep> + Send + Sync;

pub struct ScriptedEngine {
    script: Box<Script>,
    requests: Mutex<Vec<QueryRequest>>,
    controls: Arc<Mutex<Vec<QueryControl>>>,
}

impl ScriptedEngine {
    pub fn new(script: impl Fn(&QueryRequest) -> Vec<ScriptStep> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
            controls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replies to every prompt with the prompt text.
    pub fn echo() -> Self {
        Self::new(|request| reply(request, &request.prompt))
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Control messages received so far, across all queries.
    pub fn controls(&self) -> Vec<QueryControl> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A complete successful turn answering `text`.
pub fn reply(request: &QueryRequest, text: &str) -> Vec<ScriptStep> {
    let sdk_session_id = request
        .resume
        .clone()
        .unwrap_or_else(|| format!("scripted-{}", request.session_id));
    vec![
        ScriptStep::Emit(AgentEvent::Started { sdk_session_id }),
        ScriptStep::Emit(AgentEvent::TextDelta {
            text: text.to_string(),
        }),
        ScriptStep::Emit(AgentEvent::Message {
            role: MessageRole::Assistant,
            content: text.to_string(),
            raw: json!({
                "type": "assistant",
                "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
            }),
            tool_calls: 0,
        }),
        ScriptStep::Emit(AgentEvent::Result {
            text: text.to_string(),
            usage: Usage {
                input_tokens: request.prompt.len() as u64,
                output_tokens: text.len() as u64,
            },
            cost: 0.0,
            raw: json!({"type": "result", "subtype": "success", "is_error": false, "result": text}),
        }),
    ]
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start_query(&self, request: QueryRequest) -> Result<AgentQuery> {
        let steps = (self.script)(&request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let (event_tx, events) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let controls = Arc::clone(&self.controls);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::WaitForControl => {
                        let Some(message) = control_rx.recv().await else {
                            return;
                        };
                        let interrupt = message == QueryControl::Interrupt;
                        controls
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(message);
                        if interrupt {
                            return;
                        }
                    }
                }
            }
        });

        Ok(AgentQuery { events, control })
    }
}

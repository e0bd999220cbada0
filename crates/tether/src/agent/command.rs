//! Agent engine backed by a subprocess speaking stream-json lines.
//!
//! One process is spawned per query. The prompt is written to stdin as a
//! `user` message; `system`, `assistant`, `user`, `stream_event` and `result`
//! lines on stdout are mapped to [`AgentEvent`]s. Once the `result` line
//! arrives stdin is closed so the process exits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::process::Stdio;
use tether_protocol::session::MessageRole;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::engine::{AgentEngine, AgentEvent, AgentQuery, QueryControl, QueryRequest, Usage};

/// Tool the agent uses to ask the user multiple-choice questions.
const ASK_QUESTION_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn build_command(&self, request: &QueryRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg("--model").arg(&request.model);

        if let Some(ref resume) = request.resume {
            cmd.arg("--resume").arg(resume);
        }
        if let Some(ref mode) = request.config.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if let Some(ref prompt) = request.config.system_prompt {
            cmd.arg("--append-system-prompt").arg(prompt);
        }
        if !request.config.allowed_tools.is_empty() {
            cmd.arg("--allowedTools")
                .arg(request.config.allowed_tools.join(","));
        }

        cmd.current_dir(&request.workspace);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    async fn start_query(&self, request: QueryRequest) -> Result<AgentQuery> {
        info!(
            "Spawning agent for session {} in {:?} (resume: {})",
            request.session_id,
            request.workspace,
            request.resume.is_some()
        );

        let mut child = self.build_command(&request).spawn().with_context(|| {
            format!(
                "Failed to spawn agent process. Executable: {}, Working dir: {:?}",
                self.command, request.workspace
            )
        })?;

        let stdin = child.stdin.take().context("agent process has no stdin")?;
        let stdout = child.stdout.take().context("agent process has no stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stderr_reader_task(stderr));
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        line_tx
            .send(user_line(&request.prompt))
            .context("agent stdin closed before the prompt was sent")?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let finished = CancellationToken::new();
        let interrupted = CancellationToken::new();

        tokio::spawn(stdin_writer_task(stdin, line_rx));
        tokio::spawn(control_task(
            control_rx,
            line_tx,
            finished.clone(),
            interrupted.clone(),
        ));
        tokio::spawn(stdout_reader_task(
            stdout,
            child,
            event_tx,
            finished,
            interrupted,
        ));

        Ok(AgentQuery { events, control })
    }
}

async fn stdin_writer_task(mut stdin: ChildStdin, mut line_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = line_rx.recv().await {
        let display: String = line.chars().take(200).collect();
        debug!("Sending to agent: {}", display);
        if let Err(e) = stdin.write_all(format!("{line}\n").as_bytes()).await {
            error!("Failed to write to agent stdin: {:?}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("Failed to flush agent stdin: {:?}", e);
            break;
        }
    }
    debug!("Agent stdin writer task ended");
}

/// Turns control messages into stdin lines until the query finishes. Dropping
/// `line_tx` on exit closes the process's stdin.
async fn control_task(
    mut control_rx: mpsc::UnboundedReceiver<QueryControl>,
    line_tx: mpsc::UnboundedSender<String>,
    finished: CancellationToken,
    interrupted: CancellationToken,
) {
    loop {
        let control = tokio::select! {
            _ = finished.cancelled() => break,
            control = control_rx.recv() => control,
        };
        let line = match control {
            Some(QueryControl::AnswerQuestion {
                tool_use_id,
                responses,
            }) => tool_result_line(&tool_use_id, &responses.to_string(), false),
            Some(QueryControl::CancelQuestion { tool_use_id }) => {
                tool_result_line(&tool_use_id, "The user declined to answer.", true)
            }
            Some(QueryControl::Interrupt) => {
                interrupted.cancel();
                break;
            }
            // Nobody can steer the query any more; let it run to its result.
            None => {
                finished.cancelled().await;
                break;
            }
        };
        if line_tx.send(line).is_err() {
            break;
        }
    }
}

async fn stdout_reader_task(
    stdout: ChildStdout,
    mut child: Child,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    finished: CancellationToken,
    interrupted: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_result = false;

    loop {
        let line = tokio::select! {
            _ = interrupted.cancelled() => {
                info!("Interrupting agent process");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill agent process: {:?}", e);
                }
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read agent stdout: {:?}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                let display: String = line.chars().take(200).collect();
                warn!("Failed to parse agent line: {:?}, line: {}", e, display);
                continue;
            }
        };

        for event in parse_line(&value) {
            let terminal = matches!(event, AgentEvent::Result { .. } | AgentEvent::Error { .. });
            if event_tx.send(event).is_err() {
                debug!("Agent event receiver dropped");
            }
            if terminal {
                saw_result = true;
                finished.cancel();
            }
        }
    }

    finished.cancel();
    match child.wait().await {
        Ok(status) if !status.success() && !saw_result && !interrupted.is_cancelled() => {
            let _ = event_tx.send(AgentEvent::Error {
                message: format!("Agent process exited with {status}"),
            });
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to wait for agent process: {:?}", e),
    }
    debug!("Agent stdout reader task ended");
}

async fn stderr_reader_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("Agent stderr: {}", line);
        }
    }
}

fn user_line(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": {"role": "user", "content": prompt},
    })
    .to_string()
}

fn tool_result_line(tool_use_id: &str, content: &str, is_error: bool) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }],
        },
    })
    .to_string()
}

/// Map one stream-json line to engine events. Unknown lines map to nothing.
pub fn parse_line(value: &Value) -> Vec<AgentEvent> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "system" => {
            let is_init = value.get("subtype").and_then(Value::as_str) == Some("init");
            match value.get("session_id").and_then(Value::as_str) {
                Some(id) if is_init => vec![AgentEvent::Started {
                    sdk_session_id: id.to_string(),
                }],
                _ => Vec::new(),
            }
        }
        "stream_event" => value
            .pointer("/event/delta/text")
            .and_then(Value::as_str)
            .map(|text| {
                vec![AgentEvent::TextDelta {
                    text: text.to_string(),
                }]
            })
            .unwrap_or_default(),
        "assistant" => {
            let blocks = content_blocks(value);
            let tool_uses: Vec<&Value> = blocks
                .iter()
                .copied()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
                .collect();

            let mut events = vec![AgentEvent::Message {
                role: MessageRole::Assistant,
                content: block_text(&blocks),
                raw: value.clone(),
                tool_calls: tool_uses.len() as u32,
            }];
            for tool in tool_uses {
                if tool.get("name").and_then(Value::as_str) != Some(ASK_QUESTION_TOOL) {
                    continue;
                }
                let Some(id) = tool.get("id").and_then(Value::as_str) else {
                    continue;
                };
                events.push(AgentEvent::Question {
                    tool_use_id: id.to_string(),
                    questions: tool
                        .pointer("/input/questions")
                        .cloned()
                        .unwrap_or(Value::Array(Vec::new())),
                });
            }
            events
        }
        "user" => {
            let blocks = content_blocks(value);
            let content = blocks
                .iter()
                .filter_map(|b| match b.get("content") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                    None => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            vec![AgentEvent::Message {
                role: MessageRole::Tool,
                content,
                raw: value.clone(),
                tool_calls: 0,
            }]
        }
        "result" => {
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if value.get("is_error").and_then(Value::as_bool) == Some(true) {
                let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("error");
                let message = if text.is_empty() {
                    format!("Agent query failed: {subtype}")
                } else {
                    text
                };
                return vec![AgentEvent::Error { message }];
            }
            let usage = Usage {
                input_tokens: value
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: value
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            };
            vec![AgentEvent::Result {
                text,
                usage,
                cost: value
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                raw: value.clone(),
            }]
        }
        _ => Vec::new(),
    }
}

fn content_blocks(value: &Value) -> Vec<&Value> {
    match value.pointer("/message/content") {
        Some(Value::Array(blocks)) => blocks.iter().collect(),
        Some(text @ Value::String(_)) => vec![text],
        _ => Vec::new(),
    }
}

fn block_text(blocks: &[&Value]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            Value::String(s) => Some(s.as_str()),
            _ if b.get("type").and_then(Value::as_str) == Some("text") => {
                b.get("text").and_then(Value::as_str)
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_and_delta() {
        let init = json!({"type": "system", "subtype": "init", "session_id": "sdk-1"});
        assert_eq!(
            parse_line(&init),
            vec![AgentEvent::Started {
                sdk_session_id: "sdk-1".into()
            }]
        );

        let delta = json!({
            "type": "stream_event",
            "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}
        });
        assert_eq!(
            parse_line(&delta),
            vec![AgentEvent::TextDelta { text: "Hel".into() }]
        );
    }

    #[test]
    fn test_parse_assistant_with_question() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Which one?"},
                {"type": "tool_use", "id": "toolu_1", "name": "AskUserQuestion",
                 "input": {"questions": [{"question": "A or B?"}]}},
                {"type": "tool_use", "id": "toolu_2", "name": "Read", "input": {}}
            ]}
        });
        let events = parse_line(&line);
        assert_eq!(events.len(), 2);
        match &events[0] {
            AgentEvent::Message {
                role,
                content,
                tool_calls,
                ..
            } => {
                assert_eq!(*role, MessageRole::Assistant);
                assert_eq!(content, "Which one?");
                assert_eq!(*tool_calls, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            events[1],
            AgentEvent::Question {
                tool_use_id: "toolu_1".into(),
                questions: json!([{"question": "A or B?"}]),
            }
        );
    }

    #[test]
    fn test_parse_result_and_error() {
        let ok = json!({
            "type": "result", "subtype": "success", "is_error": false,
            "result": "done", "total_cost_usd": 0.25,
            "usage": {"input_tokens": 100, "output_tokens": 20}
        });
        match &parse_line(&ok)[0] {
            AgentEvent::Result {
                text, usage, cost, ..
            } => {
                assert_eq!(text, "done");
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.output_tokens, 20);
                assert!((cost - 0.25).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let failed = json!({"type": "result", "subtype": "error_max_turns", "is_error": true});
        assert_eq!(
            parse_line(&failed),
            vec![AgentEvent::Error {
                message: "Agent query failed: error_max_turns".into()
            }]
        );
    }

    #[test]
    fn test_unknown_lines_are_ignored() {
        assert!(parse_line(&json!({"type": "keep_alive"})).is_empty());
        assert!(parse_line(&json!({"type": "system", "subtype": "compact_boundary"})).is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable_is_an_error() {
        let engine = CommandEngine::new("tether-definitely-missing-agent", Vec::new());
        let request = QueryRequest {
            session_id: "s1".into(),
            prompt: "hi".into(),
            workspace: std::env::temp_dir(),
            model: "default".into(),
            resume: None,
            config: Default::default(),
        };
        let err = engine.start_query(request).await.err().unwrap();
        assert!(err.to_string().contains("Failed to spawn agent process"));
    }
}

//! Driving the agent engine for one session.
//!
//! `send_message` persists the user turn, starts a query under a new
//! generation and spawns a task that applies the engine's events. Events
//! that arrive after a newer query started are dropped.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tether_protocol::session::{
    MessageRole, ProcessingStatus, Session, StoredMessage, WorktreeMetadata,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::agent_session::{ActiveQuery, AgentSession};
use super::message_repository::NewMessage;
use super::title::{DEFAULT_TITLE, branch_name, generate_title};
use crate::agent::{AgentEvent, AgentQuery, QueryRequest, Usage};
use crate::events::DaemonEvent;
use crate::worktree::CreateWorktreeOptions;
use crate::worktree::snapshot;

/// Answer to `message.send`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message: StoredMessage,
    pub generation: u64,
}

impl AgentSession {
    pub async fn send_message(self: &Arc<Self>, content: &str) -> Result<SentMessage> {
        self.ensure_open()?;
        let content = content.trim();
        if content.is_empty() {
            bail!("message content must not be empty");
        }

        self.ensure_workspace_initialized(content).await?;
        let workspace = self.workspace().await;
        let message = self.persist_user_message(&workspace, content).await?;

        let generation = self.begin_generation();
        let session = self.session().await;
        let request = QueryRequest {
            session_id: self.id.clone(),
            prompt: content.to_string(),
            workspace,
            model: session
                .config
                .model
                .clone()
                .unwrap_or_else(|| self.services.options.default_model.clone()),
            resume: session.metadata.sdk_session_id.clone(),
            config: session.config,
        };

        let AgentQuery { events, control } = match self.services.engine.start_query(request).await {
            Ok(query) => query,
            Err(e) => {
                let e = e.context("Failed to start agent query");
                self.record_error(generation, &format!("{e:#}")).await;
                return Err(e);
            }
        };

        // A superseded query keeps running; its events no longer match.
        *self.lock_active() = Some(ActiveQuery {
            generation,
            control,
            task: None,
        });
        let task = tokio::spawn(Arc::clone(self).pump(generation, events));
        if let Some(active) = self.lock_active().as_mut()
            && active.generation == generation
        {
            active.task = Some(task);
        }

        info!(session_id = %self.id, generation, "started query");
        Ok(SentMessage {
            message,
            generation,
        })
    }

    /// Stage 2: title, branch and worktree, run once on the first message.
    pub(super) async fn ensure_workspace_initialized(&self, first_message: &str) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        let session = self.session().await;
        if session.workspace_initialized {
            return Ok(());
        }

        let title = if session.metadata.title_generated || session.title != DEFAULT_TITLE {
            session.title.clone()
        } else {
            generate_title(first_message)
        };
        let worktree = if self.worktrees_allowed(&session).await {
            self.create_session_worktree(&session, &title).await
        } else {
            None
        };

        let updated = self
            .update_session(|s| {
                s.title = title;
                s.metadata.title_generated = true;
                s.worktree = worktree;
                s.workspace_initialized = true;
            })
            .await
            .context("Failed to initialize session workspace")?;

        info!(
            session_id = %self.id,
            title = %updated.title,
            worktree = updated.worktree.as_ref().map(|w| w.branch.as_str()).unwrap_or("none"),
            "initialized session workspace"
        );
        Ok(())
    }

    async fn worktrees_allowed(&self, session: &Session) -> bool {
        if !self.services.options.worktrees_enabled || session.config.use_worktree == Some(false) {
            return false;
        }
        match self.services.settings.get_global().await {
            Ok(settings) => settings.use_worktrees,
            Err(e) => {
                warn!(error = %e, "failed to read settings, assuming worktrees enabled");
                true
            }
        }
    }

    /// A failed worktree leaves the session working in place.
    async fn create_session_worktree(
        &self,
        session: &Session,
        title: &str,
    ) -> Option<WorktreeMetadata> {
        let worktrees = &self.services.worktrees;
        let repo_path = worktrees
            .find_git_root(Path::new(&session.workspace_path))
            .await?;
        let options = CreateWorktreeOptions {
            session_id: session.id.clone(),
            repo_path,
            branch_name: Some(branch_name(title, &session.id)),
        };
        match worktrees.create_worktree(options).await {
            Ok(worktree) => worktree,
            Err(e) => {
                warn!(session_id = %session.id, error = %format!("{e:#}"), "worktree creation failed");
                None
            }
        }
    }

    async fn persist_user_message(&self, workspace: &Path, content: &str) -> Result<StoredMessage> {
        let raw = json!({
            "type": "user",
            "message": {"role": "user", "content": content},
        });
        let row = self
            .services
            .messages
            .insert(NewMessage {
                session_id: &self.id,
                role: MessageRole::User,
                content,
                sdk_message: Some(&raw),
                checkpoint: None,
            })
            .await?;

        match snapshot::create_checkpoint(workspace, &self.id, &row.id).await {
            Ok(Some(tree)) => self.services.messages.set_checkpoint(&row.id, &tree).await?,
            Ok(None) => {}
            Err(e) => warn!(session_id = %self.id, error = %format!("{e:#}"), "checkpoint failed"),
        }

        self.context
            .add_message(MessageRole::User.as_str(), content, None)
            .await?;
        let message = row.to_stored()?;
        self.update_session(|s| {
            s.metadata.message_count += 1;
            s.last_active_at = chrono::Utc::now().to_rfc3339();
        })
        .await?;

        self.services.publish(DaemonEvent::MessagePersisted {
            session_id: self.id.clone(),
            message: message.clone(),
        });
        Ok(message)
    }

    async fn pump(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                debug!(session_id = %self.id, generation, "discarding stale agent event");
                continue;
            }
            if let Err(e) = self.apply_event(generation, event).await {
                self.record_error(generation, &format!("{e:#}")).await;
            }
        }

        // The stream ended without a result.
        if self.is_current(generation) && self.processing_status().is_active() {
            self.force_status(generation, ProcessingStatus::Idle);
        }
        self.clear_active(generation);
        debug!(session_id = %self.id, generation, "query stream ended");
    }

    /// Apply one engine event of query `generation`.
    pub async fn apply_event(&self, generation: u64, event: AgentEvent) -> Result<()> {
        if !self.is_current(generation) {
            return Ok(());
        }
        match event {
            AgentEvent::Started { sdk_session_id } => {
                self.update_session(|s| s.metadata.sdk_session_id = Some(sdk_session_id))
                    .await?;
                self.transition(generation, ProcessingStatus::Thinking);
            }
            AgentEvent::TextDelta { text } => {
                self.advance(generation, ProcessingStatus::Streaming);
                self.services.publish(DaemonEvent::StreamDelta {
                    session_id: self.id.clone(),
                    generation,
                    text,
                });
            }
            AgentEvent::Message {
                role,
                content,
                raw,
                tool_calls,
            } => {
                let Some(message) = self
                    .persist_agent_message(generation, role, &content, &raw)
                    .await?
                else {
                    return Ok(());
                };
                if !self.is_current(generation) {
                    return Ok(());
                }
                self.update_session(|s| {
                    s.metadata.message_count += 1;
                    s.metadata.tool_call_count += u64::from(tool_calls);
                })
                .await?;
                if !self.is_current(generation) {
                    return Ok(());
                }
                self.services.publish(DaemonEvent::MessagePersisted {
                    session_id: self.id.clone(),
                    message,
                });
                self.transition(generation, ProcessingStatus::Thinking);
            }
            AgentEvent::Question {
                tool_use_id,
                questions,
            } => {
                let question = self.questions.ask(generation, &tool_use_id, questions, None);
                self.services.publish(DaemonEvent::QuestionAsked {
                    session_id: self.id.clone(),
                    question,
                });
            }
            AgentEvent::Result {
                text,
                usage,
                cost,
                raw,
            } => {
                self.advance(generation, ProcessingStatus::Finalizing);
                self.finish_query(generation, &text, usage, cost, &raw)
                    .await?;
            }
            AgentEvent::Error { message } => {
                self.record_error(generation, &message).await;
            }
        }
        Ok(())
    }

    /// `None` when a newer query started while the row was being written.
    async fn persist_agent_message(
        &self,
        generation: u64,
        role: MessageRole,
        content: &str,
        raw: &serde_json::Value,
    ) -> Result<Option<StoredMessage>> {
        let row = self
            .services
            .messages
            .insert(NewMessage {
                session_id: &self.id,
                role,
                content,
                sdk_message: Some(raw),
                checkpoint: None,
            })
            .await?;
        if !self.is_current(generation) {
            self.discard_stale_row(generation, &row.id).await;
            return Ok(None);
        }
        self.context
            .add_message(role.as_str(), content, None)
            .await?;
        row.to_stored().map(Some)
    }

    /// Undo a row written by a query that was superseded mid-write.
    async fn discard_stale_row(&self, generation: u64, row_id: &str) {
        debug!(session_id = %self.id, generation, row_id, "discarding stale agent message");
        if let Err(e) = self.services.messages.delete_ids(&[row_id.to_string()]).await {
            warn!(session_id = %self.id, error = %e, "failed to discard stale message");
        }
    }

    async fn finish_query(
        &self,
        generation: u64,
        text: &str,
        usage: Usage,
        cost: f64,
        raw: &serde_json::Value,
    ) -> Result<()> {
        let row = self
            .services
            .messages
            .insert(NewMessage {
                session_id: &self.id,
                role: MessageRole::Result,
                content: text,
                sdk_message: Some(raw),
                checkpoint: None,
            })
            .await?;
        if !self.is_current(generation) {
            self.discard_stale_row(generation, &row.id).await;
            return Ok(());
        }
        self.services.publish(DaemonEvent::MessagePersisted {
            session_id: self.id.clone(),
            message: row.to_stored()?,
        });

        self.update_session(|s| {
            s.metadata.input_tokens += usage.input_tokens;
            s.metadata.output_tokens += usage.output_tokens;
            s.metadata.total_cost += cost;
            s.metadata.last_error = None;
            s.last_active_at = chrono::Utc::now().to_rfc3339();
        })
        .await?;
        if !self.is_current(generation) {
            return Ok(());
        }

        if self.context.compact_if_necessary().await? {
            info!(session_id = %self.id, "compacted context after query");
        }
        if !self.is_current(generation) {
            return Ok(());
        }
        self.publish_context().await;
        if !self.is_current(generation) {
            return Ok(());
        }

        self.questions.clear_for(generation);
        self.transition(generation, ProcessingStatus::Idle);
        self.clear_active(generation);
        Ok(())
    }

    /// Record a failure of query `generation` and move to `error`.
    pub(super) async fn record_error(&self, generation: u64, message: &str) {
        if !self.is_current(generation) {
            return;
        }
        let recorded = self.errors.record(message);
        warn!(session_id = %self.id, generation, category = %recorded.category, %message, "query failed");

        if let Err(e) = self
            .update_session(|s| s.metadata.last_error = Some(recorded.message.clone()))
            .await
        {
            warn!(session_id = %self.id, error = %e, "failed to store session error");
        }
        if !self.is_current(generation) {
            return;
        }
        self.services.publish(DaemonEvent::SessionError {
            session_id: self.id.clone(),
            message: recorded.message.clone(),
            category: recorded.category.clone(),
        });

        self.questions.clear_for(generation);
        self.force_status(generation, ProcessingStatus::Error);
        self.clear_active(generation);
    }

    /// Engines may skip the init event; pass through `thinking` when queued.
    fn advance(&self, generation: u64, next: ProcessingStatus) -> bool {
        if self.processing_status() == ProcessingStatus::Queued {
            self.transition(generation, ProcessingStatus::Thinking);
        }
        self.transition(generation, next)
    }

    fn clear_active(&self, generation: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            *active = None;
        }
    }
}

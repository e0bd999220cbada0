//! Live runtime of one session.
//!
//! An `AgentSession` owns the mutable state of a conversation: the session
//! row, the processing status, the query generation, the token context, any
//! pending question and the recent errors. The query loop lives in
//! [`super::query`]; this module holds the state and the operations that do
//! not involve the engine.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_protocol::now_ms;
use tether_protocol::session::{
    ContextInfo, PendingQuestion, ProcessingStatus, RewindMode, RewindPoint, RewindPreview,
    RewindResult, Session, SessionConfig, SessionStatus,
};
use tether_protocol::state::SessionSnapshot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ContextManager;
use super::error_manager::{ErrorManager, RecordedError};
use super::message_repository::MessagePage;
use super::questions::QuestionState;
use super::rewind::RewindHandler;
use super::{SessionError, SessionServices};
use crate::agent::QueryControl;
use crate::events::DaemonEvent;

/// The query currently allowed to steer this session.
pub(super) struct ActiveQuery {
    pub(super) generation: u64,
    pub(super) control: mpsc::UnboundedSender<QueryControl>,
    pub(super) task: Option<JoinHandle<()>>,
}

pub struct AgentSession {
    pub(super) id: String,
    pub(super) services: Arc<SessionServices>,
    pub(super) session: tokio::sync::Mutex<Session>,
    pub(super) status: Mutex<ProcessingStatus>,
    pub(super) generation: AtomicU64,
    pub(super) context: ContextManager,
    pub(super) rewind: RewindHandler,
    pub(super) questions: QuestionState,
    pub(super) errors: ErrorManager,
    pub(super) active: Mutex<Option<ActiveQuery>>,
    /// Serializes Stage-2 workspace initialization.
    pub(super) init_lock: tokio::sync::Mutex<()>,
    pub(super) closed: AtomicBool,
}

impl AgentSession {
    pub async fn open(session: Session, services: Arc<SessionServices>) -> Result<Arc<Self>> {
        let context = ContextManager::open(
            services.pool.clone(),
            &session.id,
            Arc::clone(&services.estimator),
            services.options.compaction,
        )
        .await
        .with_context(|| format!("opening context of session {}", session.id))?;

        debug!(session_id = %session.id, "opened agent session");
        Ok(Arc::new(Self {
            id: session.id.clone(),
            rewind: RewindHandler::new(services.messages.clone()),
            errors: ErrorManager::new(services.options.error_history),
            session: tokio::sync::Mutex::new(session),
            status: Mutex::new(ProcessingStatus::Idle),
            generation: AtomicU64::new(0),
            context,
            questions: QuestionState::default(),
            active: Mutex::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            services,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Directory the agent and file operations work in.
    pub async fn workspace(&self) -> PathBuf {
        PathBuf::from(self.session.lock().await.effective_workspace())
    }

    pub fn processing_status(&self) -> ProcessingStatus {
        *self.lock_status()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Bump the generation. Events of older queries are discarded from now on.
    pub fn increment_query_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_question(&self) -> Option<PendingQuestion> {
        self.questions.pending()
    }

    pub fn recent_errors(&self) -> Vec<RecordedError> {
        self.errors.history()
    }

    pub(super) fn lock_status(&self) -> MutexGuard<'_, ProcessingStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn lock_active(&self) -> MutexGuard<'_, Option<ActiveQuery>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if `generation` is still current and the transition is
    /// allowed. Returns whether the status is now `next`.
    pub(super) fn transition(&self, generation: u64, next: ProcessingStatus) -> bool {
        {
            let mut status = self.lock_status();
            if !self.is_current(generation) {
                return false;
            }
            if *status == next {
                return true;
            }
            if !status.can_transition_to(next) {
                warn!(session_id = %self.id, from = %*status, to = %next, "rejected status transition");
                return false;
            }
            *status = next;
        }
        self.publish_status(generation, next);
        true
    }

    /// Start a new generation in `queued`, whatever the previous state was.
    pub(super) fn begin_generation(&self) -> u64 {
        let generation = {
            let mut status = self.lock_status();
            let generation = self.increment_query_generation();
            *status = ProcessingStatus::Queued;
            generation
        };
        self.publish_status(generation, ProcessingStatus::Queued);
        generation
    }

    /// Set `next` without validating the transition, if `generation` is current.
    pub(super) fn force_status(&self, generation: u64, next: ProcessingStatus) {
        {
            let mut status = self.lock_status();
            if !self.is_current(generation) || *status == next {
                return;
            }
            *status = next;
        }
        self.publish_status(generation, next);
    }

    fn publish_status(&self, generation: u64, status: ProcessingStatus) {
        self.services.publish(DaemonEvent::StatusChanged {
            session_id: self.id.clone(),
            status,
            generation,
        });
    }

    /// Apply `change` to the session row, persist it and announce it.
    pub(super) async fn update_session(
        &self,
        change: impl FnOnce(&mut Session),
    ) -> Result<Session> {
        let mut session = self.session.lock().await;
        let mut updated = session.clone();
        change(&mut updated);
        self.services.sessions.update(&updated).await?;
        *session = updated.clone();
        drop(session);

        self.services.publish(DaemonEvent::SessionUpdated {
            session: updated.clone(),
        });
        Ok(updated)
    }

    pub async fn update(&self, title: Option<String>, config: Option<SessionConfig>) -> Result<Session> {
        if let Some(ref title) = title
            && title.trim().is_empty()
        {
            bail!("title must not be empty");
        }
        self.update_session(|s| {
            if let Some(title) = title {
                s.title = title.trim().to_string();
                s.metadata.title_generated = true;
            }
            if let Some(config) = config {
                s.config = config;
            }
        })
        .await
    }

    /// Merge the top-level fields of `patch` into the session config.
    pub async fn update_config(&self, patch: &Value) -> Result<SessionConfig> {
        let Some(fields) = patch.as_object() else {
            bail!("settings patch must be an object");
        };
        let mut merged = serde_json::to_value(&self.session.lock().await.config)?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        let config: SessionConfig =
            serde_json::from_value(merged).context("invalid session settings")?;
        let session = self
            .update_session(|s| s.config = config)
            .await?;
        Ok(session.config)
    }

    /// Archive the session, optionally removing its worktree first.
    pub async fn archive(&self, cleanup_worktree: bool) -> Result<Session> {
        self.interrupt().await;

        let worktree = self.session.lock().await.worktree.clone();
        let remove = match worktree {
            Some(ref wt) if cleanup_worktree && wt.is_worktree => {
                self.services.worktrees.remove_worktree(wt).await?;
                true
            }
            _ => false,
        };

        self.update_session(|s| {
            s.status = SessionStatus::Archived;
            s.archived_at = Some(chrono::Utc::now().to_rfc3339());
            if remove {
                s.worktree = None;
            }
        })
        .await
    }

    pub async fn context_info(&self) -> Result<ContextInfo> {
        let session = self.session.lock().await.clone();
        let options = &self.services.options;

        let system_prompt = session
            .config
            .system_prompt
            .as_deref()
            .map(|p| self.context.estimate(p))
            .unwrap_or(0);
        let system_tools = self
            .context
            .estimate(&session.config.allowed_tools.join(" "));
        let messages = self.context.get_token_count().await?;
        let autocompact_buffer = options
            .context_capacity
            .saturating_sub(options.compaction.token_limit);

        let mut info = ContextInfo::compute(
            session
                .config
                .model
                .unwrap_or_else(|| options.default_model.clone()),
            options.context_capacity,
            system_prompt,
            system_tools,
            messages,
            autocompact_buffer,
        );
        info.last_compacted_at = self.context.last_compacted_at().await?;
        Ok(info)
    }

    /// Compact now if over the limit, announcing the new usage when it did.
    pub async fn compact(&self) -> Result<bool> {
        let compacted = self.context.compact_if_necessary().await?;
        if compacted {
            self.publish_context().await;
        }
        Ok(compacted)
    }

    pub(super) async fn publish_context(&self) {
        match self.context_info().await {
            Ok(context) => self.services.publish(DaemonEvent::ContextUpdated {
                session_id: self.id.clone(),
                context,
            }),
            Err(e) => warn!(session_id = %self.id, error = %e, "failed to compute context usage"),
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        Ok(SessionSnapshot {
            session: self.session().await,
            processing_status: self.processing_status(),
            generation: self.generation(),
            context: Some(self.context_info().await?),
            pending_question: self.pending_question(),
            timestamp: now_ms(),
        })
    }

    // Rewind

    pub async fn get_rewind_points(&self) -> Result<Vec<RewindPoint>> {
        self.rewind.get_rewind_points(&self.id).await
    }

    pub async fn preview_rewind(&self, checkpoint_id: &str) -> RewindPreview {
        let workspace = self.workspace().await;
        match self.rewind.preview(&self.id, &workspace, checkpoint_id).await {
            Ok(preview) => preview,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "rewind preview failed");
                RewindPreview::unavailable(format!("{e:#}"))
            }
        }
    }

    pub async fn execute_rewind(&self, checkpoint_id: &str, mode: RewindMode) -> RewindResult {
        if self.processing_status().is_active() {
            return RewindResult::failed("Cannot rewind while a query is running");
        }
        let workspace = self.workspace().await;
        let result = match self
            .rewind
            .execute(&self.id, &workspace, checkpoint_id, mode)
            .await
        {
            Ok(result) => result,
            Err(e) => return RewindResult::failed(format!("Failed to rewind: {e:#}")),
        };
        if result.success && mode.reverts_conversation() {
            self.after_conversation_rewind().await;
        }
        result
    }

    pub async fn preview_selective_rewind(&self, message_ids: &[String]) -> RewindPreview {
        let workspace = self.workspace().await;
        match self
            .rewind
            .preview_selective(&self.id, &workspace, message_ids)
            .await
        {
            Ok(preview) => preview,
            Err(e) => RewindPreview::unavailable(format!("{e:#}")),
        }
    }

    pub async fn execute_selective_rewind(
        &self,
        message_ids: &[String],
        mode: RewindMode,
    ) -> RewindResult {
        if self.processing_status().is_active() {
            return RewindResult::failed("Cannot rewind while a query is running");
        }
        let workspace = self.workspace().await;
        let result = match self
            .rewind
            .execute_selective(&self.id, &workspace, message_ids, mode)
            .await
        {
            Ok(result) => result,
            Err(e) => return RewindResult::failed(format!("Failed to rewind: {e:#}")),
        };
        if result.success && mode.reverts_conversation() {
            self.after_conversation_rewind().await;
        }
        result
    }

    /// The engine cannot forget turns, so the next query starts a fresh
    /// engine conversation; the token context is rebuilt from what is left.
    async fn after_conversation_rewind(&self) {
        let rebuilt = async {
            let remaining = self
                .services
                .messages
                .list(&self.id, MessagePage::default())
                .await?;
            self.context.rebuild_from(&remaining).await?;
            self.update_session(|s| {
                s.metadata.message_count = remaining.len() as u64;
                s.metadata.sdk_session_id = None;
            })
            .await?;
            anyhow::Ok(())
        }
        .await;

        match rebuilt {
            Ok(()) => self.publish_context().await,
            Err(e) => warn!(session_id = %self.id, error = %e, "failed to rebuild after rewind"),
        }
    }

    // Questions

    fn active_control(&self) -> Option<mpsc::UnboundedSender<QueryControl>> {
        self.lock_active().as_ref().map(|a| a.control.clone())
    }

    pub async fn handle_question_response(&self, tool_use_id: &str, responses: Value) -> Result<()> {
        let control = self
            .active_control()
            .context("No running query is waiting for an answer")?;
        self.questions.take(tool_use_id)?;

        control
            .send(QueryControl::AnswerQuestion {
                tool_use_id: tool_use_id.to_string(),
                responses,
            })
            .map_err(|_| anyhow::anyhow!("Agent query closed before the answer was delivered"))?;

        self.resolve_question(tool_use_id, false).await
    }

    pub async fn update_question_draft(&self, responses: Value) -> Result<PendingQuestion> {
        let question = self.questions.set_draft(responses.clone())?;

        let metadata = {
            let mut session = self.session.lock().await;
            session.metadata.question_draft = Some(responses.clone());
            session.metadata.clone()
        };
        self.services
            .sessions
            .update_metadata(&self.id, &metadata)
            .await?;

        self.services.publish(DaemonEvent::QuestionDraftUpdated {
            session_id: self.id.clone(),
            draft: responses,
        });
        Ok(question)
    }

    pub async fn handle_question_cancel(&self, tool_use_id: &str) -> Result<()> {
        self.questions.take(tool_use_id)?;
        if let Some(control) = self.active_control() {
            let _ = control.send(QueryControl::CancelQuestion {
                tool_use_id: tool_use_id.to_string(),
            });
        }
        self.resolve_question(tool_use_id, true).await
    }

    async fn resolve_question(&self, tool_use_id: &str, cancelled: bool) -> Result<()> {
        let metadata = {
            let mut session = self.session.lock().await;
            session.metadata.question_draft = None;
            session.metadata.clone()
        };
        self.services
            .sessions
            .update_metadata(&self.id, &metadata)
            .await?;

        self.services.publish(DaemonEvent::QuestionResolved {
            session_id: self.id.clone(),
            tool_use_id: tool_use_id.to_string(),
            cancelled,
        });
        Ok(())
    }

    // Lifecycle

    /// Stop the running query, if any. Its remaining events are discarded.
    pub async fn interrupt(&self) -> bool {
        let active = self.lock_active().take();
        let Some(active) = active else {
            return false;
        };
        let _ = active.control.send(QueryControl::Interrupt);

        let generation = {
            let mut status = self.lock_status();
            let generation = self.increment_query_generation();
            *status = ProcessingStatus::Idle;
            generation
        };
        self.publish_status(generation, ProcessingStatus::Idle);

        if let Some(question) = self.questions.clear() {
            self.services.publish(DaemonEvent::QuestionResolved {
                session_id: self.id.clone(),
                tool_use_id: question.tool_use_id,
                cancelled: true,
            });
        }
        info!(session_id = %self.id, "interrupted query");
        true
    }

    /// Release runtime resources. The session row is untouched.
    pub async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self
            .lock_active()
            .as_mut()
            .and_then(|active| active.task.take());
        self.interrupt().await;
        if let Some(task) = task {
            task.abort();
        }
        debug!(session_id = %self.id, "cleaned up agent session");
    }

    pub(super) fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(())
    }
}

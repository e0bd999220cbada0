//! Server side of the state channels.
//!
//! The `StateManager` turns daemon events from the in-process hub into
//! snapshot and delta events on the [`MessageHub`]: sessions-list deltas and
//! settings on `global`, everything about one conversation on its
//! `session:<id>` channel. It also answers the snapshot RPCs.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use tether_protocol::channels::{GLOBAL_CHANNEL, events, session_channel};
use tether_protocol::now_ms;
use tether_protocol::settings::SettingsUpdated;
use tether_protocol::state::{
    DaemonConfigInfo, DeltaCatchUp, HealthStatus, MessagesDelta, SessionCounts,
    SessionErrorEvent, SessionSnapshot, SessionStatusEvent, SessionsDelta, SessionsSnapshot,
    SettingsSnapshot, SystemSnapshot,
};
use tracing::{debug, info, warn};

use super::delta_log::DeltaLog;
use crate::events::{DaemonEvent, DaemonEventKind};
use crate::hub::{InProcessHub, MessageHub, Unsubscribe};
use crate::session::{SessionError, SessionManager};
use crate::settings::SettingsRepository;

const SUBSCRIBED_KINDS: [DaemonEventKind; 12] = [
    DaemonEventKind::SessionCreated,
    DaemonEventKind::SessionUpdated,
    DaemonEventKind::SessionDeleted,
    DaemonEventKind::StatusChanged,
    DaemonEventKind::MessagePersisted,
    DaemonEventKind::StreamDelta,
    DaemonEventKind::ContextUpdated,
    DaemonEventKind::QuestionAsked,
    DaemonEventKind::QuestionDraftUpdated,
    DaemonEventKind::QuestionResolved,
    DaemonEventKind::SessionError,
    DaemonEventKind::SettingsUpdated,
];

pub struct StateManager {
    hub: MessageHub,
    sessions: Arc<SessionManager>,
    settings: SettingsRepository,
    config: DaemonConfigInfo,
    deltas: DeltaLog,
    started_at: Instant,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl StateManager {
    pub fn new(
        hub: MessageHub,
        sessions: Arc<SessionManager>,
        settings: SettingsRepository,
        config: DaemonConfigInfo,
        delta_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            sessions,
            settings,
            config,
            deltas: DeltaLog::new(delta_capacity),
            started_at: Instant::now(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to every daemon event kind. Calling it twice subscribes twice.
    pub fn start(self: &Arc<Self>, events: &InProcessHub<DaemonEvent>) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One subscription over every kind keeps deltas in emission order.
        let weak: Weak<Self> = Arc::downgrade(self);
        subscriptions.push(events.on_kinds(&SUBSCRIBED_KINDS, None, move |event| {
            let weak = Weak::clone(&weak);
            async move {
                match weak.upgrade() {
                    Some(manager) => manager.handle(event).await,
                    None => Ok(()),
                }
            }
        }));
        info!(kinds = SUBSCRIBED_KINDS.len(), "state manager started");
    }

    pub fn stop(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        subscriptions.into_iter().for_each(Unsubscribe::unsubscribe);
    }

    pub async fn handle(&self, event: DaemonEvent) -> Result<()> {
        match event {
            DaemonEvent::SessionCreated { session } => {
                let delta = self.deltas.push(SessionsDelta {
                    added: vec![session],
                    ..Default::default()
                });
                self.publish(events::SESSIONS_DELTA, &delta, GLOBAL_CHANNEL).await;
            }
            DaemonEvent::SessionUpdated { session } => {
                let id = session.id.clone();
                let delta = self.deltas.push(SessionsDelta {
                    updated: vec![session],
                    ..Default::default()
                });
                self.publish(events::SESSIONS_DELTA, &delta, GLOBAL_CHANNEL).await;
                self.publish_session_state(&id).await;
            }
            DaemonEvent::SessionDeleted { session_id } => {
                let delta = self.deltas.push(SessionsDelta {
                    removed: vec![session_id],
                    ..Default::default()
                });
                self.publish(events::SESSIONS_DELTA, &delta, GLOBAL_CHANNEL).await;
            }
            DaemonEvent::StatusChanged {
                session_id,
                status,
                generation,
            } => {
                let channel = session_channel(&session_id);
                let payload = SessionStatusEvent {
                    session_id,
                    status,
                    generation,
                };
                self.publish(events::SESSION_STATUS, &payload, &channel).await;
            }
            DaemonEvent::MessagePersisted {
                session_id,
                message,
            } => {
                let channel = session_channel(&session_id);
                let payload = MessagesDelta {
                    session_id,
                    added: vec![message],
                    timestamp: now_ms(),
                };
                self.publish(events::MESSAGES_DELTA, &payload, &channel).await;
            }
            DaemonEvent::StreamDelta {
                session_id,
                generation,
                text,
            } => {
                let channel = session_channel(&session_id);
                let payload = json!({"sessionId": session_id, "generation": generation, "text": text});
                self.publish(events::STREAM_DELTA, &payload, &channel).await;
            }
            DaemonEvent::ContextUpdated {
                session_id,
                context,
            } => {
                let channel = session_channel(&session_id);
                let payload = json!({"sessionId": session_id, "context": context});
                self.publish(events::CONTEXT_UPDATED, &payload, &channel).await;
            }
            DaemonEvent::QuestionAsked {
                session_id,
                question,
            } => {
                let channel = session_channel(&session_id);
                let payload = json!({"sessionId": session_id, "question": question});
                self.publish(events::QUESTION_ASKED, &payload, &channel).await;
            }
            DaemonEvent::QuestionDraftUpdated { session_id, draft } => {
                let channel = session_channel(&session_id);
                let payload = json!({"sessionId": session_id, "draft": draft});
                self.publish(events::QUESTION_DRAFT, &payload, &channel).await;
            }
            DaemonEvent::QuestionResolved {
                session_id,
                tool_use_id,
                cancelled,
            } => {
                let channel = session_channel(&session_id);
                let payload = json!({
                    "sessionId": session_id,
                    "toolUseId": tool_use_id,
                    "cancelled": cancelled,
                });
                self.publish(events::QUESTION_RESOLVED, &payload, &channel).await;
            }
            DaemonEvent::SessionError {
                session_id,
                message,
                category,
            } => {
                let channel = session_channel(&session_id);
                let payload = SessionErrorEvent {
                    session_id,
                    message,
                    category,
                    timestamp: now_ms(),
                };
                self.publish(events::SESSION_ERROR, &payload, &channel).await;
            }
            DaemonEvent::SettingsUpdated { scope, settings } => {
                let global = scope == GLOBAL_CHANNEL;
                let payload = SettingsUpdated { scope, settings };
                self.publish(events::SETTINGS_UPDATED, &payload, GLOBAL_CHANNEL).await;
                if global {
                    let snapshot = self.settings_snapshot().await?;
                    self.publish(events::SETTINGS, &snapshot, GLOBAL_CHANNEL).await;
                }
            }
        }
        Ok(())
    }

    async fn publish<T: Serialize>(&self, name: &str, payload: &T, channel: &str) {
        let delivered = self.hub.event_typed(name, payload, Some(channel)).await;
        debug!(event = name, %channel, delivered, "published state event");
    }

    /// Publish `state.session` for a live session. Sessions without a live
    /// runtime have no processing state to report.
    async fn publish_session_state(&self, session_id: &str) {
        let Some(agent) = self.sessions.live_session(session_id) else {
            return;
        };
        match agent.snapshot().await {
            Ok(snapshot) => {
                self.publish(events::SESSION, &snapshot, &session_channel(session_id))
                    .await
            }
            Err(e) => warn!(%session_id, error = %e, "failed to build session snapshot"),
        }
    }

    /// Publish the full sessions list, e.g. after the archive filter changed.
    pub async fn publish_sessions_snapshot(&self) -> Result<()> {
        let snapshot = self.sessions_snapshot().await?;
        self.publish(events::SESSIONS, &snapshot, GLOBAL_CHANNEL).await;
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            status: "ok".to_string(),
            version: self.config.version.clone(),
            uptime: self.started_at.elapsed().as_secs(),
            sessions: SessionCounts {
                active: self.sessions.active_sessions() as u64,
                total: self.sessions.total_sessions().await?,
            },
        })
    }

    pub fn config_info(&self) -> DaemonConfigInfo {
        self.config.clone()
    }

    /// Sessions visible under the current archive filter.
    pub async fn sessions_snapshot(&self) -> Result<SessionsSnapshot> {
        let timestamp = now_ms();
        let show_archived = self.settings.get_global().await?.show_archived;
        Ok(SessionsSnapshot {
            sessions: self.sessions.list(show_archived).await?,
            timestamp,
        })
    }

    pub fn deltas_since(&self, since: i64) -> DeltaCatchUp {
        self.deltas.since(since)
    }

    pub async fn system_snapshot(&self) -> Result<SystemSnapshot> {
        Ok(SystemSnapshot {
            health: self.health().await?,
            config: self.config_info(),
            timestamp: now_ms(),
        })
    }

    pub async fn settings_snapshot(&self) -> Result<SettingsSnapshot> {
        Ok(SettingsSnapshot {
            settings: self.settings.get_global().await?,
            timestamp: now_ms(),
        })
    }

    pub async fn session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let agent = self
            .sessions
            .get_session_async(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        agent.snapshot().await
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedEngine;
    use crate::hub::{DEFAULT_REQUEST_TIMEOUT, InProcessTransport, Transport};
    use crate::session::CreateSessionParams;
    use crate::session::manager::tests::services;
    use std::time::Duration;
    use tempfile::TempDir;
    use tether_protocol::HubMessage;
    use tokio::sync::mpsc;

    struct Fixture {
        tmp: TempDir,
        state: Arc<StateManager>,
        sessions: Arc<SessionManager>,
        client: MessageHub,
        _server: MessageHub,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let services = services(Arc::new(ScriptedEngine::echo()), tmp.path()).await;
        let events = services.events.clone();
        let settings = services.settings.clone();
        let sessions = Arc::new(SessionManager::new(services));

        let (server_end, client_end) = InProcessTransport::pair("daemon", "client");
        let server = MessageHub::new(DEFAULT_REQUEST_TIMEOUT);
        let client = MessageHub::new(DEFAULT_REQUEST_TIMEOUT);
        let _ = server.register_transport(server_end.clone(), "in-process", true);
        let _ = client.register_transport(client_end.clone(), "in-process", true);
        server_end.initialize().await.unwrap();
        client_end.initialize().await.unwrap();

        let config = DaemonConfigInfo {
            version: "test".into(),
            default_model: "default".into(),
            engine: "echo".into(),
            auth_method: "none".into(),
            context_capacity: 200_000,
            worktrees_enabled: false,
        };
        let state = StateManager::new(server.clone(), Arc::clone(&sessions), settings, config, 16);
        state.start(&events);

        Fixture {
            tmp,
            state,
            sessions,
            client,
            _server: server,
        }
    }

    fn collect(hub: &MessageHub, name: &str) -> mpsc::UnboundedReceiver<HubMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = hub.on_event(
            name,
            Arc::new(move |msg: &HubMessage| {
                let _ = tx.send(msg.clone());
            }),
        );
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<HubMessage>) -> HubMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event not delivered")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_session_created_publishes_delta_on_global() {
        let f = fixture().await;
        let mut deltas = collect(&f.client, events::SESSIONS_DELTA);

        let session = f
            .sessions
            .create_session(CreateSessionParams {
                workspace_path: f.tmp.path().to_string_lossy().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let msg = next(&mut deltas).await;
        assert_eq!(msg.channel.as_deref(), Some(GLOBAL_CHANNEL));
        let delta: SessionsDelta = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(delta.added[0].id, session.id);

        let catch_up = f.state.deltas_since(0);
        assert!(!catch_up.resync);
        assert_eq!(catch_up.deltas.len(), 1);
        assert!(f.state.deltas_since(delta.timestamp).deltas.is_empty());
    }

    #[tokio::test]
    async fn test_session_events_only_reach_joined_connections() {
        let f = fixture().await;
        let mut status = collect(&f.client, events::SESSION_STATUS);
        let session = f
            .sessions
            .create_session(CreateSessionParams {
                workspace_path: f.tmp.path().to_string_lossy().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        f.client
            .request(
                tether_protocol::channels::methods::CHANNEL_JOIN,
                json!({"channel": session_channel(&session.id)}),
            )
            .await
            .unwrap();
        let agent = f.sessions.require(&session.id).await.unwrap();
        agent.send_message("hello").await.unwrap();

        let msg = next(&mut status).await;
        let event: SessionStatusEvent = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(event.session_id, session.id);
        assert_eq!(event.generation, 1);
    }

    #[tokio::test]
    async fn test_health_counts_sessions() {
        let f = fixture().await;
        for _ in 0..3 {
            f.sessions
                .create_session(CreateSessionParams {
                    workspace_path: f.tmp.path().to_string_lossy().to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let first = &f.sessions.list(false).await.unwrap()[0];
        f.sessions.require(&first.id).await.unwrap();

        let health = f.state.health().await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.sessions, SessionCounts { active: 1, total: 3 });

        let snapshot = f.state.sessions_snapshot().await.unwrap();
        assert_eq!(snapshot.sessions.len(), 3);
    }
}

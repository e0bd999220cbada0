//! Client side of the state channels.
//!
//! `StateChannelClient` keeps a local copy of the daemon state behind a
//! client [`MessageHub`]. Snapshots replace the sessions and system
//! partitions; messages are merged by id so replays across a reconnect do
//! not duplicate them. After a reconnect, a recent `last_sync` is caught up
//! from deltas and an old one triggers a full resync. Messages are caught up
//! from the newest message timestamp held per session, not from `last_sync`:
//! delta stamps may run ahead of the clock messages are stamped with.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tether_protocol::channels::{events, methods, session_id_from_channel};
use tether_protocol::session::{Session, StoredMessage};
use tether_protocol::settings::GlobalSettings;
use tether_protocol::state::{
    DeltaCatchUp, MessagesDelta, SessionsDelta, SessionsSnapshot, SettingsSnapshot, SystemSnapshot,
};
use tether_protocol::{HubMessage, now_ms};
use tracing::{debug, info, warn};

use crate::hub::{ConnectionState, HubError, MessageHub, TransportEvent, Unsubscribe};

/// How a reconnect was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Missed deltas were applied.
    CaughtUp { deltas: usize },
    /// State was discarded and reloaded from snapshots.
    Resynced,
}

#[derive(Debug, Default)]
struct LocalState {
    sessions: HashMap<String, Session>,
    system: Option<SystemSnapshot>,
    settings: Option<GlobalSettings>,
    messages: HashMap<String, Vec<StoredMessage>>,
    last_sync: Option<i64>,
}

impl LocalState {
    fn touch(&mut self, timestamp: i64) {
        self.last_sync = Some(self.last_sync.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn apply_sessions_delta(&mut self, delta: SessionsDelta) {
        for session in delta.added.into_iter().chain(delta.updated) {
            self.sessions.insert(session.id.clone(), session);
        }
        for id in delta.removed {
            self.sessions.remove(&id);
            self.messages.remove(&id);
        }
        self.touch(delta.timestamp);
    }

    fn merge_messages(&mut self, session_id: &str, incoming: Vec<StoredMessage>) -> usize {
        let stored = self.messages.entry(session_id.to_string()).or_default();
        let known: BTreeSet<String> = stored.iter().map(|m| m.id.clone()).collect();
        let before = stored.len();
        stored.extend(incoming.into_iter().filter(|m| !known.contains(&m.id)));
        stored.sort_by_key(|m| m.timestamp);
        stored.len() - before
    }

    /// Newest message timestamp held for `session_id`.
    fn message_watermark(&self, session_id: &str) -> Option<i64> {
        self.messages
            .get(session_id)?
            .iter()
            .map(|m| m.timestamp)
            .max()
    }
}

pub struct StateChannelClient {
    hub: MessageHub,
    staleness: Duration,
    state: Mutex<LocalState>,
    channels: Mutex<BTreeSet<String>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl StateChannelClient {
    /// Register the state event handlers on `hub`.
    pub fn new(hub: MessageHub, staleness: Duration) -> Arc<Self> {
        let client = Arc::new(Self {
            hub,
            staleness,
            state: Mutex::new(LocalState::default()),
            channels: Mutex::new(BTreeSet::new()),
            subscriptions: Mutex::new(Vec::new()),
        });
        client.register_handlers();
        client
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_handlers(self: &Arc<Self>) {
        let mut subscriptions = Vec::new();
        subscriptions.push(self.on_payload(events::SESSIONS, |state, snapshot: SessionsSnapshot| {
            state.sessions = snapshot
                .sessions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect();
            state.touch(snapshot.timestamp);
        }));
        subscriptions.push(self.on_payload(events::SESSIONS_DELTA, |state, delta: SessionsDelta| {
            state.apply_sessions_delta(delta);
        }));
        subscriptions.push(self.on_payload(events::SYSTEM, |state, snapshot: SystemSnapshot| {
            state.touch(snapshot.timestamp);
            state.system = Some(snapshot);
        }));
        subscriptions.push(self.on_payload(events::SETTINGS, |state, snapshot: SettingsSnapshot| {
            state.settings = Some(snapshot.settings);
            state.touch(snapshot.timestamp);
        }));
        subscriptions.push(self.on_payload(events::MESSAGES_DELTA, |state, delta: MessagesDelta| {
            state.merge_messages(&delta.session_id, delta.added);
        }));

        // Reconcile whenever the transport comes back.
        let weak = Arc::downgrade(self);
        subscriptions.push(self.hub.on_connection_change(Arc::new(move |event: &TransportEvent| {
            if *event != TransportEvent::StateChanged(ConnectionState::Connected) {
                return;
            }
            let Some(client) = weak.upgrade() else { return };
            tokio::spawn(async move {
                if let Err(e) = client.on_reconnected().await {
                    warn!(error = %format!("{e:#}"), "state reconciliation failed");
                }
            });
        })));

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(subscriptions);
    }

    fn on_payload<T, F>(self: &Arc<Self>, name: &'static str, apply: F) -> Unsubscribe
    where
        T: DeserializeOwned,
        F: Fn(&mut LocalState, T) + Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.hub.on_event(
            name,
            Arc::new(move |message: &HubMessage| {
                let Some(client) = weak.upgrade() else { return };
                match serde_json::from_value::<T>(message.payload.clone()) {
                    Ok(payload) => apply(&mut client.lock(), payload),
                    Err(e) => warn!(event = name, error = %e, "dropping malformed state event"),
                }
            }),
        )
    }

    /// Start handling `channel` now and join it on the server in the
    /// background. A failed join is logged; reconnects retry it.
    pub fn subscribe_optimistic(self: &Arc<Self>, channel: &str) {
        let newly_added = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string());
        if !newly_added {
            return;
        }
        let hub = self.hub.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            if let Err(e) = join(&hub, &channel).await {
                warn!(%channel, error = %e, "channel join failed");
            }
        });
    }

    /// Stop handling `channel` and leave it on the server.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), HubError> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        if let Some(session_id) = session_id_from_channel(channel) {
            self.lock().messages.remove(session_id);
        }
        self.hub
            .request(methods::CHANNEL_LEAVE, json!({ "channel": channel }))
            .await
            .map(|_| ())
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    async fn on_reconnected(&self) -> Result<Reconciliation> {
        for channel in self.subscribed_channels() {
            join(&self.hub, &channel).await?;
        }
        self.reconcile(now_ms()).await
    }

    /// Bring local state up to date as of `now` (Unix ms).
    pub async fn reconcile(&self, now: i64) -> Result<Reconciliation> {
        let Some(last_sync) = self.last_sync() else {
            self.full_resync().await?;
            return Ok(Reconciliation::Resynced);
        };
        let age = now.saturating_sub(last_sync);
        if age > self.staleness.as_millis() as i64 {
            debug!(age_ms = age, "state is stale, resyncing");
            self.full_resync().await?;
            return Ok(Reconciliation::Resynced);
        }

        let catch_up: DeltaCatchUp = self
            .request(methods::SESSIONS_DELTAS, json!({ "since": last_sync }))
            .await?;
        if catch_up.resync {
            debug!("server cannot serve missed deltas, resyncing");
            self.full_resync().await?;
            return Ok(Reconciliation::Resynced);
        }

        let deltas = catch_up.deltas.len();
        {
            let mut state = self.lock();
            for delta in catch_up.deltas {
                state.apply_sessions_delta(delta);
            }
            state.touch(catch_up.timestamp);
        }
        for session_id in self.message_sessions() {
            let watermark = self.lock().message_watermark(&session_id);
            let params = match watermark {
                Some(since) => json!({ "sessionId": session_id, "since": since }),
                None => json!({ "sessionId": session_id }),
            };
            let missed: Vec<StoredMessage> = self.request(methods::MESSAGE_LIST, params).await?;
            self.lock().merge_messages(&session_id, missed);
        }
        info!(deltas, "caught up state after reconnect");
        Ok(Reconciliation::CaughtUp { deltas })
    }

    /// Discard local state and reload every partition from snapshots.
    pub async fn full_resync(&self) -> Result<()> {
        let sessions: SessionsSnapshot = self.request(methods::SESSIONS_SNAPSHOT, json!({})).await?;
        let system: SystemSnapshot = self.request(methods::SYSTEM_SNAPSHOT, json!({})).await?;
        let settings: SettingsSnapshot = self.request(methods::SETTINGS_SNAPSHOT, json!({})).await?;

        let mut messages = HashMap::new();
        for session_id in self.message_sessions() {
            let list: Vec<StoredMessage> = self
                .request(methods::MESSAGE_LIST, json!({ "sessionId": session_id }))
                .await?;
            messages.insert(session_id, list);
        }

        let timestamp = sessions
            .timestamp
            .min(system.timestamp)
            .min(settings.timestamp);
        let mut state = self.lock();
        *state = LocalState {
            sessions: sessions
                .sessions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            system: Some(system),
            settings: Some(settings.settings),
            messages: HashMap::new(),
            last_sync: Some(timestamp),
        };
        for (session_id, list) in messages {
            state.merge_messages(&session_id, list);
        }
        Ok(())
    }

    /// Session ids whose channel this client follows.
    fn message_sessions(&self) -> Vec<String> {
        self.subscribed_channels()
            .iter()
            .filter_map(|c| session_id_from_channel(c).map(str::to_string))
            .collect()
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, payload: Value) -> Result<T> {
        self.hub
            .request_as(method, payload)
            .await
            .with_context(|| format!("{method} failed"))
    }

    pub fn last_sync(&self) -> Option<i64> {
        self.lock().last_sync
    }

    /// Known sessions, newest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn system(&self) -> Option<SystemSnapshot> {
        self.lock().system.clone()
    }

    pub fn settings(&self) -> Option<GlobalSettings> {
        self.lock().settings.clone()
    }

    pub fn messages(&self, session_id: &str) -> Vec<StoredMessage> {
        self.lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn close(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        subscriptions.into_iter().for_each(Unsubscribe::unsubscribe);
    }
}

async fn join(hub: &MessageHub, channel: &str) -> Result<(), HubError> {
    hub.request(methods::CHANNEL_JOIN, json!({ "channel": channel }))
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::session::MessageRole;

    fn message(id: &str, timestamp: i64) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            session_id: "s1".into(),
            role: MessageRole::User,
            content: id.into(),
            sdk_message: None,
            timestamp,
        }
    }

    #[test]
    fn test_messages_merge_by_id() {
        let mut state = LocalState::default();
        assert_eq!(state.merge_messages("s1", vec![message("a", 1), message("b", 2)]), 2);
        assert_eq!(state.merge_messages("s1", vec![message("b", 2), message("c", 3)]), 1);

        let ids: Vec<_> = state.messages["s1"].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_message_watermark_is_per_session() {
        let mut state = LocalState::default();
        assert_eq!(state.message_watermark("s1"), None);

        state.merge_messages("s1", vec![message("b", 7), message("a", 3)]);
        state.merge_messages("s2", vec![message("c", 40)]);
        assert_eq!(state.message_watermark("s1"), Some(7));
        assert_eq!(state.message_watermark("s2"), Some(40));

        // A catch-up starting at the watermark replays the boundary message.
        assert_eq!(state.merge_messages("s1", vec![message("b", 7), message("d", 7)]), 1);
    }

    #[test]
    fn test_last_sync_never_moves_backwards() {
        let mut state = LocalState::default();
        state.touch(10);
        state.touch(5);
        assert_eq!(state.last_sync, Some(10));
    }

    #[test]
    fn test_removed_session_drops_its_messages() {
        let mut state = LocalState::default();
        state.merge_messages("s1", vec![message("a", 1)]);
        state.apply_sessions_delta(SessionsDelta {
            removed: vec!["s1".into()],
            timestamp: 20,
            ..Default::default()
        });
        assert!(!state.messages.contains_key("s1"));
        assert_eq!(state.last_sync, Some(20));
    }
}

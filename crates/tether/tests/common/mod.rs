//! Test utilities: a full daemon on an in-memory database with a scripted
//! agent, plus in-process client hubs to talk to it.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tether::agent::{AgentEngine, ScriptedEngine};
use tether::config::AppConfig;
use tether::db::Database;
use tether::hub::MessageHub;
use tether::DaemonContext;
use tether_protocol::HubMessage;
use tether_protocol::channels::methods;
use tether_protocol::session::Session;
use tether_protocol::state::SessionSnapshot;

pub struct TestDaemon {
    pub daemon: Arc<DaemonContext>,
    pub engine: Arc<ScriptedEngine>,
    pub workspace: TempDir,
    pub data: TempDir,
}

/// Daemon answering every prompt with the prompt itself; worktrees off.
pub async fn test_daemon() -> TestDaemon {
    test_daemon_with(ScriptedEngine::echo(), false).await
}

pub async fn test_daemon_with(engine: ScriptedEngine, worktrees: bool) -> TestDaemon {
    let data = TempDir::new().expect("create data dir");
    let workspace = TempDir::new().expect("create workspace dir");

    let mut config = AppConfig::default();
    config.worktree.enabled = worktrees;
    config.worktree.sweep_interval_secs = 0;
    config.hub.request_timeout_ms = 5_000;

    let engine = Arc::new(engine);
    let db = Database::in_memory().await.expect("open database");
    let daemon = DaemonContext::build(
        config,
        db,
        &data.path().join("worktrees"),
        engine.clone() as Arc<dyn AgentEngine>,
    )
    .await
    .expect("build daemon");

    TestDaemon {
        daemon,
        engine,
        workspace,
        data,
    }
}

impl TestDaemon {
    pub async fn client(&self, name: &str) -> MessageHub {
        self.daemon
            .connect_in_process(name)
            .await
            .expect("connect in-process client")
    }

    pub fn workspace_path(&self) -> String {
        self.workspace.path().to_string_lossy().into_owned()
    }

    pub async fn create_session(&self, client: &MessageHub) -> Session {
        client
            .request_as(
                methods::SESSION_CREATE,
                json!({ "workspacePath": self.workspace_path() }),
            )
            .await
            .expect("session.create")
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Wait until the session is idle with at least `messages` stored.
pub async fn wait_until_idle(client: &MessageHub, session_id: &str, messages: u64) {
    wait_for(|| async move {
        let snapshot: SessionSnapshot = client
            .request_as(
                methods::SESSION_SNAPSHOT,
                json!({ "sessionId": session_id }),
            )
            .await
            .expect("state.session.snapshot");
        let count: Value = client
            .request(methods::MESSAGE_COUNT, json!({ "sessionId": session_id }))
            .await
            .expect("message.count");
        !snapshot.processing_status.is_active()
            && count["count"].as_u64().unwrap_or(0) >= messages
    })
    .await;
}

/// Record every `name` event the client receives.
pub fn record_events(client: &MessageHub, name: &str) -> Arc<Mutex<Vec<HubMessage>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _ = client.on_event(
        name,
        Arc::new(move |message: &HubMessage| {
            sink.lock().unwrap().push(message.clone());
        }),
    );
    received
}

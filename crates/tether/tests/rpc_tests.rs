//! RPC integration tests over an in-process client hub.

use serde_json::{Value, json};
use tether::hub::HubError;
use tether_protocol::ErrorCode;
use tether_protocol::channels::{events, methods};
use tether_protocol::pair::{PairStatus, SessionPair};
use tether_protocol::session::{MessageRole, Session, SessionStatus, StoredMessage};
use tether_protocol::settings::GlobalSettings;
use tether_protocol::state::{DeltaCatchUp, HealthStatus, SessionsSnapshot};

mod common;
use common::{record_events, test_daemon, wait_for, wait_until_idle};

fn error_code(err: HubError) -> ErrorCode {
    match err {
        HubError::Remote { code, .. } => code,
        other => panic!("expected a remote error, got {other}"),
    }
}

fn error_message(err: HubError) -> String {
    match err {
        HubError::Remote { message, .. } => message,
        other => panic!("expected a remote error, got {other}"),
    }
}

#[tokio::test]
async fn test_system_health_counts_sessions() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    t.create_session(&client).await;

    let health: HealthStatus = client
        .request_as(methods::SYSTEM_HEALTH, Value::Null)
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.sessions.total, 1);
    assert_eq!(health.sessions.active, 0);

    let config: Value = client
        .request(methods::SYSTEM_CONFIG, json!({}))
        .await
        .unwrap();
    assert_eq!(config["engine"], "command");
    assert_eq!(config["worktreesEnabled"], false);
}

#[tokio::test]
async fn test_unknown_method_is_method_not_found() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let err = client.request("nope.missing", json!({})).await.unwrap_err();
    assert_eq!(error_code(err), ErrorCode::MethodNotFound);
}

#[tokio::test]
async fn test_create_rejects_missing_workspace() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let err = client
        .request(
            methods::SESSION_CREATE,
            json!({ "workspacePath": "/definitely/not/here" }),
        )
        .await
        .unwrap_err();
    assert_eq!(error_code(err), ErrorCode::BadRequest);

    let err = client
        .request(methods::SESSION_GET, json!({ "sessionId": "missing" }))
        .await
        .unwrap_err();
    assert_eq!(error_code(err), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_send_message_persists_the_turn() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    let sent: Value = client
        .request(
            methods::MESSAGE_SEND,
            json!({ "sessionId": session.id, "content": "Add a README\nwith details" }),
        )
        .await
        .unwrap();
    assert_eq!(sent["generation"], 1);
    assert_eq!(sent["message"]["role"], "user");

    wait_until_idle(&client, &session.id, 3).await;

    let messages: Vec<StoredMessage> = client
        .request_as(methods::MESSAGE_LIST, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![MessageRole::User, MessageRole::Assistant, MessageRole::Result]
    );

    let sdk: Vec<Value> = client
        .request_as(
            methods::MESSAGE_SDK_MESSAGES,
            json!({ "sessionId": session.id }),
        )
        .await
        .unwrap();
    assert!(sdk.iter().any(|m| m["type"] == "assistant"));

    let stored: Session = client
        .request_as(methods::SESSION_GET, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(stored.title, "Add a README");
    assert!(stored.workspace_initialized);

    let page: Vec<StoredMessage> = client
        .request_as(
            methods::MESSAGE_LIST,
            json!({ "sessionId": session.id, "limit": 1, "offset": 1 }),
        )
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].role, MessageRole::Assistant);
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    let err = client
        .request(
            methods::MESSAGE_SEND,
            json!({ "sessionId": session.id, "content": "   " }),
        )
        .await
        .unwrap_err();
    assert_eq!(error_code(err), ErrorCode::BadRequest);
}

#[tokio::test]
async fn test_archive_hides_session_until_requested() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    let archived: Session = client
        .request_as(methods::SESSION_ARCHIVE, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(archived.status, SessionStatus::Archived);

    let visible: Vec<Session> = client
        .request_as(methods::SESSION_LIST, json!({}))
        .await
        .unwrap();
    assert!(visible.is_empty());

    let all: Vec<Session> = client
        .request_as(methods::SESSION_LIST, json!({ "includeArchived": true }))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let deleted: Value = client
        .request(methods::SESSION_DELETE, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], true);
    let err = client
        .request(methods::SESSION_DELETE, json!({ "sessionId": session.id }))
        .await
        .unwrap_err();
    assert_eq!(error_code(err), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_show_archived_toggle_announces_filter_change() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let filter_events = record_events(&client, events::SESSIONS_FILTER_CHANGED);
    let settings_events = record_events(&client, events::SETTINGS_UPDATED);
    let snapshots = record_events(&client, events::SESSIONS);

    let updated: GlobalSettings = client
        .request_as(
            methods::SETTINGS_GLOBAL_UPDATE,
            json!({ "showArchived": true }),
        )
        .await
        .unwrap();
    assert!(updated.show_archived);
    assert!(updated.auto_scroll);

    wait_for(|| {
        let done = !filter_events.lock().unwrap().is_empty()
            && !settings_events.lock().unwrap().is_empty()
            && !snapshots.lock().unwrap().is_empty();
        async move { done }
    })
    .await;
    let filter = filter_events.lock().unwrap()[0].clone();
    assert_eq!(filter.payload["showArchived"], true);
    assert_eq!(filter.channel.as_deref(), Some("global"));
    assert_eq!(settings_events.lock().unwrap()[0].payload["scope"], "global");

    let fetched: GlobalSettings = client
        .request_as(methods::SETTINGS_GLOBAL_GET, json!({}))
        .await
        .unwrap();
    assert_eq!(fetched, updated);
}

#[tokio::test]
async fn test_mcp_servers_toggle() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let result: Value = client
        .request(
            methods::SETTINGS_MCP_TOGGLE,
            json!({ "server": "github", "enabled": false }),
        )
        .await
        .unwrap();
    assert_eq!(result["disabledMcpServers"], json!(["github"]));

    client
        .request(
            methods::SETTINGS_MCP_SET_DISABLED,
            json!({ "servers": ["slack", "github", "slack"] }),
        )
        .await
        .unwrap();
    client
        .request(
            methods::SETTINGS_MCP_TOGGLE,
            json!({ "server": "github", "enabled": true }),
        )
        .await
        .unwrap();

    let disabled: Value = client
        .request(methods::SETTINGS_MCP_GET_DISABLED, json!({}))
        .await
        .unwrap();
    assert_eq!(disabled["disabledMcpServers"], json!(["slack"]));
}

#[tokio::test]
async fn test_session_settings_merge() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    let config: Value = client
        .request(
            methods::SETTINGS_SESSION_UPDATE,
            json!({ "sessionId": session.id, "settings": { "model": "opus", "allowedTools": ["Read"] } }),
        )
        .await
        .unwrap();
    assert_eq!(config["model"], "opus");

    let config: Value = client
        .request(
            methods::SETTINGS_SESSION_UPDATE,
            json!({ "sessionId": session.id, "settings": { "permissionMode": "plan" } }),
        )
        .await
        .unwrap();
    assert_eq!(config["model"], "opus");
    assert_eq!(config["permissionMode"], "plan");
    assert_eq!(config["allowedTools"], json!(["Read"]));
}

#[tokio::test]
async fn test_rewind_on_unknown_session_is_structured() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let checkpoints: Value = client
        .request(methods::REWIND_CHECKPOINTS, json!({ "sessionId": "ghost" }))
        .await
        .unwrap();
    assert_eq!(checkpoints["checkpoints"], json!([]));
    assert!(checkpoints["error"].as_str().unwrap().contains("not found"));

    let executed: Value = client
        .request(
            methods::REWIND_EXECUTE,
            json!({ "sessionId": "ghost", "checkpointId": "x", "mode": "files" }),
        )
        .await
        .unwrap();
    assert_eq!(executed["result"]["success"], false);

    let preview: Value = client
        .request(
            methods::REWIND_PREVIEW_SELECTIVE,
            json!({ "sessionId": "ghost", "messageIds": ["a"] }),
        )
        .await
        .unwrap();
    assert_eq!(preview["preview"]["canRewind"], false);
}

#[tokio::test]
async fn test_message_list_rejects_unknown_session() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let err = client
        .request(methods::MESSAGE_LIST, json!({ "sessionId": "invalid" }))
        .await
        .unwrap_err();
    assert!(error_message(err).contains("Session not found"));
}

#[tokio::test]
async fn test_rewind_preview_with_unknown_checkpoint() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    let preview: Value = client
        .request(
            methods::REWIND_PREVIEW,
            json!({ "sessionId": session.id, "checkpointId": "no-such-point" }),
        )
        .await
        .unwrap();
    assert_eq!(preview["preview"]["canRewind"], false);
    assert_eq!(preview["preview"]["error"], "Rewind point not found");
}

#[tokio::test]
async fn test_question_methods_reject_unknown_session() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let calls = [
        (
            methods::QUESTION_RESPOND,
            json!({ "sessionId": "ghost", "toolUseId": "q1", "responses": {} }),
        ),
        (
            methods::QUESTION_SAVE_DRAFT,
            json!({ "sessionId": "ghost", "responses": {} }),
        ),
        (
            methods::QUESTION_CANCEL,
            json!({ "sessionId": "ghost", "toolUseId": "q1" }),
        ),
    ];
    for (method, params) in calls {
        let err = client.request(method, params).await.unwrap_err();
        assert_eq!(error_message(err), "Session not found: ghost", "{method}");
    }
}

#[tokio::test]
async fn test_rewind_conversation_drops_later_messages() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    for (i, content) in ["first", "second"].iter().enumerate() {
        client
            .request(
                methods::MESSAGE_SEND,
                json!({ "sessionId": session.id, "content": content }),
            )
            .await
            .unwrap();
        wait_until_idle(&client, &session.id, 3 * (i as u64 + 1)).await;
    }

    let checkpoints: Value = client
        .request(methods::REWIND_CHECKPOINTS, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    let points = checkpoints["checkpoints"].as_array().unwrap();
    assert_eq!(points.len(), 2);
    let second = points
        .iter()
        .find(|p| p["content"] == "second")
        .unwrap()["uuid"]
        .as_str()
        .unwrap()
        .to_string();

    let executed: Value = client
        .request(
            methods::REWIND_EXECUTE,
            json!({ "sessionId": session.id, "checkpointId": second, "mode": "conversation" }),
        )
        .await
        .unwrap();
    assert_eq!(executed["result"]["success"], true, "{executed}");

    let messages: Vec<StoredMessage> = client
        .request_as(methods::MESSAGE_LIST, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "first");
}

#[tokio::test]
async fn test_pairs_round_trip() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let pair: SessionPair = client
        .request_as(
            methods::PAIR_CREATE,
            json!({
                "roomId": "room-1",
                "roomSessionId": "room-session",
                "managerSessionId": "manager",
                "workerSessionId": "worker",
            }),
        )
        .await
        .unwrap();
    assert_eq!(pair.status, PairStatus::Active);

    let by_session: Option<SessionPair> = client
        .request_as(methods::PAIR_GET_BY_SESSION, json!({ "sessionId": "worker" }))
        .await
        .unwrap();
    assert_eq!(by_session.map(|p| p.id), Some(pair.id.clone()));

    let updated: SessionPair = client
        .request_as(
            methods::PAIR_UPDATE_STATUS,
            json!({ "pairId": pair.id, "status": "idle", "currentTaskId": "task-7" }),
        )
        .await
        .unwrap();
    assert_eq!(updated.status, PairStatus::Idle);
    assert_eq!(updated.current_task_id.as_deref(), Some("task-7"));
    assert!(updated.updated_at > pair.updated_at);

    let listed: Vec<SessionPair> = client
        .request_as(methods::PAIR_LIST, json!({ "roomId": "room-1" }))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let none: Option<SessionPair> = client
        .request_as(methods::PAIR_GET_BY_SESSION, json!({ "sessionId": "other" }))
        .await
        .unwrap();
    assert!(none.is_none());

    let err = client
        .request(methods::PAIR_GET, json!({ "pairId": "missing" }))
        .await
        .unwrap_err();
    assert_eq!(error_code(err), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_file_access_stays_inside_workspace() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    std::fs::create_dir(t.workspace.path().join("src")).unwrap();
    std::fs::write(t.workspace.path().join("src/main.rs"), "fn main() {}\n").unwrap();
    let session = t.create_session(&client).await;

    let file: Value = client
        .request(
            methods::FILE_READ,
            json!({ "sessionId": session.id, "path": "src/main.rs" }),
        )
        .await
        .unwrap();
    assert_eq!(file["content"], "fn main() {}\n");
    assert_eq!(file["path"], "src/main.rs");

    let entries: Value = client
        .request(methods::FILE_LIST, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(entries[0]["name"], "src");
    assert_eq!(entries[0]["isDir"], true);

    let tree: Value = client
        .request(methods::FILE_TREE, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(tree["children"][0]["children"][0]["path"], "src/main.rs");

    let err = client
        .request(
            methods::FILE_READ,
            json!({ "sessionId": session.id, "path": "../../etc/passwd" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error_code(err),
        ErrorCode::BadRequest | ErrorCode::NotFound
    ));
}

#[tokio::test]
async fn test_echo_reaches_global_subscribers() {
    let t = test_daemon().await;
    let caller = t.client("caller").await;
    let watcher = t.client("watcher").await;
    let echoes = record_events(&watcher, events::TEST_ECHO);

    let answer: Value = caller
        .request(methods::TEST_ECHO, json!({ "message": "ping" }))
        .await
        .unwrap();
    assert_eq!(answer["message"], "ping");

    wait_for(|| {
        let done = !echoes.lock().unwrap().is_empty();
        async move { done }
    })
    .await;
    assert_eq!(echoes.lock().unwrap()[0].payload["message"], "ping");
}

#[tokio::test]
async fn test_sessions_deltas_since_snapshot() {
    let t = test_daemon().await;
    let client = t.client("ui").await;

    let snapshot: SessionsSnapshot = client
        .request_as(methods::SESSIONS_SNAPSHOT, json!({}))
        .await
        .unwrap();
    assert!(snapshot.sessions.is_empty());

    let session = t.create_session(&client).await;

    let since = snapshot.timestamp;
    let client_ref = &client;
    wait_for(|| async move {
        let catch_up: DeltaCatchUp = client_ref
            .request_as(methods::SESSIONS_DELTAS, json!({ "since": since }))
            .await
            .unwrap();
        !catch_up.deltas.is_empty()
    })
    .await;

    let catch_up: DeltaCatchUp = client
        .request_as(methods::SESSIONS_DELTAS, json!({ "since": since }))
        .await
        .unwrap();
    assert!(!catch_up.resync);
    assert_eq!(catch_up.deltas[0].added[0].id, session.id);
}

#[tokio::test]
async fn test_context_reports_usage_after_a_turn() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    let session = t.create_session(&client).await;

    client
        .request(
            methods::MESSAGE_SEND,
            json!({ "sessionId": session.id, "content": "count my tokens please" }),
        )
        .await
        .unwrap();
    wait_until_idle(&client, &session.id, 3).await;

    let context: Value = client
        .request(methods::CONTEXT_GET, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert!(context["categories"]["messages"].as_u64().unwrap() > 0);
    assert_eq!(context["totalCapacity"], 200_000);

    let compact: Value = client
        .request(methods::CONTEXT_COMPACT, json!({ "sessionId": session.id }))
        .await
        .unwrap();
    assert_eq!(compact["compacted"], false);
}

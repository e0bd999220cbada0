//! Client-side state reconciliation against a running daemon.

use serde_json::json;
use std::time::Duration;
use tether::state::{Reconciliation, StateChannelClient};
use tether_protocol::channels::{methods, session_channel};
use tether_protocol::now_ms;
use tether_protocol::session::MessageRole;

mod common;
use common::{test_daemon, wait_for, wait_until_idle};

#[tokio::test]
async fn test_first_reconcile_loads_snapshots() {
    let t = test_daemon().await;
    let ui = t.client("ui").await;
    let session = t.create_session(&ui).await;

    let client = StateChannelClient::new(t.client("state").await, Duration::from_secs(300));
    let outcome = client.reconcile(now_ms()).await.unwrap();

    assert_eq!(outcome, Reconciliation::Resynced);
    assert_eq!(client.sessions().len(), 1);
    assert_eq!(client.sessions()[0].id, session.id);
    assert!(client.system().is_some());
    assert!(client.settings().is_some());
    assert!(client.last_sync().is_some());
}

#[tokio::test]
async fn test_recent_sync_catches_up_with_deltas() {
    let t = test_daemon().await;
    let ui = t.client("ui").await;
    let client = StateChannelClient::new(t.client("state").await, Duration::from_secs(300));
    client.reconcile(now_ms()).await.unwrap();

    let session = t.create_session(&ui).await;
    let session_id = session.id.clone();
    let client_ref = &client;
    wait_for(|| {
        let seen = client_ref.session(&session_id).is_some();
        async move { seen }
    })
    .await;

    let outcome = client.reconcile(now_ms()).await.unwrap();
    assert!(matches!(outcome, Reconciliation::CaughtUp { .. }));
    assert_eq!(client.sessions().len(), 1);
}

#[tokio::test]
async fn test_stale_state_is_resynced() {
    let t = test_daemon().await;
    let client = StateChannelClient::new(t.client("state").await, Duration::from_secs(300));
    client.reconcile(now_ms()).await.unwrap();

    let much_later = now_ms() + Duration::from_secs(600).as_millis() as i64;
    let outcome = client.reconcile(much_later).await.unwrap();
    assert_eq!(outcome, Reconciliation::Resynced);
}

#[tokio::test]
async fn test_session_channel_streams_messages() {
    let t = test_daemon().await;
    let ui = t.client("ui").await;
    let session = t.create_session(&ui).await;

    let client = StateChannelClient::new(t.client("state").await, Duration::from_secs(300));
    client.subscribe_optimistic(&session_channel(&session.id));
    client.reconcile(now_ms()).await.unwrap();
    assert!(
        client
            .subscribed_channels()
            .contains(&session_channel(&session.id))
    );

    let channel = session_channel(&session.id);
    let hub = &t.daemon.hub;
    wait_for(|| {
        let joined = hub.rooms().is_member("state", &channel);
        async move { joined }
    })
    .await;

    ui.request(
        methods::MESSAGE_SEND,
        json!({ "sessionId": session.id, "content": "hello there" }),
    )
    .await
    .unwrap();
    wait_until_idle(&ui, &session.id, 3).await;

    let session_id = session.id.clone();
    let client_ref = &client;
    wait_for(|| {
        let count = client_ref.messages(&session_id).len();
        async move { count == 3 }
    })
    .await;
    let messages = client.messages(&session.id);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "hello there");
}

#[tokio::test]
async fn test_catch_up_fetches_messages_missed_while_away() {
    let t = test_daemon().await;
    let ui = t.client("ui").await;
    let session = t.create_session(&ui).await;
    let channel = session_channel(&session.id);

    let client = StateChannelClient::new(t.client("state").await, Duration::from_secs(300));
    client.subscribe_optimistic(&channel);
    client.reconcile(now_ms()).await.unwrap();
    let hub = &t.daemon.hub;
    wait_for(|| {
        let joined = hub.rooms().is_member("state", &channel);
        async move { joined }
    })
    .await;

    ui.request(
        methods::MESSAGE_SEND,
        json!({ "sessionId": session.id, "content": "first" }),
    )
    .await
    .unwrap();
    wait_until_idle(&ui, &session.id, 3).await;
    let session_id = session.id.clone();
    let client_ref = &client;
    wait_for(|| {
        let count = client_ref.messages(&session_id).len();
        async move { count == 3 }
    })
    .await;

    // The client stops receiving the session channel, as if disconnected.
    hub.leave_channel("state", &channel);
    ui.request(
        methods::MESSAGE_SEND,
        json!({ "sessionId": session.id, "content": "while you were away" }),
    )
    .await
    .unwrap();
    wait_until_idle(&ui, &session.id, 6).await;
    assert_eq!(client.messages(&session.id).len(), 3);

    let outcome = client.reconcile(now_ms()).await.unwrap();
    assert!(matches!(outcome, Reconciliation::CaughtUp { .. }));
    let messages = client.messages(&session.id);
    assert_eq!(messages.len(), 6);
    assert!(messages.iter().any(|m| m.content == "while you were away"));
}

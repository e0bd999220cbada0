//! HTTP router and WebSocket transport tests.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tether::hub::{MessageHub, ReconnectPolicy, Transport, WebSocketClientTransport};
use tether_protocol::channels::{events, methods};
use tether_protocol::state::HealthStatus;
use tokio::net::TcpListener;
use tower::ServiceExt;

mod common;
use common::{record_events, test_daemon, wait_for};

#[tokio::test]
async fn test_health_endpoint() {
    let t = test_daemon().await;

    let response = t
        .daemon
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["sessions"]["total"], 0);
}

#[tokio::test]
async fn test_cors_preflight_allows_any_origin() {
    let t = test_daemon().await;

    let response = t
        .daemon
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::OPTIONS)
                .header(header::ORIGIN, "http://localhost:5173")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap()
        .to_string();
    for method in ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"] {
        assert!(methods.contains(method), "{methods} lacks {method}");
    }
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .to_lowercase(),
        "content-type"
    );
}

#[tokio::test]
async fn test_websocket_request_and_broadcast() {
    let t = test_daemon().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = t.daemon.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: Some(3),
        initial_connect_timeout: Duration::from_secs(5),
    };
    let transport =
        WebSocketClientTransport::new("ws", format!("ws://{addr}/ws?sessionId=global"), policy);
    let client = MessageHub::new(Duration::from_secs(5));
    let _ = client.register_transport(transport.clone(), "ws", true);
    let echoes = record_events(&client, events::TEST_ECHO);
    transport.initialize().await.unwrap();

    let health: HealthStatus = client
        .request_as(methods::SYSTEM_HEALTH, json!({}))
        .await
        .unwrap();
    assert_eq!(health.status, "ok");

    // A second, in-process client triggers a broadcast on `global`.
    let other = t.client("other").await;
    other
        .request(methods::TEST_ECHO, json!({ "message": "over the wire" }))
        .await
        .unwrap();
    wait_for(|| {
        let done = !echoes.lock().unwrap().is_empty();
        async move { done }
    })
    .await;
    assert_eq!(echoes.lock().unwrap()[0].payload["message"], "over the wire");

    transport.close().await.unwrap();
    t.daemon.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_rejects_further_requests() {
    let t = test_daemon().await;
    let client = t.client("ui").await;
    t.create_session(&client).await;

    t.daemon.cleanup().await;
    assert!(t.daemon.hub.is_closed());
    assert_eq!(t.daemon.sessions.active_sessions(), 0);

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.request_with_timeout(
            methods::SYSTEM_HEALTH,
            json!({}),
            Duration::from_millis(200),
        ),
    )
    .await
    .unwrap();
    assert!(result.is_err());
}

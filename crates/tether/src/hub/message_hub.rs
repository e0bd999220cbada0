//! Typed RPC and pub/sub router over one or more transports.

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tether_protocol::channels::{GLOBAL_CHANNEL, methods};
use tether_protocol::{ErrorCode, HubErrorPayload, HubMessage, MessageKind};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::HubError;
use super::room::RoomManager;
use super::subscription::{Observers, Unsubscribe};
use super::transport::{ConnectionId, IncomingMessage, Transport, TransportEvent};
use crate::rpc::error::RpcError;

/// Default window for a request to be answered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Who sent a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub connection_id: ConnectionId,
    pub transport: String,
}

pub type RequestHandler =
    Arc<dyn Fn(Value, RequestContext) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(&HubMessage) + Send + Sync>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value, HubError>>,
}

struct RegisteredTransport {
    transport: Arc<dyn Transport>,
    hooks: Vec<Unsubscribe>,
}

struct HubInner {
    transports: DashMap<String, RegisteredTransport>,
    primary: Mutex<Option<String>>,
    /// connection id -> name of the transport that owns it
    connections: DashMap<ConnectionId, String>,
    rooms: RoomManager,
    handlers: DashMap<String, RequestHandler>,
    event_handlers: DashMap<String, Arc<Observers<HubMessage>>>,
    connection_observers: Observers<TransportEvent>,
    pending: DashMap<String, PendingCall>,
    request_timeout: Duration,
    closed: AtomicBool,
}

/// RPC + pub/sub hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

impl MessageHub {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                transports: DashMap::new(),
                primary: Mutex::new(None),
                connections: DashMap::new(),
                rooms: RoomManager::new(),
                handlers: DashMap::new(),
                event_handlers: DashMap::new(),
                connection_observers: Observers::new(),
                pending: DashMap::new(),
                request_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a transport. The first transport, or any registered with
    /// `is_primary`, becomes the target of outbound requests.
    pub fn register_transport(
        &self,
        transport: Arc<dyn Transport>,
        name: &str,
        is_primary: bool,
    ) -> Unsubscribe {
        let name = name.to_string();
        let weak = Arc::downgrade(&self.inner);

        let message_hook = {
            let weak = Weak::clone(&weak);
            let transport_name = name.clone();
            transport.on_message(Arc::new(move |incoming: &IncomingMessage| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_incoming(&transport_name, incoming);
                }
            }))
        };
        let connection_hook = {
            let weak = Weak::clone(&weak);
            let transport_name = name.clone();
            transport.on_connection_change(Arc::new(move |event: &TransportEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_connection_event(&transport_name, event);
                }
            }))
        };

        // Peers that connected before registration.
        for connection_id in transport.connections() {
            self.inner
                .handle_connection_event(&name, &TransportEvent::PeerConnected(connection_id));
        }

        if let Some(previous) = self.inner.transports.insert(
            name.clone(),
            RegisteredTransport {
                transport,
                hooks: vec![message_hook, connection_hook],
            },
        ) {
            warn!("Transport '{}' registered twice; replacing", name);
            previous.hooks.into_iter().for_each(Unsubscribe::unsubscribe);
        }

        {
            let mut primary = self.inner.primary.lock().unwrap_or_else(PoisonError::into_inner);
            if is_primary || primary.is_none() {
                *primary = Some(name.clone());
            }
        }
        info!("Registered transport '{}' (primary: {})", name, is_primary);

        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unregister_transport(&name);
            }
        })
    }

    /// Register a raw handler. Replaces any previous handler for `method`.
    pub fn on_request(&self, method: &str, handler: RequestHandler) -> Unsubscribe {
        if self
            .inner
            .handlers
            .insert(method.to_string(), handler)
            .is_some()
        {
            debug!("Replaced handler for '{}'", method);
        }
        let weak = Arc::downgrade(&self.inner);
        let method = method.to_string();
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.remove(&method);
            }
        })
    }

    /// Register a typed handler. The payload is deserialized into `P`
    /// (a missing payload is treated as `{}`) and the result serialized back.
    pub fn handle<P, R, F, Fut>(&self, method: &str, handler: F) -> Unsubscribe
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request(
            method,
            Arc::new(move |payload: Value, ctx: RequestContext| {
                let handler = Arc::clone(&handler);
                async move {
                    let params = parse_params::<P>(payload)?;
                    let result = handler(params, ctx).await?;
                    serde_json::to_value(result)
                        .map_err(|e| RpcError::internal(format!("serializing response: {e}")))
                }
                .boxed()
            }),
        )
    }

    /// Subscribe to events received from peers.
    pub fn on_event(&self, name: &str, handler: EventHandler) -> Unsubscribe {
        self.inner
            .event_handlers
            .entry(name.to_string())
            .or_default()
            .subscribe(handler)
    }

    /// Observe peer connect/disconnect and transport state changes.
    pub fn on_connection_change(
        &self,
        handler: Arc<dyn Fn(&TransportEvent) + Send + Sync>,
    ) -> Unsubscribe {
        self.inner.connection_observers.subscribe(handler)
    }

    /// Send a request through the primary transport and wait for its response.
    pub async fn request(&self, method: &str, payload: Value) -> Result<Value, HubError> {
        self.request_with_timeout(method, payload, self.inner.request_timeout)
            .await
    }

    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: Value,
    ) -> Result<T, HubError> {
        let value = self.request(method, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, HubError> {
        let transport = self.primary_transport()?;
        let request = HubMessage::request(Uuid::new_v4().to_string(), method, payload);
        self.inner
            .send_request(request, timeout, |msg| async move { transport.send(&msg).await })
            .await
    }

    /// Send a request to one connection.
    pub async fn request_to(
        &self,
        connection_id: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value, HubError> {
        let transport = self
            .inner
            .transport_for(connection_id)
            .ok_or(HubError::NoTransport)?;
        let request = HubMessage::request(Uuid::new_v4().to_string(), method, payload);
        let connection_id = connection_id.to_string();
        self.inner
            .send_request(request, self.inner.request_timeout, |msg| async move {
                transport.send_to(&connection_id, &msg).await
            })
            .await
    }

    /// Broadcast an event to every connection that joined `channel`
    /// (`global` when omitted). Returns the number of connections reached.
    pub async fn event(&self, name: &str, payload: Value, channel: Option<&str>) -> usize {
        let channel = channel.unwrap_or(GLOBAL_CHANNEL);
        let message = HubMessage::event(Uuid::new_v4().to_string(), name, payload, channel);
        self.publish(&message).await
    }

    pub async fn event_typed<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        channel: Option<&str>,
    ) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.event(name, value, channel).await,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", name, e);
                0
            }
        }
    }

    async fn publish(&self, message: &HubMessage) -> usize {
        let channel = message.channel.as_deref().unwrap_or(GLOBAL_CHANNEL);
        let mut delivered = 0;
        for connection_id in self.inner.rooms.members(channel) {
            let Some(transport) = self.inner.transport_for(&connection_id) else {
                continue;
            };
            match transport.send_to(&connection_id, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to deliver {} to connection {}: {}",
                    message.method, connection_id, e
                ),
            }
        }
        delivered
    }

    pub fn join_channel(&self, connection_id: &str, channel: &str) -> bool {
        self.inner.rooms.join(connection_id, channel)
    }

    pub fn leave_channel(&self, connection_id: &str, channel: &str) -> bool {
        self.inner.rooms.leave(connection_id, channel)
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    pub fn get_pending_call_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.inner.handlers.contains_key(method)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Reject every pending call, detach and close all transports and drop
    /// all handlers.
    pub async fn cleanup(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let pending: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in pending {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                debug!("Rejecting pending call {} ({})", id, call.method);
                let _ = call.tx.send(Err(HubError::Closed));
            }
        }

        let names: Vec<String> = self
            .inner
            .transports
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some(transport) = self.inner.unregister_transport(&name)
                && let Err(e) = transport.close().await
            {
                warn!("Failed to close transport '{}': {}", name, e);
            }
        }

        self.inner.rooms.clear();
        self.inner.handlers.clear();
        self.inner.event_handlers.clear();
        self.inner.connection_observers.clear();
        info!("Message hub cleaned up");
    }

    fn primary_transport(&self) -> Result<Arc<dyn Transport>, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let primary = self
            .inner
            .primary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HubError::NoTransport)?;
        self.inner
            .transports
            .get(&primary)
            .map(|entry| Arc::clone(&entry.transport))
            .ok_or(HubError::NoTransport)
    }
}

impl HubInner {
    async fn send_request<F, Fut>(
        &self,
        request: HubMessage,
        timeout: Duration,
        send: F,
    ) -> Result<Value, HubError>
    where
        F: FnOnce(HubMessage) -> Fut,
        Fut: Future<Output = Result<(), HubError>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }

        let id = request.id.clone();
        let method = request.method.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingCall {
                method: method.clone(),
                tx,
            },
        );

        if let Err(e) = send(request).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HubError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(HubError::Timeout {
                    method,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn handle_incoming(self: &Arc<Self>, transport_name: &str, incoming: &IncomingMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let message = &incoming.message;
        match message.kind {
            MessageKind::Response => self.resolve_pending(message),
            MessageKind::Event => {
                let observers = self
                    .event_handlers
                    .get(&message.method)
                    .map(|entry| Arc::clone(entry.value()));
                if let Some(observers) = observers {
                    observers.emit(message);
                }
            }
            MessageKind::Request => {
                let ctx = RequestContext {
                    request_id: message.id.clone(),
                    method: message.method.clone(),
                    connection_id: incoming.connection_id.clone(),
                    transport: transport_name.to_string(),
                };
                let inner = Arc::clone(self);
                let request = message.clone();
                tokio::spawn(async move {
                    let response = inner.run_request(&request, ctx.clone()).await;
                    inner.reply(&ctx, &response).await;
                });
            }
        }
    }

    fn resolve_pending(&self, response: &HubMessage) {
        let Some((_, call)) = self.pending.remove(&response.id) else {
            debug!(
                "Dropping response for unknown request {} ({})",
                response.id, response.method
            );
            return;
        };
        let result = match &response.error {
            Some(error) => Err(HubError::Remote {
                code: error.code,
                message: error.message.clone(),
            }),
            None => Ok(response.payload.clone()),
        };
        let _ = call.tx.send(result);
    }

    async fn run_request(self: &Arc<Self>, request: &HubMessage, ctx: RequestContext) -> HubMessage {
        match request.method.as_str() {
            methods::CHANNEL_JOIN | methods::CHANNEL_LEAVE => {
                return self.run_channel_request(request, &ctx);
            }
            _ => {}
        }

        let Some(handler) = self
            .handlers
            .get(&request.method)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return HubMessage::error_to(
                request,
                HubErrorPayload::new(
                    ErrorCode::MethodNotFound,
                    format!("Unknown method: {}", request.method),
                ),
            );
        };

        // Run on its own task so a panicking handler becomes an error response.
        let task = tokio::spawn(handler(request.payload.clone(), ctx));
        match task.await {
            Ok(Ok(payload)) => HubMessage::response_to(request, payload),
            Ok(Err(err)) => HubMessage::error_to(request, err.to_payload(&request.method)),
            Err(join_err) => {
                warn!("Handler for {} failed: {}", request.method, join_err);
                HubMessage::error_to(
                    request,
                    HubErrorPayload::new(
                        ErrorCode::Internal,
                        format!("Handler for {} failed", request.method),
                    ),
                )
            }
        }
    }

    fn run_channel_request(&self, request: &HubMessage, ctx: &RequestContext) -> HubMessage {
        let Some(channel) = request.payload.get("channel").and_then(Value::as_str) else {
            return HubMessage::error_to(
                request,
                HubErrorPayload::new(ErrorCode::BadRequest, "channel must be a string"),
            );
        };
        let joined = if request.method == methods::CHANNEL_JOIN {
            self.rooms.join(&ctx.connection_id, channel);
            true
        } else {
            self.rooms.leave(&ctx.connection_id, channel);
            false
        };
        debug!(
            "Connection {} {} {}",
            ctx.connection_id,
            if joined { "joined" } else { "left" },
            channel
        );
        HubMessage::response_to(request, json!({ "channel": channel, "joined": joined }))
    }

    async fn reply(&self, ctx: &RequestContext, response: &HubMessage) {
        let transport = self
            .transports
            .get(&ctx.transport)
            .map(|entry| Arc::clone(&entry.transport));
        let Some(transport) = transport else {
            debug!(
                "Transport '{}' gone before response to {}",
                ctx.transport, ctx.method
            );
            return;
        };
        if let Err(e) = transport.send_to(&ctx.connection_id, response).await {
            warn!(
                "Failed to send response for {} to {}: {}",
                ctx.method, ctx.connection_id, e
            );
        }
    }

    fn handle_connection_event(&self, transport_name: &str, event: &TransportEvent) {
        match event {
            TransportEvent::PeerConnected(connection_id) => {
                self.connections
                    .insert(connection_id.clone(), transport_name.to_string());
                self.rooms.join(connection_id, GLOBAL_CHANNEL);
                debug!("Connection {} opened on '{}'", connection_id, transport_name);
            }
            TransportEvent::PeerDisconnected(connection_id) => {
                self.rooms.leave_all(connection_id);
                self.connections.remove(connection_id);
                debug!("Connection {} closed on '{}'", connection_id, transport_name);
            }
            TransportEvent::StateChanged(_) => {}
        }
        self.connection_observers.emit(event);
    }

    fn transport_for(&self, connection_id: &str) -> Option<Arc<dyn Transport>> {
        let name = self.connections.get(connection_id)?.value().clone();
        self.transports
            .get(&name)
            .map(|entry| Arc::clone(&entry.transport))
    }

    fn unregister_transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        let (_, registered) = self.transports.remove(name)?;
        registered
            .hooks
            .into_iter()
            .for_each(Unsubscribe::unsubscribe);

        let owned: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value() == name)
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in owned {
            self.rooms.leave_all(&connection_id);
            self.connections.remove(&connection_id);
        }

        let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
        if primary.as_deref() == Some(name) {
            *primary = self
                .transports
                .iter()
                .next()
                .map(|entry| entry.key().clone());
        }
        info!("Unregistered transport '{}'", name);
        Some(registered.transport)
    }
}

fn parse_params<P: DeserializeOwned>(payload: Value) -> Result<P, RpcError> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|e| RpcError::bad_request(format!("Invalid params: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::in_process::InProcessTransport;
    use serde::Deserialize;

    async fn connected_pair(timeout: Duration) -> (MessageHub, MessageHub) {
        let (server_end, client_end) = InProcessTransport::pair("daemon", "client");
        let server = MessageHub::new(timeout);
        let client = MessageHub::new(timeout);
        let _ = server.register_transport(server_end.clone(), "in-process", true);
        let _ = client.register_transport(client_end.clone(), "in-process", true);
        server_end.initialize().await.unwrap();
        client_end.initialize().await.unwrap();
        (server, client)
    }

    #[derive(Deserialize)]
    struct EchoParams {
        #[serde(default)]
        message: Option<String>,
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let _h = server.handle("test.echo", |params: EchoParams, _ctx| async move {
            Ok(json!({ "message": params.message.unwrap_or_else(|| "echo".into()) }))
        });

        let result = client.request("test.echo", json!({"message": "hi"})).await.unwrap();
        assert_eq!(result["message"], "hi");
        let result = client.request("test.echo", Value::Null).await.unwrap();
        assert_eq!(result["message"], "echo");
        assert_eq!(client.get_pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (_server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let err = client.request("nope.nothing", json!({})).await.unwrap_err();
        match err {
            HubError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::MethodNotFound);
                assert!(message.contains("nope.nothing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_error_responses() {
        let (server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let _a = server.handle("fails", |_: Value, _ctx| async move {
            Err::<Value, _>(RpcError::not_found("Session not found: x"))
        });
        let _b = server.handle("panics", |_: Value, _ctx| async move {
            if true {
                panic!("boom");
            }
            Ok(Value::Null)
        });

        let err = client.request("fails", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = client.request("panics", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        // The hub keeps serving after a panic.
        let err = client.request("fails", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_call() {
        let (server, client) = connected_pair(Duration::from_millis(50)).await;
        let _h = server.handle("slow", |_: Value, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });

        let err = client.request("slow", json!({})).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.get_pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate_by_id() {
        let (server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let _h = server.handle("delay", |params: Value, _ctx| async move {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "ms": ms }))
        });

        let (slow, fast) = tokio::join!(
            client.request("delay", json!({"ms": 80})),
            client.request("delay", json!({"ms": 5})),
        );
        assert_eq!(slow.unwrap()["ms"], 80);
        assert_eq!(fast.unwrap()["ms"], 5);
    }

    #[tokio::test]
    async fn test_events_reach_only_channel_members() {
        let (server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = client.on_event(
            "session.status",
            Arc::new(move |msg: &HubMessage| {
                let _ = tx.send(msg.clone());
            }),
        );

        assert_eq!(
            server.event("session.status", json!({"n": 1}), Some("session:a")).await,
            0
        );
        client
            .request(methods::CHANNEL_JOIN, json!({"channel": "session:a"}))
            .await
            .unwrap();
        assert_eq!(
            server.event("session.status", json!({"n": 2}), Some("session:a")).await,
            1
        );

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload["n"], 2);
        assert_eq!(msg.channel.as_deref(), Some("session:a"));
    }

    #[tokio::test]
    async fn test_channel_join_requires_string() {
        let (_server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let err = client
            .request(methods::CHANNEL_JOIN, json!({"channel": 5}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_pending_calls() {
        let (server, client) = connected_pair(DEFAULT_REQUEST_TIMEOUT).await;
        let _h = server.handle("hang", |_: Value, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request("hang", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.get_pending_call_count(), 1);

        client.cleanup().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HubError::Closed)));
        assert!(matches!(
            client.request("hang", json!({})).await,
            Err(HubError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unregister_transport_drops_its_connections() {
        let (server_end, _client_end) = InProcessTransport::pair("daemon", "client");
        server_end.initialize().await.unwrap();
        let hub = MessageHub::new(DEFAULT_REQUEST_TIMEOUT);

        let registration = hub.register_transport(server_end, "in-process", false);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.rooms().is_member("client", GLOBAL_CHANNEL));

        registration.unsubscribe();
        assert_eq!(hub.connection_count(), 0);
        assert!(matches!(
            hub.request("x", json!({})).await,
            Err(HubError::NoTransport)
        ));
    }
}

//! The `HubMessage` envelope.
//!
//! Every frame on the wire is one JSON-encoded `HubMessage`. Requests carry a
//! correlation `id`; the matching response reuses that `id`. Events carry the
//! event name in `method` and the broadcast channel in `channel`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_ms;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// Machine-readable error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    BadRequest,
    Conflict,
    Timeout,
    MethodNotFound,
    Unavailable,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL_ERROR",
        };
        f.write_str(code)
    }
}

/// Error attached to a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl HubErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Wire envelope for requests, responses and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    /// Correlation id. Responses reuse the id of their request.
    pub id: String,
    pub kind: MessageKind,
    /// RPC method for requests/responses, event name for events.
    pub method: String,
    /// Broadcast channel (events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HubErrorPayload>,
    /// Unix ms at creation.
    #[serde(default)]
    pub timestamp: i64,
}

impl HubMessage {
    pub fn request(id: impl Into<String>, method: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Request,
            method: method.into(),
            channel: None,
            payload,
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Successful response to `request`.
    pub fn response_to(request: &HubMessage, payload: Value) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageKind::Response,
            method: request.method.clone(),
            channel: None,
            payload,
            error: None,
            timestamp: now_ms(),
        }
    }

    /// Failed response to `request`.
    pub fn error_to(request: &HubMessage, error: HubErrorPayload) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageKind::Response,
            method: request.method.clone(),
            channel: None,
            payload: Value::Null,
            error: Some(error),
            timestamp: now_ms(),
        }
    }

    pub fn event(
        id: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Event,
            method: name.into(),
            channel: Some(channel.into()),
            payload,
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let msg = HubMessage::request("req-1", "system.health", json!({}));
        let parsed: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(parsed["kind"], "request");
        assert_eq!(parsed["method"], "system.health");
        assert_eq!(parsed["id"], "req-1");
        assert!(parsed.get("channel").is_none());
        assert!(parsed.get("error").is_none());
    }

    #[test]
    fn test_error_response_reuses_request_id() {
        let req = HubMessage::request("req-7", "message.list", json!({"sessionId": "x"}));
        let resp = HubMessage::error_to(
            &req,
            HubErrorPayload::new(ErrorCode::NotFound, "Session not found"),
        );

        assert_eq!(resp.id, "req-7");
        assert!(resp.is_response());
        let parsed: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["error"]["code"], "NOT_FOUND");
        assert_eq!(parsed["error"]["message"], "Session not found");
    }

    #[test]
    fn test_event_parses_without_optional_fields() {
        let raw = r#"{"id":"e1","kind":"event","method":"test.echo","channel":"global"}"#;
        let msg: HubMessage = serde_json::from_str(raw).unwrap();

        assert!(msg.is_event());
        assert_eq!(msg.channel.as_deref(), Some("global"));
        assert_eq!(msg.payload, Value::Null);
        assert_eq!(msg.timestamp, 0);
    }
}

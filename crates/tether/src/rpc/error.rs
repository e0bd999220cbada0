//! RPC error handling with structured wire errors.

use tether_protocol::{ErrorCode, HubErrorPayload};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::hub::HubError;

/// Error returned by RPC handlers; becomes the `error` of the response.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    MethodNotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Categorize an anyhow error by its message.
    ///
    /// Patterns recognized:
    /// - "not found" -> NotFound
    /// - "already exists" / "already running" -> Conflict
    /// - "invalid" / "must be" / "cannot" / "does not exist" -> BadRequest
    /// - "timed out" -> Timeout
    /// - "unavailable" / "closed" -> Unavailable
    /// - Default -> Internal
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if let Some(hub_err) = err.downcast_ref::<HubError>() {
            return Self::from_hub(hub_err);
        }

        // `{:#}` keeps the context chain, e.g. "Failed to create worktree: <git stderr>".
        let msg = format!("{err:#}");
        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("not found") {
            RpcError::NotFound(msg)
        } else if msg_lower.contains("already exists") || msg_lower.contains("already running") {
            RpcError::Conflict(msg)
        } else if msg_lower.contains("invalid")
            || msg_lower.contains("must be")
            || msg_lower.contains("cannot")
            || msg_lower.contains("does not exist")
        {
            RpcError::BadRequest(msg)
        } else if msg_lower.contains("timed out") {
            RpcError::Timeout(msg)
        } else if msg_lower.contains("unavailable") || msg_lower.contains("closed") {
            RpcError::Unavailable(msg)
        } else {
            RpcError::Internal(msg)
        }
    }

    fn from_hub(err: &HubError) -> Self {
        let msg = err.to_string();
        match err.code() {
            ErrorCode::NotFound => RpcError::NotFound(msg),
            ErrorCode::BadRequest => RpcError::BadRequest(msg),
            ErrorCode::Conflict => RpcError::Conflict(msg),
            ErrorCode::Timeout => RpcError::Timeout(msg),
            ErrorCode::MethodNotFound => RpcError::MethodNotFound(msg),
            ErrorCode::Unavailable => RpcError::Unavailable(msg),
            ErrorCode::Internal => RpcError::Internal(msg),
        }
    }

    /// Wire form of the error, logged at a level matching its severity.
    pub fn to_payload(&self, method: &str) -> HubErrorPayload {
        let code = self.code();
        let message = self.to_string();
        match self {
            RpcError::Internal(_) => error!(%method, error_code = %code, %message, "RPC error"),
            RpcError::Unavailable(_) | RpcError::Timeout(_) => {
                warn!(%method, error_code = %code, %message, "RPC unavailable")
            }
            _ => debug!(%method, error_code = %code, %message, "RPC client error"),
        }
        HubErrorPayload::new(code, message)
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

impl From<HubError> for RpcError {
    fn from(err: HubError) -> Self {
        Self::from_hub(&err)
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

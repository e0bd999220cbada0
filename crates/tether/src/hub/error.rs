use tether_protocol::ErrorCode;
use thiserror::Error;

/// Failures of hub requests and transports.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The peer answered with an error response.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no transport registered")]
    NoTransport,

    #[error("hub not initialized")]
    NotInitialized,

    #[error("hub closed")]
    Closed,

    #[error("invalid message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HubError::Timeout { .. })
    }

    /// Wire code for this error when it is relayed to another peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::Timeout { .. } => ErrorCode::Timeout,
            HubError::Remote { code, .. } => *code,
            HubError::Serialization(_) => ErrorCode::BadRequest,
            HubError::NoTransport | HubError::NotInitialized | HubError::Closed => {
                ErrorCode::Unavailable
            }
            HubError::Transport(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InProcessHubError {
    #[error("in-process hub must be initialized before use")]
    NotInitialized,

    #[error("in-process hub closed")]
    Closed,
}

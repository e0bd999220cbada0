//! Manager/worker session pairs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Active,
    Idle,
    Crashed,
    Completed,
}

impl PairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairStatus::Active => "active",
            PairStatus::Idle => "idle",
            PairStatus::Crashed => "crashed",
            PairStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for PairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PairStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PairStatus::Active),
            "idle" => Ok(PairStatus::Idle),
            "crashed" => Ok(PairStatus::Crashed),
            "completed" => Ok(PairStatus::Completed),
            _ => Err(format!("invalid pair status: {s}")),
        }
    }
}

/// Links a manager-role session to a worker-role session within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPair {
    pub id: String,
    pub room_id: String,
    pub room_session_id: String,
    pub manager_session_id: String,
    pub worker_session_id: String,
    pub status: PairStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    /// Unix ms.
    pub created_at: i64,
    /// Unix ms. Strictly increases on every update.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePairRequest {
    pub room_id: String,
    pub room_session_id: String,
    pub manager_session_id: String,
    pub worker_session_id: String,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

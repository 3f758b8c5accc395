//! Presence statuses and the real-time wire messages.

use serde::{Deserialize, Serialize};

/// A user's real-time status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Available,
    Busy,
    Absent,
    Offline,
}

impl OnlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::Available => "available",
            OnlineStatus::Busy => "busy",
            OnlineStatus::Absent => "absent",
            OnlineStatus::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::parse(s).unwrap_or(OnlineStatus::Available)
    }

    /// Strict parse, `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(OnlineStatus::Available),
            "busy" => Some(OnlineStatus::Busy),
            "absent" => Some(OnlineStatus::Absent),
            "offline" => Some(OnlineStatus::Offline),
            _ => None,
        }
    }
}

/// Presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: i64,
    pub status: OnlineStatus,
}

/// Messages sent from server to client. Named in camelCase like the
/// identity payloads of the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Connection established
    Connected { user_id: i64, status: OnlineStatus },
    /// A visible peer changed status
    Status { user_id: i64, status: OnlineStatus },
    /// Statuses of all visible peers currently online
    OnlineUsers { users: Vec<UserStatus> },
    /// Keepalive
    Ping,
    Error { message: String },
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    SetStatus { status: OnlineStatus },
}

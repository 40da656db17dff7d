//! Notifications emitted toward the UI.
//!
//! Every variant carries the UI-assigned session id. Serialized as one JSON
//! object per notification with an `event` discriminator, so a bridge can write
//! them straight out as NDJSON.

use serde::{Deserialize, Serialize};

/// A notification emitted by the supervisor toward the UI boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum BoundaryEvent {
    /// The agent process was spawned.
    #[serde(rename = "session:started")]
    SessionStarted {
        session_id: String,
        /// Fresh correlation id generated for this spawn.
        spawn_id: String,
        pid: Option<u32>,
    },

    /// A decoded protocol record, forwarded verbatim.
    #[serde(rename = "agent")]
    Agent {
        session_id: String,
        payload: serde_json::Value,
    },

    /// A stdout line that failed structured decoding.
    #[serde(rename = "raw")]
    Raw { session_id: String, text: String },

    /// Diagnostic text from the agent's error stream.
    #[serde(rename = "stderr")]
    Stderr { session_id: String, text: String },

    /// A denied tool call is waiting on a user decision.
    #[serde(rename = "permission_request")]
    PermissionRequest {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// The agent process closed.
    #[serde(rename = "session:ended")]
    SessionEnded {
        session_id: String,
        exit_code: Option<i32>,
    },

    /// The agent process failed to start or crashed.
    #[serde(rename = "session:error")]
    SessionError { session_id: String, message: String },
}

impl BoundaryEvent {
    /// Returns the session id this notification belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::Agent { session_id, .. }
            | Self::Raw { session_id, .. }
            | Self::Stderr { session_id, .. }
            | Self::PermissionRequest { session_id, .. }
            | Self::SessionEnded { session_id, .. }
            | Self::SessionError { session_id, .. } => session_id,
        }
    }

    /// True for notifications after which the session no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionEnded { .. } | Self::SessionError { .. }
        )
    }
}

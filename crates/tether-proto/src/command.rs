//! Operations accepted from the UI boundary.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Session-level policy handed to the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// The agent skips every permission check.
    #[serde(alias = "bypassPermissions")]
    Bypass,
    /// The agent denies risky tools and Tether mediates the denial.
    #[default]
    #[serde(alias = "default")]
    Supervised,
    /// Read-only planning.
    Plan,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Supervised => "supervised",
            Self::Plan => "plan",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown permission mode: {0} (expected bypass, supervised or plan)")]
pub struct ParseModeError(String);

impl FromStr for PermissionMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bypass" | "bypassPermissions" => Ok(Self::Bypass),
            "supervised" | "default" => Ok(Self::Supervised),
            "plan" => Ok(Self::Plan),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// The user's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    #[serde(alias = "once")]
    AllowOnce,
    #[serde(alias = "always")]
    AllowAlways,
    Deny,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown permission decision: {0} (expected allow_once, allow_always or deny)")]
pub struct ParseDecisionError(String);

impl FromStr for PermissionDecision {
    type Err = ParseDecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow_once" | "allow-once" | "once" => Ok(Self::AllowOnce),
            "allow_always" | "allow-always" | "always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            other => Err(ParseDecisionError(other.to_string())),
        }
    }
}

/// An inline image sent alongside a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl ImageAttachment {
    /// Encodes raw image bytes.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Best-effort media type from a file extension.
    pub fn media_type_for_extension(ext: &str) -> Option<&'static str> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "gif" => Some("image/gif"),
            "webp" => Some("image/webp"),
            _ => None,
        }
    }

    /// The content block the agent's stream-json input expects.
    pub fn to_content_block(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": self.media_type,
                "data": self.data,
            }
        })
    }
}

/// Options for starting a session. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub permission_mode: Option<PermissionMode>,
    /// First user turn, sent as soon as the process is up.
    pub prompt: Option<String>,
    /// Agent-side conversation id to resume.
    pub resume_id: Option<String>,
    /// Resume from the stored id when `resume_id` is unset.
    pub continue_last: bool,
    pub images: Vec<ImageAttachment>,
    pub append_system_prompt: Option<String>,
    pub mcp_config: Option<PathBuf>,
}

/// One inbound operation from the UI, as read by the stdio bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UiCommand {
    Start {
        session_id: String,
        #[serde(flatten)]
        options: StartOptions,
    },
    Send {
        session_id: String,
        text: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },
    Respond {
        session_id: String,
        decision: PermissionDecision,
    },
    Abort {
        session_id: String,
    },
}

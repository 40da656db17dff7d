//! Decoding of the agent's `--output-format stream-json` records.
//!
//! Each stdout line is one JSON object whose `type` field names the record
//! kind. Decoding never fails: a line that is not a JSON object comes back as
//! [`DecodedEvent::Raw`] carrying the original text, so one bad line can't
//! stall the stream.
//!
//! The full record is kept as a [`serde_json::Value`] because it is forwarded
//! to the UI verbatim. Typed views over the content blocks are extracted on
//! demand, block by block, so an unknown or malformed block only drops itself.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_proto::ImageAttachment;

use crate::text::truncate_with_ellipsis;

/// Record kind, taken from the `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Session init and other agent-side lifecycle records.
    System,
    /// Assistant turn: text and tool invocations.
    Assistant,
    /// User turn: tool results (and replayed user input).
    User,
    /// Final record of a turn with stats.
    Result,
    /// Any other `type`, or none at all.
    Other(String),
}

impl EventKind {
    fn from_type(kind: Option<&str>) -> Self {
        match kind {
            Some("system") => Self::System,
            Some("assistant") => Self::Assistant,
            Some("user") => Self::User,
            Some("result") => Self::Result,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other(String::new()),
        }
    }
}

/// A structured record from the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    pub kind: EventKind,
    pub payload: Value,
}

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Protocol(ProtocolEvent),
    /// The line was not a JSON object; the original text, unmodified.
    Raw(String),
}

/// Parses a single stdout line.
pub fn decode(line: &str) -> DecodedEvent {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(payload) if payload.is_object() => {
            let kind = EventKind::from_type(payload.get("type").and_then(Value::as_str));
            DecodedEvent::Protocol(ProtocolEvent { kind, payload })
        }
        Ok(_) => DecodedEvent::Raw(line.to_string()),
        Err(e) => {
            tracing::debug!(
                "Treating non-JSON line as raw output: {} (error: {})",
                truncate_with_ellipsis(line.trim(), 100),
                e
            );
            DecodedEvent::Raw(line.to_string())
        }
    }
}

/// Content blocks in assistant messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    /// Tool invocation. `id` and `name` are optional here so a block missing
    /// either can be skipped rather than rejected.
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Content blocks in user messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

impl UserBlock {
    /// Textual content of a tool result.
    ///
    /// A plain string is textual, and so is an array made only of `text`
    /// blocks (joined with newlines). Anything else has no text.
    pub fn text(&self) -> Option<String> {
        let Self::ToolResult { content, .. } = self else {
            return None;
        };
        match content {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    (item.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| item.get("text").and_then(Value::as_str))
                        .flatten()
                })
                .collect::<Option<Vec<_>>>()
                .map(|parts| parts.join("\n")),
            _ => None,
        }
    }
}

impl ProtocolEvent {
    /// Typed assistant content blocks; empty for other kinds.
    pub fn assistant_blocks(&self) -> Vec<AssistantBlock> {
        if self.kind != EventKind::Assistant {
            return Vec::new();
        }
        content_blocks(&self.payload)
    }

    /// Typed user content blocks; empty for other kinds.
    pub fn user_blocks(&self) -> Vec<UserBlock> {
        if self.kind != EventKind::User {
            return Vec::new();
        }
        content_blocks(&self.payload)
    }

    /// The agent-side conversation id announced by a `system` init record.
    pub fn agent_session_id(&self) -> Option<&str> {
        if self.kind != EventKind::System {
            return None;
        }
        self.payload
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

fn content_blocks<T: DeserializeOwned>(payload: &Value) -> Vec<T> {
    payload
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| serde_json::from_value(block.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Builds one stream-json user turn for the agent's stdin.
///
/// Images go first, followed by the text block.
pub fn user_turn(text: &str, images: &[ImageAttachment]) -> Value {
    let mut content: Vec<Value> = images.iter().map(ImageAttachment::to_content_block).collect();
    content.push(serde_json::json!({ "type": "text", "text": text }));

    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        }
    })
}

/// Serializes a user turn as one newline-terminated record.
pub fn user_turn_line(text: &str, images: &[ImageAttachment]) -> String {
    let mut line = user_turn(text, images).to_string();
    line.push('\n');
    line
}

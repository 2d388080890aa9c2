//! Messages exchanged over the broker session.
//!
//! Wire format is a flat JSON object:
//! ```text
//! {"id": "...", "device_id": "lab-01", "content": "hello",
//!  "message_type": "general", "timestamp": "2025-01-01T00:00:00Z", ...}
//! ```
//! Unknown fields are carried through untouched in [`Message::extra`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of message, used by the response policy's allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    General,
    Presence,
    Response,
    Command,
    Telemetry,
    Status,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Presence => "presence",
            Self::Response => "response",
            Self::Command => "command",
            Self::Telemetry => "telemetry",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body: plain text or an arbitrary JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// Text view used for filtering and prompting. Structured payloads
    /// render as compact JSON.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Structured(value) => Cow::Owned(value.to_string()),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Unit exchanged over the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque token, unique per originating process.
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(rename = "device_id", alias = "sender")]
    pub sender_id: String,
    pub content: Content,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Pass-through fields this agent does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        content: impl Into<Content>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: new_message_id(),
            sender_id: sender_id.into(),
            content: content.into(),
            message_type,
            timestamp: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Builds outbound messages for one device, keeping timestamps
/// non-decreasing even if the wall clock steps backwards.
#[derive(Debug)]
pub struct MessageFactory {
    sender_id: String,
    last: Mutex<DateTime<Utc>>,
}

impl MessageFactory {
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn create(&self, content: impl Into<Content>, message_type: MessageType) -> Message {
        let mut message = Message::new(self.sender_id.clone(), content, message_type);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if message.timestamp < *last {
            message.timestamp = *last;
        }
        *last = message.timestamp;
        message
    }

    /// Presence announcement when joining the network.
    pub fn joined(&self) -> Message {
        self.create(
            format!("Device {} joined the network", self.sender_id),
            MessageType::Presence,
        )
    }

    /// Presence announcement when leaving the network.
    pub fn leaving(&self) -> Message {
        self.create(
            format!("Device {} leaving the network", self.sender_id),
            MessageType::Presence,
        )
    }
}

/// Command received on `devices/{id}/commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "type", default = "unknown_command")]
    pub kind: String,
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

fn unknown_command() -> String {
    "unknown".to_string()
}

/// Commands the agent knows how to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Ping,
    GetInfo,
    Other(String),
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self.kind.as_str() {
            "ping" => CommandKind::Ping,
            "get_info" => CommandKind::GetInfo,
            other => CommandKind::Other(other.to_string()),
        }
    }
}

/// Timestamp codec: writes RFC 3339, reads RFC 3339, naive ISO 8601
/// (assumed UTC) or Unix seconds.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => parse_text(&text).ok_or_else(|| {
                D::Error::custom(format!("unrecognized timestamp '{text}'"))
            }),
            Raw::Seconds(secs) => from_unix(secs)
                .ok_or_else(|| D::Error::custom(format!("timestamp {secs} out of range"))),
        }
    }

    pub fn parse_text(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn from_unix(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        DateTime::<Utc>::from_timestamp(whole as i64, nanos.min(999_999_999))
    }
}

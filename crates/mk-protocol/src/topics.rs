//! MQTT topic builders and parsers for the device topic hierarchy.
//!
//! Topic structure:
//! ```text
//! devices/{device_id}/telemetry
//! devices/{device_id}/status
//! devices/{device_id}/commands
//! {chat_topic}                      (free-form broadcast, default chat/general)
//! ```

const PREFIX: &str = "devices";

/// Broadcast topic used for the conversational use case unless configured.
pub const DEFAULT_CHAT_TOPIC: &str = "chat/general";

// ─── Device topics ───

pub fn telemetry(device_id: &str) -> String {
    format!("{PREFIX}/{device_id}/telemetry")
}

pub fn status(device_id: &str) -> String {
    format!("{PREFIX}/{device_id}/status")
}

pub fn commands(device_id: &str) -> String {
    format!("{PREFIX}/{device_id}/commands")
}

// ─── Subscription patterns (with MQTT wildcards) ───

/// Subscribe to every topic under one device.
pub fn device_subscribe_all(device_id: &str) -> String {
    format!("{PREFIX}/{device_id}/#")
}

/// Subscribe to one channel of every device, e.g. all status reports.
pub fn all_devices(channel: DeviceChannel) -> String {
    format!("{PREFIX}/+/{}", channel.as_str())
}

// ─── Topic parsing ───

/// Per-device channel under `devices/{id}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChannel {
    Telemetry,
    Status,
    Commands,
}

impl DeviceChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Status => "status",
            Self::Commands => "commands",
        }
    }
}

/// Parsed device topic components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub device_id: String,
    pub channel: DeviceChannel,
}

/// Parse a device topic. Returns `None` for anything outside
/// `devices/{id}/{telemetry|status|commands}`.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != 3 || parts[0] != PREFIX || parts[1].is_empty() {
        return None;
    }

    let channel = match parts[2] {
        "telemetry" => DeviceChannel::Telemetry,
        "status" => DeviceChannel::Status,
        "commands" => DeviceChannel::Commands,
        _ => return None,
    };

    Some(ParsedTopic {
        device_id: parts[1].to_string(),
        channel,
    })
}

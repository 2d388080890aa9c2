//! Incoming message classification for the session event stream.
//!
//! Turns raw `(topic, payload)` publishes into typed `IncomingMessage`
//! variants so the agent can dispatch them without topic string matching.

use mk_protocol::topics::{self, DeviceChannel};
use mk_protocol::{DeviceCommand, Message};

/// A classified incoming publish.
#[derive(Debug)]
pub enum IncomingMessage {
    /// Conversational message on the chat topic.
    Chat(Message),
    /// Command addressed to this device.
    Command(DeviceCommand),
    /// Unrecognized topic or payload.
    Unknown { topic: String, payload: Vec<u8> },
}

/// Classify a raw publish received by `device_id`.
pub fn classify(topic: &str, payload: &[u8], device_id: &str, chat_topic: &str) -> IncomingMessage {
    let unknown = || IncomingMessage::Unknown {
        topic: topic.to_string(),
        payload: payload.to_vec(),
    };

    if topic == chat_topic {
        return match Message::from_slice(payload) {
            Ok(message) => IncomingMessage::Chat(message),
            Err(_) => unknown(),
        };
    }

    match topics::parse_topic(topic) {
        Some(parsed) if parsed.channel == DeviceChannel::Commands && parsed.device_id == device_id => {
            match serde_json::from_slice::<DeviceCommand>(payload) {
                Ok(command) => IncomingMessage::Command(command),
                Err(_) => unknown(),
            }
        }
        _ => unknown(),
    }
}

use serde::Deserialize;

use mk_protocol::DEFAULT_BROKER_PORT;
use mk_protocol::topics::DEFAULT_CHAT_TOPIC;

/// Broker session configuration, loadable from the `[mqtt]` TOML table.
///
/// Host, port and client id normally come from the issued credential;
/// the fields here only override them when non-empty.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname override. Empty means use the credential's.
    #[serde(default)]
    pub broker_host: String,
    /// Broker port, used together with `broker_host`.
    #[serde(default = "default_port")]
    pub broker_port: u16,
    /// MQTT client id override. Empty means use the credential's client name.
    #[serde(default)]
    pub client_id: String,
    /// Enable mTLS. When false, connects plaintext (local dev).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// How long `open` waits for the broker's CONNACK.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Budget for the farewell message to flush on close.
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
    /// Broadcast topic for conversational messages.
    #[serde(default = "default_chat_topic")]
    pub chat_topic: String,
    /// Bound on undelivered session events; overflow is dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: default_port(),
            client_id: String::new(),
            use_tls: default_use_tls(),
            keepalive_secs: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            close_grace_ms: default_close_grace(),
            chat_topic: default_chat_topic(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_use_tls() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_keepalive() -> u16 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_close_grace() -> u64 {
    1000
}

fn default_chat_topic() -> String {
    DEFAULT_CHAT_TOPIC.to_string()
}

fn default_event_capacity() -> usize {
    256
}

//! Secure MQTT session for makerspace devices.
//!
//! Provides the broker-facing half of the device agent:
//! - `Channel` trait for publish/subscribe (mockable in tests)
//! - `MqttChannel` over rumqttc with mTLS from an issued `Credential`
//! - `MockChannel` for testing without a broker
//! - `SessionManager` owning the connection state machine and event stream
//! - `IncomingMessage` classification for dispatching inbound publishes

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod mock;
pub mod session;
pub mod tls;

// Re-exports for convenience.
pub use channel::{Channel, MqttChannel};
pub use config::MqttConfig;
pub use error::{SessionError, SessionResult};
pub use handler::{IncomingMessage, classify};
pub use mock::MockChannel;
pub use session::{SessionEvent, SessionManager, SessionState};

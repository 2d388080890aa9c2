//! Channel abstraction over the broker client.
//!
//! `SessionManager` talks to the broker only through [`Channel`], so tests
//! can swap in [`MockChannel`](crate::MockChannel).

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};

use crate::error::{SessionError, SessionResult};

/// Requests buffered between the client handle and its event loop.
pub const REQUEST_CAPACITY: usize = 64;

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> SessionResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()>;

    /// Send a clean DISCONNECT. Queued after any pending publishes.
    async fn disconnect(&self) -> SessionResult<()>;
}

// ── MqttChannel ───────────────────────────────────────────────

/// Channel backed by `rumqttc::AsyncClient`.
///
/// The `EventLoop` is returned separately from `new()`; the session
/// drives it in its own task.
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    pub fn new(options: MqttOptions) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (Self { client }, eventloop)
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> SessionResult<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| SessionError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| SessionError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))
    }
}

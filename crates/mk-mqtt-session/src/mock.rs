//! Mock channel for testing without a real broker.
//!
//! Records publishes, subscriptions and disconnects for assertion in
//! tests, and can be told to fail publishes to exercise error paths.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use rumqttc::QoS;

use crate::channel::Channel;
use crate::error::{SessionError, SessionResult};

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// In-memory `Channel` implementation.
#[derive(Default)]
pub struct MockChannel {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    disconnects: AtomicUsize,
    fail_publish: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    pub fn last_published(&self) -> Option<PublishedMessage> {
        lock(&self.published).last().cloned()
    }

    /// Published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        lock(&self.subscriptions).iter().any(|(f, _)| f == filter)
    }

    /// Number of `disconnect` calls received.
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Make subsequent publishes fail with `SessionError::Publish`.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Clear all recorded state.
    pub fn reset(&self) {
        lock(&self.published).clear();
        lock(&self.subscriptions).clear();
        self.disconnects.store(0, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> SessionResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SessionError::Publish("mock publish failure".into()));
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> SessionResult<()> {
        lock(&self.subscriptions).push((filter.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

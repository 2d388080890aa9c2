//! Shared test harness for E2E scenario tests.
//!
//! Wires a real enrollment client against a wiremock issuer, and a real
//! session, policy and dispatcher over a shared `MockChannel`.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use wiremock::MockServer;

use mk_device_agent::credential_store::CredentialStore;
use mk_device_agent::dispatcher::{DispatchConfig, ResponseDispatcher};
use mk_device_agent::enrollment::{EnrollmentClient, IssuerConfig};
use mk_device_agent::generator::{GenerationError, ResponseGenerator};
use mk_device_agent::history::HistoryRing;
use mk_device_agent::mqtt_loop::{InboundHandler, device_info};
use mk_device_agent::policy::{PolicyConfig, ResponsePolicy};
use mk_mqtt_session::{MockChannel, MqttConfig, SessionManager};
use mk_protocol::{DeviceId, Message, MessageType};

pub const CHAT: &str = "chat/general";

// ── Certificates ──────────────────────────────────────────────

pub use mk_protocol::testing::{Material, material, record_for, registration_json};

pub fn enrollment_client(server: &MockServer, dir: &Path) -> EnrollmentClient {
    let config = IssuerConfig {
        url: server.uri(),
        request_timeout_secs: 5,
        ..IssuerConfig::default()
    };
    EnrollmentClient::new(config, CredentialStore::new(dir)).unwrap()
}

// ── Generators ────────────────────────────────────────────────

/// Replies with a fixed text after `delay`, counting calls.
pub struct StubGenerator {
    reply: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubGenerator {
    pub fn new(reply: &str) -> Self {
        Self::slow(reply, Duration::ZERO)
    }

    pub fn slow(reply: &str, delay: Duration) -> Self {
        Self {
            reply: reply.to_string(),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for StubGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.clone())
    }
}

// ── Agent harness ─────────────────────────────────────────────

/// One device's inbound pipeline over a `MockChannel`.
pub struct AgentHarness {
    pub session: Arc<SessionManager>,
    pub mqtt: Arc<MockChannel>,
    pub history: Arc<HistoryRing>,
    pub dispatcher: Arc<ResponseDispatcher>,
    pub handler: InboundHandler,
}

impl AgentHarness {
    /// Connected harness for `device_id`.
    pub async fn connected(
        device_id: &str,
        policy: PolicyConfig,
        dispatch: DispatchConfig,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let h = Self::disconnected(device_id, policy, dispatch, generator);
        h.session.attach(h.mqtt.clone()).await.unwrap();
        h
    }

    /// Harness whose session was never opened.
    pub fn disconnected(
        device_id: &str,
        policy: PolicyConfig,
        dispatch: DispatchConfig,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let (session, _events) = SessionManager::new(
            DeviceId::parse(device_id).unwrap(),
            MqttConfig {
                close_grace_ms: 50,
                ..MqttConfig::default()
            },
        );
        let session = Arc::new(session);
        let history = Arc::new(HistoryRing::default());
        let dispatcher = Arc::new(ResponseDispatcher::new(
            Arc::clone(&session),
            generator,
            dispatch,
        ));
        let handler = InboundHandler::new(
            Arc::clone(&session),
            Arc::clone(&history),
            ResponsePolicy::seeded(policy, 7),
            Arc::clone(&dispatcher),
            device_info(&record_for(device_id)),
        );

        Self {
            session,
            mqtt: Arc::new(MockChannel::new()),
            history,
            dispatcher,
            handler,
        }
    }

    /// Deliver a chat message as if the broker had forwarded it.
    pub async fn deliver(
        &self,
        message: &Message,
    ) -> Option<tokio::task::JoinHandle<Result<(), mk_device_agent::dispatcher::DispatchError>>> {
        self.handler
            .handle(CHAT, &message.to_bytes().unwrap())
            .await
    }

    /// Chat publishes whose `message_type` is `response`.
    pub fn responses(&self) -> Vec<serde_json::Value> {
        self.mqtt
            .published_to(CHAT)
            .iter()
            .map(|p| p.json())
            .filter(|v| v["message_type"] == "response")
            .collect()
    }
}

pub fn general(sender: &str, content: &str) -> Message {
    Message::new(sender, content, MessageType::General)
}

/// Dispatch settings without the anti-flood pause.
pub fn immediate() -> DispatchConfig {
    DispatchConfig {
        response_delay_ms: 0,
        ..DispatchConfig::default()
    }
}

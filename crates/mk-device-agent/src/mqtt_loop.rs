//! Inbound session event loop.
//!
//! Consumes [`SessionEvent`]s in arrival order. Chat messages go into the
//! history ring and, when the policy allows it, to the dispatcher. Device
//! commands are answered inline. Generation never runs on this loop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mk_mqtt_session::{IncomingMessage, SessionEvent, SessionManager, classify};
use mk_protocol::topics;
use mk_protocol::{
    CommandKind, DeviceCommand, DeviceInfo, DeviceStatus, EnrollmentRecord, Message, StatusReport,
};

use crate::dispatcher::{DispatchError, ResponseDispatcher};
use crate::history::HistoryRing;
use crate::policy::ResponsePolicy;

/// Why [`run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The broker connection was lost.
    Disconnected(String),
    /// Shutdown was requested.
    Cancelled,
    /// The session was dropped.
    ChannelClosed,
}

/// Identity summary published on the status topic.
pub fn device_info(record: &EnrollmentRecord) -> DeviceInfo {
    let credential = &record.credential;
    DeviceInfo {
        device_id: credential.device_id.to_string(),
        client_name: credential.client_name.clone(),
        authentication_name: credential.authentication_name.clone(),
        certificate_validity_days: credential.validity_days,
        app_deployment_enabled: matches!(&record.app_deployment, Some(v) if !v.is_null()),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    }
}

/// Everything the loop needs to react to one event.
pub struct InboundHandler {
    session: Arc<SessionManager>,
    history: Arc<HistoryRing>,
    policy: ResponsePolicy,
    dispatcher: Arc<ResponseDispatcher>,
    info: DeviceInfo,
}

impl InboundHandler {
    pub fn new(
        session: Arc<SessionManager>,
        history: Arc<HistoryRing>,
        policy: ResponsePolicy,
        dispatcher: Arc<ResponseDispatcher>,
        info: DeviceInfo,
    ) -> Self {
        Self {
            session,
            history,
            policy,
            dispatcher,
            info,
        }
    }

    /// Presence on the chat topic, then device info on the status topic.
    pub async fn announce(&self) {
        let joined = self.session.messages().joined();
        if let Err(e) = self.session.publish_chat(&joined).await {
            tracing::warn!(error = %e, "failed to announce presence");
        }
        self.publish_info().await;
    }

    /// Handle one inbound publish. Returns the dispatch handle when a
    /// response was scheduled.
    pub async fn handle(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Option<JoinHandle<Result<(), DispatchError>>> {
        let device_id = self.session.device_id().as_str();
        match classify(topic, payload, device_id, self.session.chat_topic()) {
            IncomingMessage::Chat(message) => self.on_chat(message),
            IncomingMessage::Command(command) => {
                self.on_command(command).await;
                None
            }
            IncomingMessage::Unknown { topic, payload } => {
                tracing::debug!(%topic, bytes = payload.len(), "ignoring unrecognized message");
                None
            }
        }
    }

    fn on_chat(&self, message: Message) -> Option<JoinHandle<Result<(), DispatchError>>> {
        tracing::debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            message_type = %message.message_type,
            "chat message received"
        );
        self.history.append(message.clone());

        let decision = self
            .policy
            .evaluate(&message, self.session.device_id().as_str());
        if !decision.responds() {
            tracing::debug!(message_id = %message.id, ?decision, "not responding");
            return None;
        }

        tracing::info!(
            message_id = %message.id,
            sender = %message.sender_id,
            ?decision,
            "responding to message"
        );
        let snapshot = self.history.snapshot();
        Some(self.dispatcher.on_eligible_message(message, snapshot))
    }

    async fn on_command(&self, command: DeviceCommand) {
        match command.kind() {
            CommandKind::Ping => {
                tracing::info!("ping received");
                let device_id = self.session.device_id().as_str();
                let report = StatusReport::now(device_id, DeviceStatus::Online);
                if let Err(e) = self
                    .session
                    .publish_json(&topics::status(device_id), &report)
                    .await
                {
                    tracing::warn!(error = %e, "failed to answer ping");
                }
            }
            CommandKind::GetInfo => {
                tracing::info!("device info requested");
                self.publish_info().await;
            }
            CommandKind::Other(kind) => {
                tracing::info!(command = %kind, "ignoring unsupported command");
            }
        }
    }

    async fn publish_info(&self) {
        let info = DeviceInfo {
            timestamp: Utc::now(),
            ..self.info.clone()
        };
        let topic = topics::status(&info.device_id);
        if let Err(e) = self.session.publish_json(&topic, &info).await {
            tracing::warn!(error = %e, "failed to publish device info");
        }
    }
}

/// Drive `events` until the connection is lost, the session goes away or
/// `cancel` fires.
pub async fn run(
    mut events: mpsc::Receiver<SessionEvent>,
    handler: &InboundHandler,
    cancel: &CancellationToken,
) -> LoopExit {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            event = events.recv() => event,
        };

        match event {
            Some(SessionEvent::Connected) => {
                tracing::info!("session connected");
                handler.announce().await;
            }
            Some(SessionEvent::Message { topic, payload }) => {
                handler.handle(&topic, &payload).await;
            }
            Some(SessionEvent::Disconnected { reason }) => {
                tracing::warn!(%reason, "session disconnected");
                return LoopExit::Disconnected(reason);
            }
            None => return LoopExit::ChannelClosed,
        }
    }
}

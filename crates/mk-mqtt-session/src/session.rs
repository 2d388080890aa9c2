//! Secure session manager.
//!
//! Owns the single broker connection of a device:
//!
//! ```text
//! Disconnected ──open──▶ Connecting ──CONNACK──▶ Connected
//!      ▲                     │                      │
//!      ├── timeout/refused ──┘                      │ close
//!      ├────────────── connection lost ─────────────┤
//!      │                                            ▼
//!      └───────────────────────────────────── Disconnecting
//! ```
//!
//! There is no automatic reconnect. A lost connection lands in
//! `Disconnected` and is reported once through [`SessionEvent::Disconnected`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mk_protocol::{Credential, DeviceId, Message, MessageFactory, topics};

use crate::channel::{Channel, MqttChannel};
use crate::config::MqttConfig;
use crate::error::{SessionError, SessionResult};
use crate::tls;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        })
    }
}

/// Notification delivered on the session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Message { .. } => "message",
        }
    }

    fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Message { .. })
    }
}

// ── Shared state ──────────────────────────────────────────────

/// State visible to both the manager and its network task.
struct Shared {
    state: watch::Sender<SessionState>,
    events: mpsc::Sender<SessionEvent>,
}

impl Shared {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(%from, %to, "session state changed");
        }
    }

    /// Move `from -> to` only if the session is still in `from`.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!(%from, %to, "session state changed");
        }
        moved
    }

    /// Record an unsolicited loss of the connection. No-op while closing.
    fn lost(&self, reason: String) {
        let dropped = self.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Connecting | SessionState::Connected) {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
        if dropped {
            tracing::warn!(%reason, "broker connection lost");
            self.emit(SessionEvent::Disconnected { reason });
        }
    }

    /// Never blocks. A full queue drops inbound messages, but lifecycle
    /// events are handed to a task that waits for room.
    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) if event.is_lifecycle() => {
                tracing::debug!(event = event.kind(), "session event queue full, deferring event");
                let events = self.events.clone();
                tokio::spawn(async move {
                    if events.send(event).await.is_err() {
                        tracing::debug!("no session event consumer");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = event.kind(), "session event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(event = event.kind(), "no session event consumer");
            }
        }
    }
}

// ── Network task ──────────────────────────────────────────────

struct NetworkTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl NetworkTask {
    /// Let the loop flush and exit on its own for up to `grace`, then kill it.
    async fn stop(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            tracing::debug!(?grace, "network loop still running after grace, aborting");
            self.abort();
        }
    }

    fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

enum Ack {
    Accepted,
    Refused(String),
    Failed(String),
}

/// Poll the rumqttc event loop until the connection ends or the task is
/// cancelled. Reports the CONNACK outcome once through `ack`.
async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    ack: oneshot::Sender<Ack>,
    cancel: CancellationToken,
) {
    let mut ack = Some(ack);

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                let accepted = connack.code == ConnectReturnCode::Success;
                let outcome = if accepted {
                    Ack::Accepted
                } else {
                    Ack::Refused(format!("{:?}", connack.code))
                };
                if let Some(tx) = ack.take() {
                    let _ = tx.send(outcome);
                }
                if !accepted {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "publish received");
                shared.emit(SessionEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.lost("broker sent DISCONNECT".into());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                match ack.take() {
                    Some(tx) => {
                        let outcome = match e {
                            ConnectionError::ConnectionRefused(code) => Ack::Refused(format!("{code:?}")),
                            other => Ack::Failed(other.to_string()),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => shared.lost(e.to_string()),
                }
                break;
            }
        }
    }

    tracing::debug!("network loop stopped");
}

// ── SessionManager ────────────────────────────────────────────

/// Single authenticated broker session for one device.
///
/// All outbound publishes go through one send lock, so concurrent callers
/// never interleave on the wire.
pub struct SessionManager {
    device_id: DeviceId,
    config: MqttConfig,
    messages: Arc<MessageFactory>,
    shared: Arc<Shared>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    network: Mutex<Option<NetworkTask>>,
    lifecycle: tokio::sync::Mutex<()>,
    send_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Create a disconnected session and the receiver for its events.
    pub fn new(device_id: DeviceId, config: MqttConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Disconnected);
        let messages = Arc::new(MessageFactory::new(device_id.as_str()));

        let session = Self {
            device_id,
            config,
            messages,
            shared: Arc::new(Shared { state, events }),
            channel: Mutex::new(None),
            network: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            send_lock: tokio::sync::Mutex::new(()),
        };
        (session, receiver)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn chat_topic(&self) -> &str {
        &self.config.chat_topic
    }

    /// Factory for messages sent as this device.
    pub fn messages(&self) -> &Arc<MessageFactory> {
        &self.messages
    }

    pub fn state(&self) -> SessionState {
        self.shared.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    // ── Opening ───────────────────────────────────────────────

    /// Connect to the broker named by `credential` using mTLS.
    ///
    /// Fails with `CredentialInvalid` before any I/O when the credential
    /// is unusable, and with `ConnectTimeout` if no CONNACK arrives within
    /// `connect_timeout_secs`.
    pub async fn open(&self, credential: &Credential) -> SessionResult<()> {
        let transport = if self.config.use_tls {
            tls::tls_transport(credential)?
        } else {
            credential.validate()?;
            tls::plaintext_transport()
        };

        let (host, port) = if self.config.broker_host.is_empty() {
            (credential.broker_hostname.clone(), credential.broker_port)
        } else {
            (self.config.broker_host.clone(), self.config.broker_port)
        };
        if host.trim().is_empty() {
            return Err(SessionError::Connection(
                "no broker hostname in credential or config".into(),
            ));
        }

        let client_id = if self.config.client_id.is_empty() {
            credential.client_name.clone()
        } else {
            self.config.client_id.clone()
        };

        self.connect(self.options(client_id, host, port, transport)).await
    }

    /// Connect without TLS (local broker / dev mode).
    pub async fn open_plaintext(&self, host: &str, port: u16) -> SessionResult<()> {
        let client_id = if self.config.client_id.is_empty() {
            self.device_id.to_string()
        } else {
            self.config.client_id.clone()
        };
        self.connect(self.options(client_id, host.to_string(), port, tls::plaintext_transport()))
            .await
    }

    /// Bring the session up over an already-established channel.
    pub async fn attach(&self, channel: Arc<dyn Channel>) -> SessionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self
            .shared
            .advance(SessionState::Disconnected, SessionState::Connecting)
        {
            return Err(SessionError::InvalidState(self.state()));
        }
        self.establish(channel).await
    }

    fn options(&self, client_id: String, host: String, port: u16, transport: Transport) -> MqttOptions {
        tracing::info!(%host, port, %client_id, tls = !matches!(transport, Transport::Tcp), "opening broker session");
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs.into()));
        options.set_transport(transport);
        options
    }

    async fn connect(&self, options: MqttOptions) -> SessionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self
            .shared
            .advance(SessionState::Disconnected, SessionState::Connecting)
        {
            return Err(SessionError::InvalidState(self.state()));
        }

        // Leftover loop from a connection that was lost.
        let stale = lock(&self.network).take();
        if let Some(stale) = stale {
            stale.abort();
        }

        let (channel, eventloop) = MqttChannel::new(options);
        let (ack_tx, ack_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(eventloop, Arc::clone(&self.shared), ack_tx, cancel.clone()));
        let network = NetworkTask { cancel, handle };

        let wait = Duration::from_secs(self.config.connect_timeout_secs);
        let acked = match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(Ack::Accepted)) => Ok(()),
            Ok(Ok(Ack::Refused(code))) => Err(SessionError::ConnectRefused(code)),
            Ok(Ok(Ack::Failed(reason))) => Err(SessionError::Connection(reason)),
            Ok(Err(_)) => Err(SessionError::Connection(
                "network loop exited before CONNACK".into(),
            )),
            Err(_) => Err(SessionError::ConnectTimeout(wait)),
        };

        if let Err(e) = acked {
            network.abort();
            self.shared.set(SessionState::Disconnected);
            tracing::warn!(error = %e, "session open failed");
            return Err(e);
        }

        *lock(&self.network) = Some(network);
        self.establish(Arc::new(channel)).await
    }

    /// Subscribe to this device's inbound topics and mark the session up.
    async fn establish(&self, channel: Arc<dyn Channel>) -> SessionResult<()> {
        let filters = [topics::commands(self.device_id.as_str()), self.config.chat_topic.clone()];
        for filter in &filters {
            if let Err(e) = channel.subscribe(filter, QoS::AtLeastOnce).await {
                tracing::warn!(%filter, error = %e, "subscription failed");
                self.teardown();
                return Err(e);
            }
        }

        *lock(&self.channel) = Some(channel);
        if !self
            .shared
            .advance(SessionState::Connecting, SessionState::Connected)
        {
            self.teardown();
            return Err(SessionError::Connection(
                "connection lost during session setup".into(),
            ));
        }

        self.shared.emit(SessionEvent::Connected);
        Ok(())
    }

    fn teardown(&self) {
        let network = lock(&self.network).take();
        if let Some(network) = network {
            network.abort();
        }
        lock(&self.channel).take();
        self.shared.set(SessionState::Disconnected);
    }

    // ── Publishing ────────────────────────────────────────────

    /// Publish raw bytes. Fails with `NotConnected` (and does no I/O)
    /// unless the session is `Connected`.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> SessionResult<()> {
        let channel = self.connected_channel()?;
        let _send = self.send_lock.lock().await;
        channel.publish(topic, payload, QoS::AtLeastOnce).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> SessionResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| SessionError::Serialization(e.to_string()))?;
        self.publish(topic, &bytes).await
    }

    pub async fn publish_message(&self, topic: &str, message: &Message) -> SessionResult<()> {
        self.publish_json(topic, message).await
    }

    /// Publish on the configured chat topic.
    pub async fn publish_chat(&self, message: &Message) -> SessionResult<()> {
        self.publish_message(&self.config.chat_topic, message).await
    }

    fn connected_channel(&self) -> SessionResult<Arc<dyn Channel>> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        lock(&self.channel).clone().ok_or(SessionError::NotConnected)
    }

    // ── Closing ───────────────────────────────────────────────

    /// Say goodbye and tear the connection down. Idempotent.
    ///
    /// The farewell is best-effort within `close_grace_ms`; teardown
    /// happens regardless of whether it was delivered.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.state();

        if previous == SessionState::Disconnected {
            let stale = lock(&self.network).take();
            if let Some(stale) = stale {
                stale.abort();
            }
            lock(&self.channel).take();
            return;
        }

        self.shared.set(SessionState::Disconnecting);
        let grace = Duration::from_millis(self.config.close_grace_ms);

        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            if previous == SessionState::Connected {
                self.send_farewell(channel.as_ref(), grace).await;
            }
            match tokio::time::timeout(grace, channel.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "disconnect request failed"),
                Err(_) => tracing::debug!("disconnect request timed out"),
            }
        }

        let network = lock(&self.network).take();
        if let Some(network) = network {
            network.stop(grace).await;
        }

        self.shared.set(SessionState::Disconnected);
        tracing::info!(device_id = %self.device_id, "session closed");
    }

    async fn send_farewell(&self, channel: &dyn Channel, grace: Duration) {
        let farewell = self.messages.leaving();
        let payload = match farewell.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode farewell");
                return;
            }
        };

        let send = async {
            let _send = self.send_lock.lock().await;
            channel
                .publish(&self.config.chat_topic, &payload, QoS::AtLeastOnce)
                .await
        };
        match tokio::time::timeout(grace, send).await {
            Ok(Ok(())) => tracing::debug!("farewell sent"),
            Ok(Err(e)) => tracing::warn!(error = %e, "farewell publish failed"),
            Err(_) => tracing::warn!(?grace, "farewell not sent within grace period"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

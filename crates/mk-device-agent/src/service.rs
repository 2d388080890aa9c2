//! Service orchestration: enrollment, session and background loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use mk_mqtt_session::{Channel, SessionError, SessionEvent, SessionManager};
use mk_protocol::{DeviceId, EnrollmentRecord, InvalidDeviceId, Message, MessageType};

use crate::config::AgentConfig;
use crate::credential_store::CredentialStore;
use crate::dispatcher::ResponseDispatcher;
use crate::enrollment::{EnrollError, EnrollmentClient};
use crate::generator::{GenerationError, ProcessGenerator, ResponseGenerator};
use crate::history::HistoryRing;
use crate::mqtt_loop::{self, InboundHandler};
use crate::policy::ResponsePolicy;
use crate::telemetry::{self, TelemetrySources};

/// How long `stop` waits for in-flight dispatches before abandoning them.
const DISPATCH_GRACE: Duration = Duration::from_secs(2);
/// How long `stop` waits for the background loops to finish.
const TASK_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidDeviceId(#[from] InvalidDeviceId),
    #[error("generator unavailable: {0}")]
    Generator(#[from] GenerationError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("service already started")]
    AlreadyStarted,
}

/// One device: credential, broker session, event loop and telemetry.
pub struct DeviceService {
    config: AgentConfig,
    device_id: DeviceId,
    enrollment: EnrollmentClient,
    generator: Arc<dyn ResponseGenerator>,
    session: Arc<SessionManager>,
    events: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    history: Arc<HistoryRing>,
    dispatcher: Arc<ResponseDispatcher>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    loop_ended: CancellationToken,
    started: tokio::time::Instant,
}

impl DeviceService {
    /// Build a service that runs the configured generator process.
    pub fn new(config: AgentConfig) -> Result<Self, ServiceError> {
        let generator = Arc::new(ProcessGenerator::new(config.generator.clone()));
        Self::with_generator(config, generator)
    }

    pub fn with_generator(
        config: AgentConfig,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Result<Self, ServiceError> {
        let device_id = DeviceId::parse(config.device_id.as_str())?;
        let store = CredentialStore::new(&config.credential_dir);
        let enrollment = EnrollmentClient::new(config.issuer.clone(), store)?;

        let (session, events) = SessionManager::new(device_id.clone(), config.mqtt.clone());
        let session = Arc::new(session);
        let history = Arc::new(HistoryRing::new(config.history_capacity));
        let dispatcher = Arc::new(ResponseDispatcher::new(
            Arc::clone(&session),
            Arc::clone(&generator),
            config.dispatch.clone(),
        ));

        Ok(Self {
            config,
            device_id,
            enrollment,
            generator,
            session,
            events: Mutex::new(Some(events)),
            history,
            dispatcher,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            loop_ended: CancellationToken::new(),
            started: tokio::time::Instant::now(),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn history(&self) -> &Arc<HistoryRing> {
        &self.history
    }

    pub fn enrollment(&self) -> &EnrollmentClient {
        &self.enrollment
    }

    /// Validate the generator, enroll, open the broker session and spawn
    /// the event and telemetry loops.
    pub async fn start(&self) -> Result<EnrollmentRecord, ServiceError> {
        self.generator.validate()?;
        let record = self.enrollment.enroll(self.device_id.as_str()).await?;
        let events = self.take_events()?;
        if let Err(e) = self.session.open(&record.credential).await {
            self.return_events(events);
            return Err(e.into());
        }
        self.spawn_loops(&record, events);
        Ok(record)
    }

    /// Like [`start`](Self::start) but over an existing channel and a
    /// credential obtained elsewhere. No enrollment or network I/O happens.
    pub async fn start_attached(
        &self,
        record: &EnrollmentRecord,
        channel: Arc<dyn Channel>,
    ) -> Result<(), ServiceError> {
        self.generator.validate()?;
        let events = self.take_events()?;
        if let Err(e) = self.session.attach(channel).await {
            self.return_events(events);
            return Err(e.into());
        }
        self.spawn_loops(record, events);
        Ok(())
    }

    fn take_events(&self) -> Result<mpsc::Receiver<SessionEvent>, ServiceError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ServiceError::AlreadyStarted)
    }

    fn return_events(&self, events: mpsc::Receiver<SessionEvent>) {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
    }

    fn spawn_loops(&self, record: &EnrollmentRecord, events: mpsc::Receiver<SessionEvent>) {
        let handler = InboundHandler::new(
            Arc::clone(&self.session),
            Arc::clone(&self.history),
            ResponsePolicy::new(self.config.policy.clone()),
            Arc::clone(&self.dispatcher),
            mqtt_loop::device_info(record),
        );
        let cancel = self.cancel.clone();
        let loop_ended = self.loop_ended.clone();
        self.tasks.spawn(async move {
            let exit = mqtt_loop::run(events, &handler, &cancel).await;
            tracing::info!(?exit, "event loop finished");
            loop_ended.cancel();
        });

        let interval = Duration::from_secs(self.config.telemetry_interval_secs);
        if !interval.is_zero() {
            let session = Arc::clone(&self.session);
            let history = Arc::clone(&self.history);
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = self.cancel.clone();
            let started = self.started;
            self.tasks.spawn(async move {
                let sources = TelemetrySources {
                    session: &session,
                    history: &history,
                    dispatcher: &dispatcher,
                    started,
                };
                telemetry::run(sources, interval, &cancel).await;
            });
        }

        tracing::info!(
            device_id = %self.device_id,
            chat_topic = %self.session.chat_topic(),
            "device service running"
        );
    }

    /// Resolves once the event loop has ended (connection lost or stopped).
    pub async fn closed(&self) {
        self.loop_ended.cancelled().await;
    }

    /// Publish an operator-authored message on the chat topic.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<Message, ServiceError> {
        let message = self.session.messages().create(content.into(), message_type);
        self.session.publish_chat(&message).await?;
        tracing::info!(message_id = %message.id, %message_type, "message sent");
        Ok(message)
    }

    /// Abandon pending dispatches, close the session and join the loops.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.dispatcher.shutdown(DISPATCH_GRACE).await;
        self.session.close().await;
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(TASK_GRACE, self.tasks.wait()).await.is_err() {
            tracing::warn!("background tasks did not stop in time");
        }
        tracing::info!(device_id = %self.device_id, "device service stopped");
    }
}

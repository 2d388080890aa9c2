//! Response dispatcher.
//!
//! Each eligible message becomes an independent task that renders a
//! prompt, runs the generator under a timeout, waits out the anti-flood
//! delay and publishes one `response` message on the chat topic.
//! Generation is capped by a semaphore; excess work waits for a permit.
//! Errors stay inside the task and are only logged.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use mk_mqtt_session::{SessionError, SessionManager};
use mk_protocol::{Message, MessageType};

use crate::generator::{GenerationError, ResponseGenerator};
use crate::history::HistorySnapshot;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are a helpful AI assistant in an IoT network. \
Device {device_id} said: '{content}'. Recent context: {context}. \
Provide a helpful, concise response.";

/// History entries summarized into `{context}`.
pub const CONTEXT_MESSAGES: usize = 3;

/// `[dispatch]` configuration table.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Pause between a finished generation and its publish.
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// Generations allowed to run at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Placeholders: `{device_id}`, `{content}`, `{context}`, `{own_device_id}`.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

fn default_response_delay() -> u64 {
    2000
}
fn default_generation_timeout() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    4
}
fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_delay_ms: default_response_delay(),
            generation_timeout_secs: default_generation_timeout(),
            max_concurrent: default_max_concurrent(),
            prompt_template: default_prompt_template(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("dispatch cancelled")]
    Cancelled,
    #[error("publish failed: {0}")]
    Publish(#[from] SessionError),
}

/// Fill `template` from the triggering message and a history snapshot.
///
/// Substitution is single-pass, so placeholder-like text inside message
/// content is left alone. Unknown placeholders are kept verbatim.
pub fn render_prompt(
    template: &str,
    message: &Message,
    history: &HistorySnapshot,
    own_device_id: &str,
) -> String {
    let context = history
        .recent_excluding(CONTEXT_MESSAGES, &message.id)
        .iter()
        .map(|m| format!("{}: {}", m.sender_id, m.content.as_text()))
        .collect::<Vec<_>>()
        .join(" | ");
    let content = message.content.as_text();

    let lookup = |name: &str| -> Option<Cow<'_, str>> {
        match name {
            "device_id" => Some(Cow::Borrowed(message.sender_id.as_str())),
            "content" => Some(Cow::Borrowed(content.as_ref())),
            "context" => Some(Cow::Borrowed(context.as_str())),
            "own_device_id" => Some(Cow::Borrowed(own_device_id)),
            _ => None,
        }
    };

    let mut out = String::with_capacity(template.len() + content.len() + context.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after
            .find('}')
            .and_then(|end| lookup(&after[..end]).map(|value| (end, value)))
        {
            Some((end, value)) => {
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Runs generation work off the inbound event loop.
pub struct ResponseDispatcher {
    session: Arc<SessionManager>,
    generator: Arc<dyn ResponseGenerator>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ResponseDispatcher {
    pub fn new(
        session: Arc<SessionManager>,
        generator: Arc<dyn ResponseGenerator>,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            session,
            generator,
            config,
            permits,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatch tasks not yet finished, including those waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn the response work for `message`. Returns immediately.
    pub fn on_eligible_message(
        &self,
        message: Message,
        history: HistorySnapshot,
    ) -> JoinHandle<Result<(), DispatchError>> {
        let prompt = render_prompt(
            &self.config.prompt_template,
            &message,
            &history,
            self.session.device_id().as_str(),
        );
        let job = Job {
            session: Arc::clone(&self.session),
            generator: Arc::clone(&self.generator),
            permits: Arc::clone(&self.permits),
            timeout: Duration::from_secs(self.config.generation_timeout_secs),
            delay: Duration::from_millis(self.config.response_delay_ms),
            message_id: message.id,
            sender_id: message.sender_id,
        };
        let cancel = self.cancel.clone();
        tracing::debug!(message_id = %job.message_id, "dispatching response");
        self.tracker.spawn(async move {
            let message_id = job.message_id.clone();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                result = job.run(prompt) => result,
            };
            match &result {
                Ok(()) => {}
                Err(DispatchError::Cancelled) => {
                    tracing::debug!(%message_id, "dispatch cancelled");
                }
                Err(e) => tracing::warn!(%message_id, error = %e, "dispatch failed"),
            }
            result
        })
    }

    /// Cancel all outstanding work and wait up to `grace` for tasks to end.
    /// Pending publishes are abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "dispatch tasks still running after shutdown grace"
            );
        }
    }
}

struct Job {
    session: Arc<SessionManager>,
    generator: Arc<dyn ResponseGenerator>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    delay: Duration,
    message_id: String,
    sender_id: String,
}

impl Job {
    async fn run(self, prompt: String) -> Result<(), DispatchError> {
        let text = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| DispatchError::Cancelled)?;
            let started = tokio::time::Instant::now();
            let text = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
                Err(_) | Ok(Err(GenerationError::Timeout(_))) => {
                    return Err(DispatchError::GenerationTimeout(self.timeout));
                }
                Ok(Err(e)) => return Err(DispatchError::GenerationFailed(e.to_string())),
                Ok(Ok(text)) => text,
            };
            tracing::info!(
                message_id = %self.message_id,
                sender = %self.sender_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "response generated"
            );
            text
        };

        tokio::time::sleep(self.delay).await;

        let mut response = self.session.messages().create(text, MessageType::Response);
        response
            .extra
            .insert("in_reply_to".into(), self.message_id.clone().into());
        self.session.publish_chat(&response).await?;
        tracing::info!(
            message_id = %self.message_id,
            response_id = %response.id,
            "response published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryRing;
    use async_trait::async_trait;
    use mk_mqtt_session::{MockChannel, MqttConfig};
    use mk_protocol::DeviceId;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHAT: &str = "chat/general";

    enum Behaviour {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct StubGenerator {
        behaviour: Behaviour,
        work: Duration,
        prompts: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubGenerator {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                work: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ResponseGenerator for StubGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Reply(text) => Ok(text.to_string()),
                Behaviour::Fail => Err(GenerationError::Failed("exit status Some(1)".into())),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("too late".into())
                }
            }
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            response_delay_ms: 0,
            generation_timeout_secs: 1,
            ..DispatchConfig::default()
        }
    }

    async fn connected() -> (Arc<SessionManager>, Arc<MockChannel>) {
        let (session, _rx) = SessionManager::new(
            DeviceId::parse("lab-01").unwrap(),
            MqttConfig {
                close_grace_ms: 50,
                ..MqttConfig::default()
            },
        );
        let mock = Arc::new(MockChannel::new());
        session.attach(mock.clone()).await.unwrap();
        (Arc::new(session), mock)
    }

    fn incoming(content: &str) -> Message {
        Message::new("lab-02", content, MessageType::General)
    }

    #[tokio::test]
    async fn in_time_generation_publishes_once() {
        let (session, mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Reply("Try the spare nozzle.")));
        let dispatcher = ResponseDispatcher::new(session, generator, fast_config());

        let msg = incoming("printer jammed, help?");
        let msg_id = msg.id.clone();
        dispatcher
            .on_eligible_message(msg, HistorySnapshot::default())
            .await
            .unwrap()
            .unwrap();

        let sent = mock.published_to(CHAT);
        assert_eq!(sent.len(), 1);
        let body = sent[0].json();
        assert_eq!(body["content"], "Try the spare nozzle.");
        assert_eq!(body["message_type"], "response");
        assert_eq!(body["device_id"], "lab-01");
        assert_eq!(body["in_reply_to"], msg_id);
    }

    #[tokio::test]
    async fn timed_out_generation_publishes_nothing() {
        let (session, mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Hang));
        let dispatcher = ResponseDispatcher::new(session, generator, fast_config());

        let err = dispatcher
            .on_eligible_message(incoming("hello"), HistorySnapshot::default())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, DispatchError::GenerationTimeout(d) if d == Duration::from_secs(1)));
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn failed_generation_publishes_nothing() {
        let (session, mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Fail));
        let dispatcher = ResponseDispatcher::new(session, generator, fast_config());

        let err = dispatcher
            .on_eligible_message(incoming("hello"), HistorySnapshot::default())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, DispatchError::GenerationFailed(_)));
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn closed_session_reports_publish_error() {
        let (session, mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Reply("hi")));
        let dispatcher = ResponseDispatcher::new(Arc::clone(&session), generator, fast_config());
        session.close().await;
        mock.reset();

        let err = dispatcher
            .on_eligible_message(incoming("hello"), HistorySnapshot::default())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, DispatchError::Publish(SessionError::NotConnected)));
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_publish() {
        let (session, mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Reply("hi")));
        let dispatcher = ResponseDispatcher::new(
            session,
            generator,
            DispatchConfig {
                response_delay_ms: 10_000,
                ..fast_config()
            },
        );

        let handle = dispatcher.on_eligible_message(incoming("hello"), HistorySnapshot::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert!(matches!(handle.await.unwrap(), Err(DispatchError::Cancelled)));
        assert!(mock.published().is_empty());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let (session, mock) = connected().await;
        let mut stub = StubGenerator::new(Behaviour::Reply("ok"));
        stub.work = Duration::from_millis(100);
        let generator = Arc::new(stub);
        let dispatcher = ResponseDispatcher::new(
            session,
            generator.clone(),
            DispatchConfig {
                max_concurrent: 2,
                ..fast_config()
            },
        );

        let handles: Vec<_> = (0..6)
            .map(|i| dispatcher.on_eligible_message(incoming(&format!("q{i}")), HistorySnapshot::default()))
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(generator.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(mock.published_to(CHAT).len(), 6);
    }

    #[tokio::test]
    async fn prompt_carries_recent_context() {
        let (session, _mock) = connected().await;
        let generator = Arc::new(StubGenerator::new(Behaviour::Reply("ok")));
        let dispatcher = ResponseDispatcher::new(session, generator.clone(), fast_config());

        let ring = HistoryRing::new(10);
        for (sender, text) in [("lab-03", "a"), ("lab-04", "b"), ("lab-05", "c"), ("lab-06", "d")] {
            ring.append(Message::new(sender, text, MessageType::General));
        }
        let msg = incoming("anyone know the wifi password?");
        ring.append(msg.clone());

        dispatcher
            .on_eligible_message(msg, ring.snapshot())
            .await
            .unwrap()
            .unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(
            prompts[0],
            "You are a helpful AI assistant in an IoT network. Device lab-02 said: \
             'anyone know the wifi password?'. Recent context: lab-04: b | lab-05: c | lab-06: d. \
             Provide a helpful, concise response."
        );
    }

    #[test]
    fn render_is_single_pass() {
        let msg = incoming("literal {context} and {nope}");
        let prompt = render_prompt(
            "[{own_device_id}] {device_id}: {content} / {context} {unknown",
            &msg,
            &HistorySnapshot::default(),
            "lab-01",
        );
        assert_eq!(prompt, "[lab-01] lab-02: literal {context} and {nope} /  {unknown");
    }

    #[test]
    fn config_defaults() {
        let config: DispatchConfig = toml::from_str("").unwrap();
        assert_eq!(config.response_delay_ms, 2000);
        assert_eq!(config.generation_timeout_secs, 300);
        assert_eq!(config.max_concurrent, 4);
        assert!(config.prompt_template.contains("{context}"));
    }
}

//! E2E tests for inbound chat → policy → dispatcher → published response.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{AgentHarness, StubGenerator, general, immediate};
use mk_device_agent::dispatcher::{DispatchConfig, DispatchError};
use mk_device_agent::policy::PolicyConfig;
use mk_protocol::{Message, MessageType};

fn help_filter_only() -> PolicyConfig {
    PolicyConfig {
        content_filters: vec!["help".into()],
        probability: 0.0,
        ..PolicyConfig::default()
    }
}

/// A matching content filter wins even with probability 0.
#[tokio::test]
async fn e2e_filtered_message_gets_one_response() {
    let generator = Arc::new(StubGenerator::new("The spare filament is in drawer 3."));
    let h = AgentHarness::connected("lab-01", help_filter_only(), immediate(), generator.clone()).await;

    let question = general("lab-02", "Can someone HELP me find filament?");
    let handle = h.deliver(&question).await.expect("response dispatched");
    handle.await.unwrap().unwrap();

    let responses = h.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["device_id"], "lab-01");
    assert_eq!(responses[0]["content"], "The spare filament is in drawer 3.");
    assert_eq!(responses[0]["in_reply_to"], question.id.as_str());
    assert_eq!(generator.calls(), 1);
}

/// Without a filter match, probability 0 means silence.
#[tokio::test]
async fn e2e_unfiltered_message_is_ignored_at_zero_probability() {
    let generator = Arc::new(StubGenerator::new("unused"));
    let h = AgentHarness::connected("lab-01", help_filter_only(), immediate(), generator.clone()).await;

    assert!(h.deliver(&general("lab-02", "nice weather today")).await.is_none());
    assert_eq!(h.history.len(), 1);
    assert!(h.responses().is_empty());
    assert_eq!(generator.calls(), 0);
}

/// A device never answers itself, even when its own message matches a filter.
#[tokio::test]
async fn e2e_own_messages_never_answered() {
    let generator = Arc::new(StubGenerator::new("unused"));
    let h = AgentHarness::connected("lab-01", help_filter_only(), immediate(), generator.clone()).await;

    let own = h.session.messages().create("I can help with that", MessageType::General);
    assert!(h.deliver(&own).await.is_none());
    assert_eq!(generator.calls(), 0);
}

/// Two devices sharing a broker: each answers the other but not itself.
#[tokio::test]
async fn e2e_two_devices_answer_each_other_once() {
    let a = AgentHarness::connected(
        "lab-01",
        PolicyConfig::default(),
        immediate(),
        Arc::new(StubGenerator::new("from lab-01")),
    )
    .await;
    let b = AgentHarness::connected(
        "lab-02",
        PolicyConfig::default(),
        immediate(),
        Arc::new(StubGenerator::new("from lab-02")),
    )
    .await;

    let opener = a.session.messages().create("hello lab", MessageType::General);
    // Broker fan-out: both devices see the opener.
    assert!(a.deliver(&opener).await.is_none());
    b.deliver(&opener).await.unwrap().await.unwrap().unwrap();

    // b's response reaches both; responses are not in the default allow-list.
    let reply: Message = serde_json::from_slice(&b.mqtt.last_published().unwrap().payload).unwrap();
    assert_eq!(reply.message_type, MessageType::Response);
    assert!(a.deliver(&reply).await.is_none());
    assert!(b.deliver(&reply).await.is_none());

    assert!(a.responses().is_empty());
    assert_eq!(b.responses().len(), 1);
    assert_eq!(a.history.len(), 2);
}

/// Slow generation never blocks the inbound loop.
#[tokio::test]
async fn e2e_slow_generation_does_not_block_inbound() {
    let generator = Arc::new(StubGenerator::slow("done", Duration::from_millis(500)));
    let h = AgentHarness::connected("lab-01", PolicyConfig::default(), immediate(), generator).await;

    let started = tokio::time::Instant::now();
    let first = h.deliver(&general("lab-02", "first")).await.unwrap();
    let second = h.deliver(&general("lab-03", "second")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(h.history.len(), 2);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(h.responses().len(), 2);
}

/// A generation that outlives its timeout publishes nothing.
#[tokio::test]
async fn e2e_generation_timeout_publishes_nothing() {
    let generator = Arc::new(StubGenerator::slow("too late", Duration::from_secs(5)));
    let dispatch = DispatchConfig {
        generation_timeout_secs: 1,
        ..immediate()
    };
    let h = AgentHarness::connected("lab-01", PolicyConfig::default(), dispatch, generator).await;

    let result = h
        .deliver(&general("lab-02", "anyone?"))
        .await
        .unwrap()
        .await
        .unwrap();

    assert!(matches!(result, Err(DispatchError::GenerationTimeout(_))));
    assert!(h.responses().is_empty());
}

/// Shutdown abandons a response still waiting out its delay.
#[tokio::test]
async fn e2e_shutdown_abandons_delayed_response() {
    let generator = Arc::new(StubGenerator::new("later"));
    let dispatch = DispatchConfig {
        response_delay_ms: 5_000,
        ..DispatchConfig::default()
    };
    let h = AgentHarness::connected("lab-01", PolicyConfig::default(), dispatch, generator).await;

    let handle = h.deliver(&general("lab-02", "ping?")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.dispatcher.shutdown(Duration::from_secs(1)).await;
    h.session.close().await;

    assert!(matches!(handle.await.unwrap(), Err(DispatchError::Cancelled)));
    assert!(h.responses().is_empty());
}

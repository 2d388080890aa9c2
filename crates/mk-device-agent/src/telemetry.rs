//! Periodic telemetry publisher.
//!
//! Publishes a [`TelemetryReport`] on `devices/{id}/telemetry` at a fixed
//! interval. Ticks while the session is down are skipped.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mk_mqtt_session::SessionManager;
use mk_protocol::TelemetryReport;
use mk_protocol::topics;

use crate::dispatcher::ResponseDispatcher;
use crate::history::HistoryRing;

/// Sources sampled for each report.
pub struct TelemetrySources<'a> {
    pub session: &'a SessionManager,
    pub history: &'a HistoryRing,
    pub dispatcher: &'a ResponseDispatcher,
    pub started: Instant,
}

impl TelemetrySources<'_> {
    pub fn sample(&self) -> TelemetryReport {
        TelemetryReport {
            device_id: self.session.device_id().to_string(),
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            connected: self.session.is_connected(),
            history_len: self.history.len(),
            dispatches_in_flight: self.dispatcher.in_flight(),
            readings: serde_json::Map::new(),
        }
    }
}

/// Run the telemetry loop until `cancel` fires. A zero interval disables it.
pub async fn run(sources: TelemetrySources<'_>, interval: Duration, cancel: &CancellationToken) {
    if interval.is_zero() {
        tracing::info!("telemetry disabled");
        return;
    }

    let topic = topics::telemetry(sources.session.device_id().as_str());
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if !sources.session.is_connected() {
            tracing::debug!("session down, skipping telemetry");
            continue;
        }

        let report = sources.sample();
        if let Err(e) = sources.session.publish_json(&topic, &report).await {
            tracing::warn!(error = %e, "failed to publish telemetry");
        } else {
            tracing::debug!(uptime_secs = report.uptime_secs, "telemetry sent");
        }
    }
}

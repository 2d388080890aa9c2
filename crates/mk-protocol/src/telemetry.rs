use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic telemetry published on `devices/{id}/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the agent started.
    pub uptime_secs: u64,
    /// Whether the broker session was up when the sample was taken.
    pub connected: bool,
    /// Messages currently held in the history ring.
    pub history_len: usize,
    /// Response dispatches still running.
    pub dispatches_in_flight: usize,
    /// Free-form sensor readings.
    #[serde(flatten)]
    pub readings: serde_json::Map<String, serde_json::Value>,
}

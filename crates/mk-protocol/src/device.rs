use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shortest accepted device identifier.
pub const MIN_DEVICE_ID_LEN: usize = 3;
/// Longest accepted device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 50;

/// A device identifier that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id '{id}': {reason}")]
pub struct InvalidDeviceId {
    pub id: String,
    pub reason: &'static str,
}

/// Validated device identifier: 3–50 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidDeviceId> {
        let id = raw.into();
        let reason = if id.len() < MIN_DEVICE_ID_LEN {
            Some("shorter than 3 characters")
        } else if id.len() > MAX_DEVICE_ID_LEN {
            Some("longer than 50 characters")
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            Some("only letters, digits, '-' and '_' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidDeviceId { id, reason }),
            None => Ok(Self(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse device availability reported on the status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Status report published on `devices/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub device_id: String,
    pub status: DeviceStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    pub fn now(device_id: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Identity summary announced after the session comes up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub client_name: String,
    pub authentication_name: String,
    pub certificate_validity_days: u32,
    pub app_deployment_enabled: bool,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        let longest = "x".repeat(50);
        for id in ["abc", "lab-printer_01", "A1-b2_C3", longest.as_str()] {
            assert!(DeviceId::parse(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_short_and_long_ids() {
        assert!(DeviceId::parse("ab").is_err());
        assert!(DeviceId::parse("").is_err());
        let err = DeviceId::parse("x".repeat(51)).unwrap_err();
        assert!(err.reason.contains("longer"));
    }

    #[test]
    fn rejects_forbidden_characters() {
        for id in ["dev ice", "dev/ice", "dev.ice", "dévice", "dev+1"] {
            let err = DeviceId::parse(id).unwrap_err();
            assert_eq!(err.id, id);
        }
    }

    #[test]
    fn deserialize_validates() {
        let ok: DeviceId = serde_json::from_str(r#""rpi-001""#).unwrap();
        assert_eq!(ok.as_str(), "rpi-001");
        assert!(serde_json::from_str::<DeviceId>(r#""no""#).is_err());
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&DeviceStatus::Online).unwrap(),
            r#""online""#
        );
        let report = StatusReport::now("rpi-001", DeviceStatus::Offline);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["device_id"], "rpi-001");
        assert_eq!(json["status"], "offline");
        assert!(json.get("timestamp").is_some());
    }
}

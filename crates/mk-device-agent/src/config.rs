//! Device agent configuration, loadable from TOML with environment overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use mk_mqtt_session::MqttConfig;

use crate::dispatcher::DispatchConfig;
use crate::enrollment::IssuerConfig;
use crate::generator::GeneratorConfig;
use crate::policy::PolicyConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidOverride { var: &'static str, value: String },
}

/// Top-level configuration for the device agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity requested from the issuer. May also come from `DEVICE_ID`.
    #[serde(default)]
    pub device_id: String,
    /// Directory holding the cached certificate files.
    #[serde(default = "default_credential_dir")]
    pub credential_dir: PathBuf,
    /// Telemetry interval in seconds. Zero disables telemetry.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

fn default_credential_dir() -> PathBuf {
    PathBuf::from("./certs")
}

fn default_telemetry_interval() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    crate::history::DEFAULT_CAPACITY
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            credential_dir: default_credential_dir(),
            telemetry_interval_secs: default_telemetry_interval(),
            history_capacity: default_history_capacity(),
            issuer: IssuerConfig::default(),
            mqtt: MqttConfig::default(),
            policy: PolicyConfig::default(),
            dispatch: DispatchConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load from `path`, then apply overrides from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply environment-style overrides. Empty values are ignored.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CERT_SERVICE_URL") {
            self.issuer.url = url;
        }
        if let Some(host) = get("MQTT_HOSTNAME") {
            self.mqtt.broker_host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.mqtt.broker_port = parse_override("MQTT_PORT", port)?;
        }
        if let Some(keepalive) = get("MQTT_KEEPALIVE") {
            self.mqtt.keepalive_secs = parse_override("MQTT_KEEPALIVE", keepalive)?;
        }
        if let Some(id) = get("DEVICE_ID") {
            self.device_id = id;
        }
        if let Some(dir) = get("CERT_DIR") {
            self.credential_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { var, value })
}

//! Enrollment client for the certificate-issuing service.
//!
//! Turns a device id into a cached credential:
//! 1. a complete, valid cache entry is returned without touching the network;
//! 2. otherwise `POST /register-device` issues a new identity, which is
//!    persisted before being returned;
//! 3. a `409 Conflict` means the device was registered before, so the
//!    existing record is fetched from `GET /device/{id}/status` and returned
//!    without writing certificate files. The client keeps it in memory so
//!    later calls stay local.
//!
//! Nothing here retries. Every failure is reported to the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use mk_protocol::{CredentialError, DeviceId, EnrollmentRecord, InvalidDeviceId, RegistrationResponse};

use crate::credential_store::{CredentialStore, StoreError};

/// Where the CA certificate for a new credential comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaCertificateSource {
    /// Only the `caCertificate` field of the registration body.
    Embedded,
    /// Always `GET /ca-certificate`.
    Endpoint,
    /// Embedded when present, endpoint otherwise.
    #[default]
    Auto,
}

/// `[issuer]` configuration table.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// Base URL of the certificate service.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub ca_certificate: CaCertificateSource,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:3000".into()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            ca_certificate: CaCertificateSource::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error(transparent)]
    InvalidDeviceId(#[from] InvalidDeviceId),

    #[error("enrollment failed (status {status:?}): {body}")]
    EnrollmentFailed { status: Option<u16>, body: String },

    #[error("device {device_id} is already registered but its credential cannot be recovered: {reason}")]
    AlreadyRegisteredUnrecoverable { device_id: String, reason: String },

    #[error("issued credential invalid: {0}")]
    CredentialInvalid(#[from] CredentialError),

    #[error("device {0} is not registered")]
    NotRegistered(String),

    #[error("credential store: {0}")]
    Store(#[from] StoreError),
}

impl EnrollError {
    fn transport(e: reqwest::Error) -> Self {
        Self::EnrollmentFailed {
            status: e.status().map(|s| s.as_u16()),
            body: e.to_string(),
        }
    }
}

/// HTTP client for the issuer plus the local credential cache.
pub struct EnrollmentClient {
    http: reqwest::Client,
    config: IssuerConfig,
    store: CredentialStore,
    /// Records recovered after a 409, by device id.
    recovered: Mutex<HashMap<DeviceId, EnrollmentRecord>>,
}

impl EnrollmentClient {
    pub fn new(config: IssuerConfig, store: CredentialStore) -> Result<Self, EnrollError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(EnrollError::transport)?;
        Ok(Self {
            http,
            config,
            store,
            recovered: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn issuer_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    /// Obtain the credential for `device_id`, enrolling if nothing is cached.
    pub async fn enroll(&self, device_id: &str) -> Result<EnrollmentRecord, EnrollError> {
        let device_id = DeviceId::parse(device_id)?;

        if let Some(record) = self.recovered_record(&device_id) {
            tracing::info!(device_id = %device_id, "using recovered credential");
            return Ok(record);
        }
        if let Some(record) = self.store.load(&device_id)? {
            tracing::info!(device_id = %device_id, "using cached credential");
            return Ok(record);
        }

        let url = format!("{}/register-device", self.issuer_url());
        tracing::info!(device_id = %device_id, %url, "registering device");
        let requested_at = Utc::now();

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "deviceId": device_id }))
            .send()
            .await
            .map_err(EnrollError::transport)?;

        let status = response.status();
        if status == StatusCode::OK {
            let body: RegistrationResponse =
                response
                    .json()
                    .await
                    .map_err(|e| EnrollError::EnrollmentFailed {
                        status: Some(status.as_u16()),
                        body: format!("malformed registration body: {e}"),
                    })?;
            let record = self.build_record(body, requested_at).await?;
            self.store.save(&record)?;
            tracing::info!(
                device_id = %device_id,
                validity_days = record.credential.validity_days,
                "device registered"
            );
            return Ok(record);
        }

        if status == StatusCode::CONFLICT {
            return self.recover_registered(&device_id).await;
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(device_id = %device_id, status = status.as_u16(), %body, "registration rejected");
        Err(EnrollError::EnrollmentFailed {
            status: Some(status.as_u16()),
            body,
        })
    }

    fn recovered_record(&self, device_id: &DeviceId) -> Option<EnrollmentRecord> {
        self.recovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Rebuild the record of an already-registered device. Kept in memory,
    /// never written to the store.
    async fn recover_registered(&self, device_id: &DeviceId) -> Result<EnrollmentRecord, EnrollError> {
        tracing::info!(device_id = %device_id, "device already registered, fetching status");
        let unrecoverable = |reason: String| EnrollError::AlreadyRegisteredUnrecoverable {
            device_id: device_id.to_string(),
            reason,
        };

        let body = self
            .device_status(device_id.as_str())
            .await
            .map_err(|e| unrecoverable(e.to_string()))?;
        if !body.has_key_material() {
            return Err(unrecoverable("status record carries no key material".into()));
        }

        let record = self
            .build_record(body, Utc::now())
            .await
            .map_err(|e| unrecoverable(e.to_string()))?;
        tracing::info!(device_id = %device_id, "recovered existing registration");
        self.recovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.clone(), record.clone());
        Ok(record)
    }

    async fn build_record(
        &self,
        body: RegistrationResponse,
        requested_at: DateTime<Utc>,
    ) -> Result<EnrollmentRecord, EnrollError> {
        let ca = match (self.config.ca_certificate, body.embedded_ca()) {
            (CaCertificateSource::Embedded | CaCertificateSource::Auto, Some(ca)) => ca.to_string(),
            // Left empty; credential validation reports it.
            (CaCertificateSource::Embedded, None) => String::new(),
            (CaCertificateSource::Endpoint, _) | (CaCertificateSource::Auto, None) => {
                self.fetch_ca_certificate().await?
            }
        };

        let app_deployment = body.app_deployment.clone();
        let credential = body.into_credential(ca)?;
        Ok(EnrollmentRecord {
            credential,
            issuer_url: self.issuer_url().to_string(),
            requested_at,
            app_deployment,
        })
    }

    /// `GET /device/{id}/status`.
    pub async fn device_status(&self, device_id: &str) -> Result<RegistrationResponse, EnrollError> {
        let device_id = DeviceId::parse(device_id)?;
        let url = format!("{}/device/{}/status", self.issuer_url(), device_id);
        let response = self.get(&url, &device_id).await?;
        response
            .json()
            .await
            .map_err(|e| EnrollError::EnrollmentFailed {
                status: None,
                body: format!("malformed status body: {e}"),
            })
    }

    /// `GET /device/{id}/app-status`: app deployment descriptor, if any.
    pub async fn app_status(&self, device_id: &str) -> Result<serde_json::Value, EnrollError> {
        let device_id = DeviceId::parse(device_id)?;
        let url = format!("{}/device/{}/app-status", self.issuer_url(), device_id);
        let response = self.get(&url, &device_id).await?;
        response
            .json()
            .await
            .map_err(|e| EnrollError::EnrollmentFailed {
                status: None,
                body: format!("malformed app status body: {e}"),
            })
    }

    /// `GET /ca-certificate`: the issuer's CA as PEM text.
    pub async fn fetch_ca_certificate(&self) -> Result<String, EnrollError> {
        let url = format!("{}/ca-certificate", self.issuer_url());
        tracing::debug!(%url, "fetching CA certificate");
        let response = self.http.get(&url).send().await.map_err(EnrollError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(EnrollError::transport)?;
        if !status.is_success() {
            return Err(EnrollError::EnrollmentFailed {
                status: Some(status.as_u16()),
                body,
            });
        }
        Ok(body)
    }

    async fn get(&self, url: &str, device_id: &DeviceId) -> Result<reqwest::Response, EnrollError> {
        let response = self.http.get(url).send().await.map_err(EnrollError::transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EnrollError::NotRegistered(device_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnrollError::EnrollmentFailed {
                status: Some(status.as_u16()),
                body,
            });
        }
        Ok(response)
    }
}

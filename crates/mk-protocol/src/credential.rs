use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, InvalidDeviceId};
use crate::pem;

/// Default MQTT-over-TLS port.
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Default certificate lifetime when the issuer omits it.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Reasons a credential (cached or freshly issued) is unusable.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("{field} is empty")]
    Empty { field: &'static str },

    #[error("{field} is not valid PEM: {reason}")]
    MalformedPem { field: &'static str, reason: String },

    #[error("certificate subject '{subject}' does not encode device id '{device_id}'")]
    SubjectMismatch { subject: String, device_id: String },

    #[error("validity_days must be at least 1")]
    Validity,

    #[error("issuer response missing {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    DeviceId(#[from] InvalidDeviceId),
}

/// Identity issued by the certificate service.
///
/// Immutable once built: re-enrollment produces a new value rather than
/// mutating an existing one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub device_id: DeviceId,
    pub authentication_name: String,
    pub client_name: String,
    #[serde(rename = "certificate")]
    pub certificate_pem: String,
    #[serde(rename = "privateKey")]
    pub private_key_pem: String,
    #[serde(rename = "caCertificate")]
    pub ca_certificate_pem: String,
    pub validity_days: u32,
    #[serde(rename = "mqttHostname")]
    pub broker_hostname: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

impl Credential {
    /// Check the credential invariants: three non-empty, well-formed PEM
    /// blocks and a certificate subject that names this device.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.validity_days < 1 {
            return Err(CredentialError::Validity);
        }

        let subject = pem::certificate_subject(&self.certificate_pem, "device certificate")?;
        if !subject.encodes(self.device_id.as_str()) {
            return Err(CredentialError::SubjectMismatch {
                subject: subject.rendered,
                device_id: self.device_id.to_string(),
            });
        }

        pem::check_private_key(&self.private_key_pem, "private key")?;
        pem::certificate_subject(&self.ca_certificate_pem, "CA certificate")?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("device_id", &self.device_id)
            .field("authentication_name", &self.authentication_name)
            .field("client_name", &self.client_name)
            .field("certificate_pem", &format_args!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("ca_certificate_pem", &format_args!("{} bytes", self.ca_certificate_pem.len()))
            .field("validity_days", &self.validity_days)
            .field("broker_hostname", &self.broker_hostname)
            .field("broker_port", &self.broker_port)
            .finish()
    }
}

/// Credential plus the metadata of the enrollment that produced it.
///
/// Serialized as the `registration.json` sidecar next to the PEM files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    #[serde(flatten)]
    pub credential: Credential,
    pub issuer_url: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_deployment: Option<serde_json::Value>,
}

/// Connection hints the issuer attaches to a registration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionInstructions {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Body returned by `POST /register-device` and `GET /device/{id}/status`.
///
/// Issuers differ in field casing and in whether the CA certificate is
/// embedded; both shapes deserialize here and the CA gap is filled by the
/// caller before conversion.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    #[serde(alias = "device_id")]
    pub device_id: String,
    #[serde(default, alias = "authentication_name")]
    pub authentication_name: String,
    #[serde(default, alias = "client_name")]
    pub client_name: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default, alias = "private_key")]
    pub private_key: String,
    #[serde(default, alias = "ca_certificate")]
    pub ca_certificate: Option<String>,
    #[serde(default = "default_validity_days", alias = "validity_days")]
    pub validity_days: u32,
    #[serde(default, alias = "mqtt_hostname")]
    pub mqtt_hostname: String,
    #[serde(default)]
    pub instructions: ConnectionInstructions,
    #[serde(default, alias = "app_deployment")]
    pub app_deployment: Option<serde_json::Value>,
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl RegistrationResponse {
    /// The embedded CA certificate, if the issuer sent a non-empty one.
    pub fn embedded_ca(&self) -> Option<&str> {
        self.ca_certificate
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
    }

    /// True when the body carries certificate and key material at all.
    /// Status lookups for devices without retrievable keys return only
    /// bookkeeping fields.
    pub fn has_key_material(&self) -> bool {
        !self.certificate.trim().is_empty() && !self.private_key.trim().is_empty()
    }

    /// Build and validate a credential, using `ca_certificate` as the CA.
    pub fn into_credential(self, ca_certificate: String) -> Result<Credential, CredentialError> {
        let device_id = DeviceId::parse(self.device_id)?;
        if self.certificate.trim().is_empty() {
            return Err(CredentialError::MissingField("certificate"));
        }
        if self.private_key.trim().is_empty() {
            return Err(CredentialError::MissingField("privateKey"));
        }

        let client_name = if self.client_name.is_empty() {
            device_id.to_string()
        } else {
            self.client_name
        };

        let credential = Credential {
            authentication_name: self.authentication_name,
            client_name,
            certificate_pem: self.certificate,
            private_key_pem: self.private_key,
            ca_certificate_pem: ca_certificate,
            validity_days: self.validity_days,
            broker_hostname: self.mqtt_hostname,
            broker_port: self.instructions.port.unwrap_or(DEFAULT_BROKER_PORT),
            device_id,
        };
        credential.validate()?;
        Ok(credential)
    }
}

impl fmt::Debug for RegistrationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationResponse")
            .field("device_id", &self.device_id)
            .field("authentication_name", &self.authentication_name)
            .field("client_name", &self.client_name)
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .field("ca_certificate", &self.ca_certificate.as_ref().map(String::len))
            .field("validity_days", &self.validity_days)
            .field("mqtt_hostname", &self.mqtt_hostname)
            .field("instructions", &self.instructions)
            .field("app_deployment", &self.app_deployment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Material, material};
    use serde_json::json;

    fn response_json(device_id: &str, m: &Material) -> serde_json::Value {
        json!({
            "success": true,
            "deviceId": device_id,
            "authenticationName": format!("{device_id}-authnID"),
            "clientName": format!("client-{device_id}"),
            "certificate": m.cert,
            "privateKey": m.key,
            "caCertificate": m.ca,
            "validityDays": 30,
            "mqttHostname": "broker.example.com",
            "instructions": {"port": 8883, "topic": "devices/x/telemetry"},
        })
    }

    #[test]
    fn registration_converts_to_valid_credential() {
        let m = material("lab-01");
        let resp: RegistrationResponse =
            serde_json::from_value(response_json("lab-01", &m)).unwrap();
        let ca = resp.embedded_ca().unwrap().to_string();
        let credential = resp.into_credential(ca).unwrap();

        assert_eq!(credential.device_id.as_str(), "lab-01");
        assert_eq!(credential.client_name, "client-lab-01");
        assert_eq!(credential.validity_days, 30);
        assert_eq!(credential.broker_port, 8883);
        assert!(credential.is_valid());
    }

    #[test]
    fn snake_case_shape_accepted() {
        let m = material("lab-02");
        let body = json!({
            "device_id": "lab-02",
            "authentication_name": "lab-02",
            "client_name": "lab-02",
            "certificate": m.cert,
            "private_key": m.key,
            "ca_certificate": m.ca,
            "validity_days": 7,
            "mqtt_hostname": "broker.example.com",
        });
        let resp: RegistrationResponse = serde_json::from_value(body).unwrap();
        assert!(resp.has_key_material());
        let ca = resp.embedded_ca().unwrap().to_string();
        let credential = resp.into_credential(ca).unwrap();
        assert_eq!(credential.validity_days, 7);
    }

    #[test]
    fn subject_mismatch_rejected() {
        let m = material("someone-else");
        let resp: RegistrationResponse =
            serde_json::from_value(response_json("lab-03", &m)).unwrap();
        let err = resp.into_credential(m.ca.clone()).unwrap_err();
        assert!(matches!(err, CredentialError::SubjectMismatch { .. }));
    }

    #[test]
    fn empty_ca_rejected() {
        let m = material("lab-04");
        let mut body = response_json("lab-04", &m);
        body["caCertificate"] = json!("");
        let resp: RegistrationResponse = serde_json::from_value(body).unwrap();
        assert!(resp.embedded_ca().is_none());
        let err = resp.into_credential(String::new()).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Empty {
                field: "CA certificate"
            }
        ));
    }

    #[test]
    fn missing_key_reported() {
        let m = material("lab-05");
        let mut body = response_json("lab-05", &m);
        body.as_object_mut().unwrap().remove("privateKey");
        let resp: RegistrationResponse = serde_json::from_value(body).unwrap();
        assert!(!resp.has_key_material());
        let err = resp.into_credential(m.ca.clone()).unwrap_err();
        assert!(matches!(err, CredentialError::MissingField("privateKey")));
    }

    #[test]
    fn debug_redacts_private_key() {
        let m = material("lab-06");
        let resp: RegistrationResponse =
            serde_json::from_value(response_json("lab-06", &m)).unwrap();
        let debug = format!("{resp:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("PRIVATE KEY"));

        let credential = resp.into_credential(m.ca.clone()).unwrap();
        let debug = format!("{credential:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn record_sidecar_has_flat_device_id() {
        let m = material("lab-07");
        let resp: RegistrationResponse =
            serde_json::from_value(response_json("lab-07", &m)).unwrap();
        let record = EnrollmentRecord {
            credential: resp.into_credential(m.ca.clone()).unwrap(),
            issuer_url: "http://issuer".into(),
            requested_at: Utc::now(),
            app_deployment: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["deviceId"], "lab-07");
        assert_eq!(json["issuerUrl"], "http://issuer");
        assert!(json.get("appDeployment").is_none());

        let back: EnrollmentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}

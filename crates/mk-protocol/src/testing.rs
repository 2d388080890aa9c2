//! Certificate and credential fixtures for tests in dependent crates.
//!
//! Enabled with the `test-util` feature.

use chrono::Utc;
use rcgen::{CertificateParams, DnType, KeyPair};
use serde_json::json;

use crate::credential::{Credential, EnrollmentRecord};
use crate::device::DeviceId;

/// PEM material for one device.
pub struct Material {
    pub cert: String,
    pub key: String,
    pub ca: String,
}

/// CA-signed device certificate whose common name is `cn`.
pub fn material(cn: &str) -> Material {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "makerspace-test-ca");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

    Material {
        cert: cert.pem(),
        key: key.serialize_pem(),
        ca: ca.pem(),
    }
}

/// Issuer body for `POST /register-device` and `GET /device/{id}/status`.
pub fn registration_json(device_id: &str, m: &Material) -> serde_json::Value {
    json!({
        "success": true,
        "deviceId": device_id,
        "authenticationName": format!("{device_id}-authnID"),
        "clientName": device_id,
        "certificate": m.cert,
        "privateKey": m.key,
        "caCertificate": m.ca,
        "validityDays": 365,
        "mqttHostname": "broker.makerspace.test",
        "instructions": {"port": 8883},
    })
}

pub fn credential_for(device_id: &str) -> Credential {
    let m = material(device_id);
    Credential {
        device_id: DeviceId::parse(device_id).unwrap(),
        authentication_name: format!("{device_id}-authnID"),
        client_name: device_id.to_string(),
        certificate_pem: m.cert,
        private_key_pem: m.key,
        ca_certificate_pem: m.ca,
        validity_days: 365,
        broker_hostname: "broker.makerspace.test".into(),
        broker_port: 8883,
    }
}

pub fn record_for(device_id: &str) -> EnrollmentRecord {
    EnrollmentRecord {
        credential: credential_for(device_id),
        issuer_url: "http://issuer.test".into(),
        requested_at: Utc::now(),
        app_deployment: None,
    }
}

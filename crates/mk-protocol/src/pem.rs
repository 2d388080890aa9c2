//! PEM and X.509 inspection for issued credentials.
//!
//! Only structural checks: the block decodes, carries the expected label,
//! and (for certificates) parses as DER X.509. Chain verification is left
//! to the TLS stack at connect time.

use x509_parser::pem::{Pem, parse_x509_pem};

use crate::credential::CredentialError;

/// Subject details extracted from a device certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSubject {
    /// Rendered subject, e.g. `CN=lab-printer-01, O=Makerspace`.
    pub rendered: String,
    /// All common names present in the subject.
    pub common_names: Vec<String>,
}

/// Suffix issuers append to the device id in the authentication CN.
pub const AUTHN_SUFFIX: &str = "-authnID";

impl CertificateSubject {
    /// True when a common name is `device_id` or `device_id` plus
    /// [`AUTHN_SUFFIX`]. Other subject attributes are never consulted.
    pub fn encodes(&self, device_id: &str) -> bool {
        !device_id.is_empty()
            && self.common_names.iter().any(|cn| {
                cn == device_id || cn.strip_suffix(AUTHN_SUFFIX) == Some(device_id)
            })
    }
}

fn decode_block(text: &str, field: &'static str) -> Result<Pem, CredentialError> {
    if text.trim().is_empty() {
        return Err(CredentialError::Empty { field });
    }
    let (_, pem) = parse_x509_pem(text.as_bytes()).map_err(|e| CredentialError::MalformedPem {
        field,
        reason: e.to_string(),
    })?;
    if pem.contents.is_empty() {
        return Err(CredentialError::MalformedPem {
            field,
            reason: "empty PEM body".into(),
        });
    }
    Ok(pem)
}

/// Decode a certificate PEM and return its subject.
pub fn certificate_subject(
    text: &str,
    field: &'static str,
) -> Result<CertificateSubject, CredentialError> {
    let pem = decode_block(text, field)?;
    if pem.label != "CERTIFICATE" {
        return Err(CredentialError::MalformedPem {
            field,
            reason: format!("expected CERTIFICATE block, found {}", pem.label),
        });
    }

    let cert = pem.parse_x509().map_err(|e| CredentialError::MalformedPem {
        field,
        reason: e.to_string(),
    })?;

    let subject = cert.subject();
    let common_names = subject
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .map(str::to_string)
        .collect();

    Ok(CertificateSubject {
        rendered: subject.to_string(),
        common_names,
    })
}

/// Check that `text` holds a private key block (PKCS#8, RSA or EC).
pub fn check_private_key(text: &str, field: &'static str) -> Result<(), CredentialError> {
    let pem = decode_block(text, field)?;
    if !pem.label.ends_with("PRIVATE KEY") {
        return Err(CredentialError::MalformedPem {
            field,
            reason: format!("expected PRIVATE KEY block, found {}", pem.label),
        });
    }
    Ok(())
}

//! TLS configuration for mTLS connections to the makerspace broker.
//!
//! The transport is built from the PEM text held by an issued
//! [`Credential`], so the session never re-reads key material from disk.

use rumqttc::{TlsConfiguration, Transport};

use mk_protocol::Credential;

use crate::error::SessionResult;

/// Build a TLS transport from a credential's certificate, key and CA.
///
/// The credential is validated first; an unusable credential fails here
/// with [`SessionError::CredentialInvalid`](crate::SessionError::CredentialInvalid)
/// before any socket is opened.
pub fn tls_transport(credential: &Credential) -> SessionResult<Transport> {
    credential.validate()?;

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: credential.ca_certificate_pem.as_bytes().to_vec(),
        alpn: None,
        client_auth: Some((
            credential.certificate_pem.as_bytes().to_vec(),
            credential.private_key_pem.as_bytes().to_vec(),
        )),
    }))
}

/// Plain TCP transport (local broker / dev mode).
pub fn plaintext_transport() -> Transport {
    Transport::Tcp
}

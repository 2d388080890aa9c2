//! Session error types.

use std::time::Duration;

use mk_protocol::CredentialError;
use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced by session operations.
///
/// Every variant is reported to the caller that initiated the action;
/// the session never retries on its own.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credential invalid: {0}")]
    CredentialInvalid(#[from] CredentialError),

    #[error("no connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),

    #[error("broker refused connection: {0}")]
    ConnectRefused(String),

    #[error("session not connected")]
    NotConnected,

    #[error("operation not allowed while session is {0}")]
    InvalidState(SessionState),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for session results.
pub type SessionResult<T> = Result<T, SessionError>;

//! Client error types.

use std::time::Duration;

use thiserror::Error;

/// Transport and protocol errors.
///
/// Connection-level variants (`WebSocket`, `Connection`, `Timeout`, `NotConnected`) are
/// absorbed by the relay actor and retried; callers see them only from explicit
/// single-relay operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("no relays configured")]
    NoRelays,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failures surfaced to the caller of `sign`.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("no signing method available: {0}")]
    Unavailable(String),

    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("signer did not respond within {0:?}")]
    Timeout(Duration),
}

impl From<nostr::Nip01Error> for SignError {
    fn from(error: nostr::Nip01Error) -> Self {
        Self::Rejected(error.to_string())
    }
}

/// Failures of sign-then-publish.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Signing(#[from] SignError),

    #[error(transparent)]
    Transport(#[from] ClientError),
}

/// Failures surfaced to the caller of report submission.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid report: {0}")]
    Invalid(#[from] nostr::Nip56Error),

    #[error(transparent)]
    Signing(#[from] SignError),

    #[error(transparent)]
    Transport(#[from] ClientError),

    #[error("no relay accepted report {event_id}: {reasons}")]
    NotAccepted { event_id: String, reasons: String },
}

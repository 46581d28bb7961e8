//! Error types for the relay pipeline
//!
//! Errors are grouped by how they propagate. Worker-level failures (`SpawnError`,
//! `WorkerCrash`) end a session and are surfaced to the user's devices, while
//! delivery-level failures are classified by `TransportError` so the delivery service
//! can decide between retrying, dropping a device, or raising an operator alarm.
//! Duplicates and oversized payloads are not errors at all and never show up here.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Worker failed to start: {0}")]
    SpawnError(String),
    #[error("Worker for session '{session_id}' crashed: {message}")]
    WorkerCrash { session_id: String, message: String },
    #[error("Worker for session '{0}' stalled")]
    StallTimeout(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session '{0}' is terminated")]
    SessionTerminated(String),
    #[error("Queue for session '{0}' is closed")]
    QueueClosed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Delivery failed: {0}")]
    DeliveryError(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    /// Whether the error means the session's worker is gone for good.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            RelayError::SpawnError(_)
                | RelayError::WorkerCrash { .. }
                | RelayError::SessionTerminated(_)
        )
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

/// Outcome classes reported by a push transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The token is permanently invalid; the device must be removed.
    #[error("Push token rejected as invalid")]
    BadToken,
    /// The service's provider credential is expired or revoked. Needs an operator.
    #[error("Push provider credential expired")]
    ExpiredCredential,
    /// Anything that may succeed on a later attempt.
    #[error("Transient push failure: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Transient(err.to_string())
    }
}

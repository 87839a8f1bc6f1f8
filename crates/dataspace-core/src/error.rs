// ── Core error types ──
//
// Caller-facing errors from dataspace-core. Consumers never see broker
// return codes or raw transport failures directly. The
// `From<dataspace_api::Error>` impl translates transport-layer errors
// into domain-appropriate variants.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to broker at {server}: {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Broker connection closed")]
    Disconnected,

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    // ── Input errors ─────────────────────────────────────────────────
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid JSON path {path:?}: {reason}")]
    InvalidJsonPath { path: String, reason: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("{topic} is not a directory: {reason}")]
    NotADirectory { topic: String, reason: String },

    #[error("Cannot decode payload of {topic}: {reason}")]
    Decode { topic: String, reason: String },

    // ── Control-plane errors ─────────────────────────────────────────
    #[error("Broker rejected {command}: {message}")]
    Rejected { command: String, message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns `true` if retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Disconnected | Self::Timeout { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<dataspace_api::Error> for CoreError {
    fn from(err: dataspace_api::Error) -> Self {
        match err {
            dataspace_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            dataspace_api::Error::Connect(reason) => CoreError::ConnectionFailed {
                server: String::new(),
                reason,
            },
            dataspace_api::Error::RetriesExhausted { attempts, reason } => {
                CoreError::ConnectionFailed {
                    server: String::new(),
                    reason: format!("gave up after {attempts} attempts: {reason}"),
                }
            }
            dataspace_api::Error::Request(message) => {
                CoreError::Internal(format!("transport request failed: {message}"))
            }
            dataspace_api::Error::Closed => CoreError::Disconnected,
            dataspace_api::Error::UnsupportedScheme(scheme) => CoreError::Config {
                message: format!("unsupported scheme {scheme:?}"),
            },
            dataspace_api::Error::InvalidEndpoint(message) => CoreError::Config { message },
        }
    }
}

use thiserror::Error;

/// Top-level error type for the `dataspace-api` crate.
///
/// Covers every failure a transport can report: refused credentials,
/// connection loss, request queue failures, and endpoint problems.
/// `dataspace-core` maps these into caller-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The broker refused the supplied credentials.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Connecting to the broker failed (refused, DNS, TLS, ...).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The reconnect budget is exhausted.
    #[error("Gave up reconnecting after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// The outbound request could not be queued.
    #[error("Request rejected by transport: {0}")]
    Request(String),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,

    // ── Endpoint ────────────────────────────────────────────────────
    /// Scheme is recognised but has no transport implementation.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Endpoint could not be interpreted.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// Returns `true` if this error indicates the credentials were rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Request(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(Error::Connect("refused".into()).is_transient());
        assert!(!Error::Closed.is_transient());
        assert!(
            Error::Authentication {
                message: "bad password".into()
            }
            .is_auth()
        );
    }
}

//! Error taxonomy for the client layer.
//!
//! Transport and HTTP failures are classified here so the retry policy can
//! decide without inspecting strings: `is_retryable` says whether another
//! attempt could succeed, `is_ambiguous` says whether the failed attempt may
//! already have been processed by the server.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Failure modes of a single transport exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionRefused,
    Timeout,
    DnsFailure,
    TlsFailure,
    /// The exchange broke after the request may have been delivered.
    Interrupted,
}

impl TransportErrorKind {
    pub fn is_ambiguous(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Timeout | TransportErrorKind::Interrupted
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::ConnectionRefused => write!(f, "connection refused"),
            TransportErrorKind::Timeout => write!(f, "timed out"),
            TransportErrorKind::DnsFailure => write!(f, "dns failure"),
            TransportErrorKind::TlsFailure => write!(f, "tls failure"),
            TransportErrorKind::Interrupted => write!(f, "connection interrupted"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Internal cache failures. These never fail a call; the client logs them
/// and goes to the network instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("response cache is disabled (capacity is 0)")]
    Disabled,
    #[error("response cache lock is poisoned")]
    Poisoned,
    #[error("cache persistence failed: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Server supplied `Retry-After` hint, if any.
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to decode response body: {0}")]
    Decode(String),

    #[error("Failed to encode request body: {0}")]
    Encode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClientError>,
    },
}

impl ClientError {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        ClientError::Http {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    /// HTTP status carried by this error, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Connection failures, timeouts, 5xx and 429 may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Whether the server may have acted on the request before it failed.
    /// 429 and 503 explicitly mean "not processed".
    pub fn is_ambiguous(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.kind.is_ambiguous(),
            ClientError::Http { status, .. } => (500..=599).contains(status) && *status != 503,
            _ => false,
        }
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, ClientError::Http { status: 401, .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        for kind in [
            TransportErrorKind::ConnectionRefused,
            TransportErrorKind::Timeout,
            TransportErrorKind::DnsFailure,
            TransportErrorKind::TlsFailure,
            TransportErrorKind::Interrupted,
        ] {
            let err = ClientError::from(TransportError::new(kind, "boom"));
            assert!(err.is_retryable(), "{kind} should be retryable");
        }
    }

    #[test]
    fn test_only_timeouts_and_interruptions_are_ambiguous() {
        let timeout = ClientError::from(TransportError::new(TransportErrorKind::Timeout, "t"));
        assert!(timeout.is_ambiguous());

        let refused =
            ClientError::from(TransportError::new(TransportErrorKind::ConnectionRefused, "r"));
        assert!(!refused.is_ambiguous());
    }

    #[test]
    fn test_http_classification() {
        assert!(ClientError::http(500, "").is_retryable());
        assert!(ClientError::http(500, "").is_ambiguous());
        assert!(ClientError::http(503, "").is_retryable());
        assert!(!ClientError::http(503, "").is_ambiguous());
        assert!(ClientError::http(429, "").is_retryable());
        assert!(!ClientError::http(429, "").is_ambiguous());

        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!ClientError::http(status, "").is_retryable());
        }
    }

    #[test]
    fn test_auth_rejection() {
        assert!(ClientError::http(401, "").is_auth_rejection());
        assert!(!ClientError::http(403, "").is_auth_rejection());
        assert!(!ClientError::Auth("nope".into()).is_auth_rejection());
    }

    #[test]
    fn test_non_http_errors_are_terminal() {
        assert!(!ClientError::Decode("bad json".into()).is_retryable());
        assert!(!ClientError::Auth("refresh failed".into()).is_retryable());
        assert!(!ClientError::Cache(CacheError::Disabled).is_retryable());
    }

    #[test]
    fn test_status_looks_through_exhaustion() {
        let err = ClientError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ClientError::http(502, "bad gateway")),
        };
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("502"));
    }
}

//! Common error types for CloudShelf.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for CloudShelf operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Credential is unusable: nonce mismatch, revoked refresh token,
    /// or not yet authorized.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Remote store stayed unreachable after the retry budget was spent.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Remote store rejected the request; retrying will not help.
    #[error("Remote rejected request: {0}")]
    PermanentRemote(String),

    /// Invalid input or configuration.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Content hash of the remote copy does not match the local bytes.
    #[error("Integrity error: expected {expected}, got {actual}")]
    Integrity {
        /// Hash of the local bytes.
        expected: String,
        /// Hash reported by the remote store.
        actual: String,
    },

    /// Caller is not allowed to read the file.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Local cache read or write failed.
    #[error("Cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Host status store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error means the credential cannot be used until a
    /// human re-authorizes.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// HTTP 429 or a provider-specific rate limit.
    RateLimited,
    /// HTTP 5xx.
    Server,
    /// Connection failure or timeout before a response arrived.
    Network,
    /// HTTP 401 or an `invalid_grant` token response.
    Unauthorized,
    /// HTTP 404.
    NotFound,
    /// Any other rejection (4xx, malformed response).
    Rejected,
}

/// Typed outcome of a single remote call.
///
/// Remote clients return this instead of [`Error`] so the backoff executor
/// can decide retries from the kind alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// What went wrong.
    pub kind: RemoteErrorKind,
    /// Human readable detail.
    pub message: String,
    /// Server-provided `Retry-After` hint.
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    /// Create a remote error of the given kind.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Shorthand for a rate-limit response.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::RateLimited, message)
    }

    /// Shorthand for a 5xx response.
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Server, message)
    }

    /// Shorthand for a connection failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    /// Shorthand for an authorization failure.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unauthorized, message)
    }

    /// Shorthand for a missing object.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    /// Shorthand for a permanent rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    /// Attach a `Retry-After` hint.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Classify an HTTP status code. Returns `None` for success codes.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        let kind = match status {
            200..=399 => return None,
            401 => RemoteErrorKind::Unauthorized,
            404 => RemoteErrorKind::NotFound,
            429 => RemoteErrorKind::RateLimited,
            500..=599 => RemoteErrorKind::Server,
            _ => RemoteErrorKind::Rejected,
        };
        Some(Self::new(kind, message))
    }

    /// Rate limits, server errors and network failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::RateLimited | RemoteErrorKind::Server | RemoteErrorKind::Network
        )
    }

    /// Convert a non-retryable failure into the crate error taxonomy.
    pub fn into_permanent(self) -> Error {
        match self.kind {
            RemoteErrorKind::Unauthorized => Error::Auth(self.message),
            RemoteErrorKind::NotFound => Error::NotFound(self.message),
            _ => Error::PermanentRemote(self.message),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Result of a single remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(200, "ok").is_none());
        assert!(RemoteError::from_status(206, "partial").is_none());
        assert_eq!(
            RemoteError::from_status(429, "slow down").unwrap().kind,
            RemoteErrorKind::RateLimited
        );
        assert_eq!(
            RemoteError::from_status(503, "unavailable").unwrap().kind,
            RemoteErrorKind::Server
        );
        assert_eq!(
            RemoteError::from_status(400, "bad").unwrap().kind,
            RemoteErrorKind::Rejected
        );
        assert_eq!(
            RemoteError::from_status(404, "gone").unwrap().kind,
            RemoteErrorKind::NotFound
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(RemoteError::rate_limited("x").is_retryable());
        assert!(RemoteError::server("x").is_retryable());
        assert!(RemoteError::network("x").is_retryable());
        assert!(!RemoteError::rejected("x").is_retryable());
        assert!(!RemoteError::unauthorized("x").is_retryable());
        assert!(!RemoteError::not_found("x").is_retryable());
    }

    #[test]
    fn test_into_permanent_mapping() {
        assert!(matches!(
            RemoteError::unauthorized("revoked").into_permanent(),
            Error::Auth(_)
        ));
        assert!(matches!(
            RemoteError::not_found("gone").into_permanent(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            RemoteError::rejected("quota").into_permanent(),
            Error::PermanentRemote(_)
        ));
    }
}

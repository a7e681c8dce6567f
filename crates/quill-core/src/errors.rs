use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse classification shared by every error type in the workspace.
///
/// The retry wrapper decides on kinds, never on concrete error types, so an
/// allow-list of kinds is all a caller needs to describe what is retryable.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Transient dependency failures
    Network,
    Timeout,
    ServerError,
    RateLimited,
    Overloaded,
    CircuitOpen,

    // Caller mistakes, never retried
    InvalidInput,
    InvalidRequest,
    Authentication,
    Parse,

    // Operational
    Storage,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Kinds retried by default: network-level trouble and an open breaker.
    pub const TRANSIENT: &'static [ErrorKind] = &[
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::ServerError,
        ErrorKind::RateLimited,
        ErrorKind::Overloaded,
        ErrorKind::CircuitOpen,
    ];

    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidInput => "invalid_input",
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::Parse => "parse",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error that can flow through the retry wrapper or the
/// circuit breaker.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Wait the failing side asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Errors returned by the remote content-generation dependency.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RemoteError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

impl Classify for RemoteError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed(_) => ErrorKind::Authentication,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::MalformedResponse(_) => ErrorKind::Parse,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised by core data-model and configuration rules.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::Internal,
            Self::InvalidInput(_) | Self::InvalidConfig(_) => ErrorKind::InvalidInput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::RateLimited { retry_after: None }.is_retryable());
        assert!(RemoteError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(RemoteError::Overloaded.is_retryable());
        assert!(RemoteError::Network("tcp reset".into()).is_retryable());
        assert!(RemoteError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(RemoteError::CircuitOpen("openrouter".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(!RemoteError::AuthenticationFailed("bad key".into()).is_retryable());
        assert!(!RemoteError::InvalidRequest("bad".into()).is_retryable());
        assert!(!RemoteError::MalformedResponse("no choices".into()).is_retryable());
        assert!(!RemoteError::Cancelled.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert_eq!(RemoteError::from_status(401, "x".into()).kind(), ErrorKind::Authentication);
        assert_eq!(RemoteError::from_status(403, "x".into()).kind(), ErrorKind::Authentication);
        assert_eq!(RemoteError::from_status(400, "x".into()).kind(), ErrorKind::InvalidRequest);
        assert_eq!(RemoteError::from_status(429, "x".into()).kind(), ErrorKind::RateLimited);
        assert_eq!(RemoteError::from_status(529, "x".into()).kind(), ErrorKind::Overloaded);
        assert_eq!(RemoteError::from_status(502, "x".into()).kind(), ErrorKind::ServerError);
        assert_eq!(RemoteError::from_status(302, "x".into()).kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn circuit_open_is_transient() {
        assert!(ErrorKind::CircuitOpen.is_transient());
        assert!(!ErrorKind::InvalidInput.is_transient());
        assert!(!ErrorKind::Storage.is_transient());
    }

    #[test]
    fn kind_strings() {
        assert_eq!(ErrorKind::ServerError.to_string(), "server_error");
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
    }
}

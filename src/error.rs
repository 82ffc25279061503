//! Error types for the anchoring node
//!
//! Every error carries a kind that drives the retry decision: transient
//! errors are retried (the message bus redelivers), permanent errors are
//! logged and dropped, not-found disambiguates a missing entity from a
//! failure. Composite wrappers preserve the innermost kind.

use thiserror::Error;

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller should retry; the message bus redelivers
    Transient,
    /// Do not retry; log and ack
    Permanent,
    /// Entity does not exist
    NotFound,
    /// Request was syntactically or semantically invalid
    BadRequest,
    /// Signature or authorisation failure
    Unauthorized,
}

/// Error type for all node operations
#[derive(Debug, Error)]
pub enum Error {
    /// Entity or content does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Signature or authorisation failure
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Retriable failure (I/O, remote 5xx, timeouts)
    #[error("{0}")]
    Transient(String),

    /// Non-retriable failure
    #[error("{0}")]
    Permanent(String),

    /// Service was invoked before Start() completed
    #[error("service has not started")]
    NotStarted,

    /// The store back-end cannot index the requested tag expression
    #[error("query not supported by this store: {0}")]
    UnsupportedQuery(String),

    /// A batch put with a new-key hint hit an existing key
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Retrieved content does not hash to the requested multihash
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl Error {
    /// Build a transient error from any displayable cause
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Error::Transient(msg.to_string())
    }

    /// Build a permanent error from any displayable cause
    pub fn permanent(msg: impl std::fmt::Display) -> Self {
        Error::Permanent(msg.to_string())
    }

    /// The retry classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Transient(_) | Error::NotStarted => ErrorKind::Transient,
            Error::Permanent(_)
            | Error::UnsupportedQuery(_)
            | Error::DuplicateKey(_)
            | Error::HashMismatch { .. } => ErrorKind::Permanent,
        }
    }

    /// True if the caller should retry
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True if the error indicates a missing entity
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Wrap with additional context, preserving the kind
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{ctx}: {m}")),
            Error::BadRequest(m) => Error::BadRequest(format!("{ctx}: {m}")),
            Error::Unauthorized(m) => Error::Unauthorized(format!("{ctx}: {m}")),
            Error::Transient(m) => Error::Transient(format!("{ctx}: {m}")),
            Error::Permanent(m) => Error::Permanent(format!("{ctx}: {m}")),
            other => Error::Transient(format!("{ctx}: {other}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return from_status(status.as_u16(), e.to_string());
        }

        // Connection failures and timeouts are retriable.
        Error::Transient(format!("http request failed: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(format!("invalid JSON: {e}"))
    }
}

/// Map an HTTP status code to an error with the retry policy of §7:
/// 5xx is transient, 429 is transient, other 4xx are permanent,
/// 404 is not-found.
pub fn from_status(status: u16, msg: impl std::fmt::Display) -> Error {
    match status {
        404 => Error::NotFound(msg.to_string()),
        401 | 403 => Error::Unauthorized(msg.to_string()),
        429 => Error::Transient(format!("rate limited: {msg}")),
        s if (400..500).contains(&s) => Error::Permanent(format!("HTTP {s}: {msg}")),
        s => Error::Transient(format!("HTTP {s}: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::NotStarted.kind(), ErrorKind::Transient);
        assert!(Error::transient("io").is_transient());
        assert!(!Error::permanent("bad").is_transient());
        assert_eq!(
            Error::HashMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(from_status(404, "x").kind(), ErrorKind::NotFound);
        assert_eq!(from_status(500, "x").kind(), ErrorKind::Transient);
        assert_eq!(from_status(429, "x").kind(), ErrorKind::Transient);
        assert_eq!(from_status(400, "x").kind(), ErrorKind::Permanent);
        assert_eq!(from_status(401, "x").kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::transient("broken pipe").context("deliver activity");
        assert!(err.is_transient());
        assert!(err.to_string().contains("deliver activity"));

        let err = Error::NotFound("key".into()).context("cas read");
        assert!(err.is_not_found());
    }
}

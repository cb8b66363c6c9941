//! Error types for registry operations
//!
//! Every fallible operation in the crate returns [`RegistryError`]. The
//! variants map onto the error kinds callers branch on: `NotFound` for
//! diffing, `Transient` for the retry layer, `Integrity` for digest
//! verification failures that must never be retried.

pub mod handlers;

pub use handlers::{Diagnostic, ErrorDocument, HttpError};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered 404
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failed after a refresh, or the scope was refused
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Computed digest or size did not match, or the document is malformed
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Network failure, 429 or 5xx
    #[error("transient error: {message}")]
    Transient { status: Option<u16>, message: String },
    /// Any other non-2xx response
    #[error(transparent)]
    Protocol(#[from] HttpError),
    /// A manifest of a kind the caller cannot use, e.g. an index where an image was asked for
    #[error("unexpected media type {0}")]
    UnexpectedMediaType(String),
    #[error("operation canceled")]
    Canceled,
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("credential helper error: {0}")]
    CredentialHelper(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl RegistryError {
    pub fn transient(message: impl Into<String>) -> Self {
        RegistryError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    /// Whether the retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Transient { .. })
    }

    /// HTTP status carried by the error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RegistryError::Transient { status, .. } => *status,
            RegistryError::Protocol(err) => Some(err.status),
            RegistryError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Wrap this error so it can travel through an `AsyncRead`.
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        // Verifying readers smuggle integrity failures through io::Error.
        let wraps_registry_error = err
            .get_ref()
            .is_some_and(|inner| inner.is::<RegistryError>());
        if !wraps_registry_error {
            return RegistryError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<RegistryError>()) {
            Some(Ok(inner)) => *inner,
            _ => RegistryError::Integrity("stream verification failed".to_string()),
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Transient {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::header::ToStrError> for RegistryError {
    fn from(err: reqwest::header::ToStrError) -> Self {
        RegistryError::Integrity(format!("invalid header value: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_unwraps_integrity() {
        let io = RegistryError::Integrity("sha256 mismatch".to_string()).into_io();
        let back: RegistryError = io.into();
        assert!(matches!(back, RegistryError::Integrity(msg) if msg == "sha256 mismatch"));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let back: RegistryError = io.into();
        assert!(matches!(back, RegistryError::Io(_)));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(RegistryError::transient("reset by peer").is_retryable());
        assert!(!RegistryError::Integrity("bad".into()).is_retryable());
        assert!(!RegistryError::Unauthorized("nope".into()).is_retryable());
        assert!(!RegistryError::NotFound("x".into()).is_retryable());
        assert_eq!(RegistryError::NotFound("x".into()).status(), Some(404));
    }
}

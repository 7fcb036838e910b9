//! Crate-level error type.
//!
//! A single [`CacheError`] is used by every layer (byte store, fetch session, range resolver,
//! janitor) together with the [`CacheResult`] alias.
//!
//! The error is `Clone` because one fetch failure has to be fanned out to every range request
//! still pending on that resource. I/O errors are therefore kept behind an `Arc`.

use std::io;
use std::sync::Arc;

/// Result type used by this crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Unified error type for the `stream-download-cache` crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Transport-level failure while fetching.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a status code of 400 or above.
    #[error("HTTP error: {status} for {url}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// The downloaded size differs from the declared content length.
    #[error("wrong file size, expected: {expected}, actual: {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The downloaded size is below the configured floor.
    #[error("file size {actual} is smaller than minimum expected file size {minimum}")]
    BelowMinimumSize { actual: u64, minimum: u64 },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The fetch session was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// No session exists for the given resource key.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// Extra context around a lower-level error.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        CacheError::Message(msg.into())
    }

    /// Attach static context to an existing error.
    pub fn with_context(self, context: &'static str) -> Self {
        CacheError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// True for errors produced by the size verification step.
    pub fn is_verification(&self) -> bool {
        match self {
            CacheError::SizeMismatch { .. }
            | CacheError::BelowMinimumSize { .. }
            | CacheError::HttpStatus { .. } => true,
            CacheError::Context { source, .. } => source.is_verification(),
            _ => false,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return CacheError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        CacheError::Network(err.to_string())
    }
}

//! Error taxonomy for sync operations
//!
//! A version conflict is not an error: it is the `Rejected` arm of
//! [`crate::engine::UpdateOutcome`] and is always recovered locally.

use thiserror::Error;

/// Errors that can abort the handling of a single file within a pass,
/// or (for `Index`/`Transport` on the initial RPCs) the whole pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),

    #[error("local I/O failure on {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("malformed index: {message}")]
    Index { message: String },

    #[error("store error: {message}")]
    Store { message: String },
}

impl SyncError {
    /// Wrap a filesystem error with the path it concerns
    #[must_use]
    pub fn local_io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// A missing digest or file name
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<heed::Error> for SyncError {
    fn from(err: heed::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

//! Error types for the archive crate.

use thiserror::Error;

/// Errors that can occur when working with RPA archives.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header line does not start with a known RPA magic.
    #[error("unsupported archive format: header {0:?} has no known RPA magic")]
    UnsupportedFormat(String),

    /// The header line has a known magic but malformed fields.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The index could not be decompressed or has an unexpected shape.
    #[error("corrupt index: {reason}")]
    CorruptIndex {
        /// Index key whose record was malformed, if the failure is tied to one.
        key: Option<String>,
        /// Human readable description of the failure.
        reason: String,
    },

    /// Entry not present in the index.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// The backing file ended before the entry's declared length.
    #[error("truncated read of {path}: expected {expected} bytes, got {actual}")]
    TruncatedRead {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The archive has no decoded index (a reload failed).
    #[error("archive is not loaded")]
    NotLoaded,
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptIndex {
            key: None,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_key(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::CorruptIndex {
            key: Some(key.to_owned()),
            reason: format!("entry {key:?}: {reason}"),
        }
    }
}

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

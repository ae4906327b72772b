//! Share-level error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the share index and refresh engine.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Virtual path resolves nowhere.
    #[error("file not available: {0}")]
    FileNotAvailable(String),

    /// Path resolves but no shared profile may see it.
    #[error("access denied: {0}")]
    FileAccessDenied(String),

    /// The hash store failed; the surrounding refresh task is aborted.
    #[error("hash store failure on {path}: {message}")]
    Hash {
        /// File being hashed
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// A refresh request was rejected before it was queued.
    #[error("refresh rejected: {0}")]
    RefreshRejected(String),

    /// Root bookkeeping problem (duplicate, overlapping, unknown).
    #[error("invalid share root {path}: {message}")]
    InvalidRoot {
        /// Offending root path
        path: PathBuf,
        /// What is wrong with it
        message: String,
    },

    /// Requested bloom filter geometry is out of bounds.
    #[error("unsupported bloom parameter {0}")]
    UnsupportedBloom(&'static str),

    /// Filesystem error during a walk or list generation.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

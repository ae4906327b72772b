//! Upload pipeline errors, with their wire status codes.

use adcx_proto::AdcStatus;
use thiserror::Error;

/// Why a `GET` could not be served.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Malformed request (empty path, bad offsets, zero length).
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Requesting user is unknown on every shared hub.
    #[error("unknown user")]
    UnknownUser,

    /// Virtual path resolves nowhere.
    #[error("file not available")]
    FileNotAvailable,

    /// Resolves, but not in any profile shared with the requester.
    #[error("access denied")]
    FileAccessDenied,

    /// Requested range exceeds the file.
    #[error("bytes requested beyond the end of the file")]
    RangeBeyondEnd,

    /// All applicable slots are taken; the peer was queued.
    #[error("all upload slots are taken")]
    SlotsFull {
        /// Position in the waiting queue (1-based), when queued.
        queue_position: Option<usize>,
    },

    /// Unrecognized transfer type token.
    #[error("unknown transfer type {0:?}")]
    UnknownType(String),

    /// Stream could not be opened.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// The `STA` error code to answer with.
    #[must_use]
    pub fn status_code(&self) -> u8 {
        match self {
            UploadError::FileNotAvailable => AdcStatus::FILE_NOT_AVAILABLE,
            UploadError::FileAccessDenied => AdcStatus::FILE_ACCESS_DENIED,
            UploadError::SlotsFull { .. } => AdcStatus::SLOTS_FULL,
            UploadError::UnknownUser => AdcStatus::UNKNOWN_USER,
            _ => AdcStatus::TRANSFER_GENERIC,
        }
    }
}

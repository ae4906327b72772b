//! Error types for wire parsing.

use thiserror::Error;

/// Errors raised while decoding wire data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Line too short to carry a type byte and command code
    #[error("command too short: {0:?}")]
    TooShort(String),

    /// Unknown message type byte
    #[error("invalid message type: {0:?}")]
    InvalidType(char),

    /// A required positional parameter is missing
    #[error("missing parameter at index {0}")]
    MissingParameter(usize),

    /// Base32 text of the wrong length or alphabet
    #[error("invalid base32 value: {0}")]
    InvalidBase32(String),

    /// SID token was not exactly four base32 characters
    #[error("invalid session id: {0:?}")]
    InvalidSid(String),

    /// Status code field was not a three-digit number
    #[error("invalid status code: {0:?}")]
    InvalidStatus(String),
}

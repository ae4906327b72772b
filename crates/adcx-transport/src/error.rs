//! Transport-level errors.

use thiserror::Error;

/// Failures of a buffered endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS or TCP connect failure.
    #[error("connect failed: {0}")]
    Connect(String),

    /// TLS handshake failure.
    #[error("tls handshake failed: {0}")]
    Tls(String),

    /// Server certificate did not match the pinned keyprint.
    #[error("certificate keyprint mismatch")]
    KeyprintMismatch,

    /// TLS requested without a keyprint and untrusted peers not allowed.
    #[error("untrusted certificate rejected")]
    UntrustedRejected,

    /// Socket error after connect.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// zlib inflate failure in `ZPIPE` mode.
    #[error("decompression error: {0}")]
    Inflate(String),

    /// The endpoint worker is gone.
    #[error("connection closed")]
    Closed,
}

//! Core-level error taxonomy.

use thiserror::Error;

/// Errors raised by hub sessions and orchestration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A command arrived in a state where it is not allowed.
    #[error("bad protocol state: {0}")]
    BadProtocolState(&'static str),

    /// Encryption required but the peer offered a plain handshake.
    #[error("tls required")]
    TlsRequired,

    /// Peer asked for a client-client protocol we do not speak.
    #[error("protocol {protocol:?} not supported (token {token:?})")]
    ProtocolUnsupported {
        /// Offered protocol string
        protocol: String,
        /// Connect token of the failed attempt
        token: String,
    },

    /// The secondary-protocol probe failed or timed out.
    #[error("connectivity validation failed: {0}")]
    HbriValidationFailed(String),

    /// The hub denied the command class for this session.
    #[error("command forbidden by hub")]
    CommandForbidden,

    /// Session is not connected.
    #[error("not connected")]
    NotConnected,

    /// Wire-level decode failure.
    #[error(transparent)]
    Proto(#[from] adcx_proto::ProtoError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] adcx_transport::TransportError),

    /// Share failure surfaced through a hub operation.
    #[error(transparent)]
    Share(#[from] adcx_share::ShareError),
}

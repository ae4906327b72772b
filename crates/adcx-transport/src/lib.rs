//! # adcx-transport
//!
//! Connection-oriented duplex endpoints for hub and peer sessions. Each
//! endpoint owns one worker task; callers enqueue writes and mode changes
//! over a command channel, and the worker delivers [`TransportEvent`]s in
//! arrival order on an event channel. The reader supports three modes:
//! LF-delimited lines, zlib-inflated lines (`ZPIPE`), and raw bytes.
//!
//! TLS uses a pinned-keyprint verifier: with a keyprint, the server
//! certificate digest must match; without one, only connections opted
//! into `allow_untrusted` proceed.

#![warn(clippy::all)]

pub mod connection;
pub mod tls;

mod error;

pub use connection::{
    adopt, connect, BufferedConnection, ConnectOptions, ReadMode, TransportEvent,
};
pub use error::TransportError;
pub use tls::keyprint_from_der;

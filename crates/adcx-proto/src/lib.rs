//! # adcx-proto
//!
//! Wire-level building blocks for the ADC protocol:
//!
//! - **Command codec**: line frame ↔ typed [`AdcCommand`] with parameter
//!   escaping and FourCC dispatch keys
//! - **Identifiers**: [`Sid`], [`Cid`], [`Pid`] and their base32 text forms
//! - **Content addressing**: [`TthValue`] roots and tiger tree hashing
//! - **Status codes**: severity + error code pairs carried by `STA`
//!
//! Everything here is pure data and parsing; sockets, sessions and state
//! machines live in the crates above this one.

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod extensions;
pub mod features;
pub mod id;
pub mod status;
pub mod tth;

mod error;

pub use command::{AdcCommand, Code, CommandType, FourCc};
pub use error::ProtoError;
pub use id::{Cid, Pid, Sid};
pub use status::{AdcStatus, Severity};
pub use tth::{TigerTree, TthValue};

/// The ADC virtual path separator.
pub const ADC_SEPARATOR: char = '/';

/// Root of the ADC virtual namespace.
pub const ADC_ROOT: &str = "/";

/// Magic file name peers request to receive the full file list.
pub const USER_LIST_NAME: &str = "files.xml";

/// Compressed variant of [`USER_LIST_NAME`].
pub const USER_LIST_NAME_BZ: &str = "files.xml.bz2";

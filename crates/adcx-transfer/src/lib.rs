//! # adcx-transfer
//!
//! The upload side of the peer: slot accounting across the five slot
//! classes (standard, extra/mini, partial, multi-connection, small), the
//! request-preparation pipeline that turns a `GET` into an opened stream,
//! the waiting-user queue with free-slot notifications, and the delay pool
//! that keeps finished chunked uploads warm for quick resume.
//!
//! This crate owns no sockets. The hub/peer layer feeds it requests and
//! ticks; it hands back prepared streams and notification targets.

#![warn(clippy::all)]

pub mod scheduler;
pub mod stream;
pub mod upload;

mod error;

pub use error::UploadError;
pub use scheduler::{
    PartialSource, PartialSourceProvider, PreparedUpload, SlotKind, UploadConfig,
    UploadRequest, UploadScheduler, UploadUser,
};
pub use stream::UploadStream;
pub use upload::{TransferKind, Upload};

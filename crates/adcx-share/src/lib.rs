//! # adcx-share
//!
//! The shared-file index:
//!
//! - [`tree`]: the in-memory forest of shared roots with its three lookup
//!   indices (real path, lower directory name, TTH)
//! - [`profile`]: named views over subsets of the roots
//! - [`bloom`]: the name-token bloom filter and the `GET blom` responder
//! - [`refresh`]: the disk walker and its priority task queue
//! - [`validator`]: skiplist / exclude / hash-queue admission control
//! - [`filelist`]: partial-list, TTH-list and share-cache XML generation
//! - [`hash_store`]: the contract with the hash database
//!
//! Locking: one shared/exclusive lock ([`tree::ShareTree`]) covers the
//! forest, all indices and the bloom filter. The refresh worker builds new
//! subtrees outside the lock and splices them in under a short write
//! section.

#![warn(clippy::all)]

pub mod bloom;
pub mod dual_string;
pub mod filelist;
pub mod hash_store;
pub mod profile;
pub mod refresh;
pub mod tree;
pub mod validator;

mod error;

pub use dual_string::DualString;
pub use error::ShareError;
pub use hash_store::{HashStore, MemoryHashStore};
pub use profile::{ProfileToken, ShareProfile, ShareRoot};
pub use refresh::{RefreshEngine, RefreshKind, RefreshPriority, RefreshStats};
pub use tree::{DirPtr, Directory, FileNode, ShareTree};
pub use validator::ShareValidator;

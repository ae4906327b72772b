//! Contract with the hash database.
//!
//! The share index never computes hashes inline during a walk; it asks the
//! store whether a `(path_lower, size, mtime)` triple already has a tree
//! and defers the rest to the hashing side of the store.

use crate::error::ShareError;
use adcx_proto::tth::{HashedTree, TigerTree, TthValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Identity of a file at hashing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    /// Size in bytes.
    pub size: u64,
    /// Last-modified time, unix seconds.
    pub mtime: u64,
}

/// Hash database operations the share depends on.
pub trait HashStore: Send + Sync {
    /// Is a full tree stored for this root?
    fn has_tree(&self, tth: &TthValue) -> bool;

    /// Fetch the stored tree for a root.
    fn get_tree(&self, tth: &TthValue) -> Option<HashedTree>;

    /// Return the cached root for a file whose identity is unchanged.
    fn check_tth(&self, path_lower: &str, identity: FileIdentity) -> Option<TthValue>;

    /// Store a freshly computed tree for a file.
    fn add_file(&self, path_lower: &str, identity: FileIdentity, tree: HashedTree);
}

/// Stream a file through the tiger tree hasher.
///
/// # Errors
///
/// Returns [`ShareError::Hash`] when the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<HashedTree, ShareError> {
    let map_err = |e: std::io::Error| ShareError::Hash {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let mut file = File::open(path).map_err(map_err)?;
    let size = file.metadata().map_err(map_err)?.len();

    let mut tree = TigerTree::for_file(size);
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(map_err)?;
        if read == 0 {
            break;
        }
        tree.update(&buffer[..read]);
    }
    Ok(tree.finalize())
}

#[derive(Default)]
struct StoreInner {
    by_path: HashMap<String, (FileIdentity, TthValue)>,
    trees: HashMap<TthValue, HashedTree>,
}

/// In-memory hash store used by tests and the CLI.
#[derive(Default)]
pub struct MemoryHashStore {
    inner: RwLock<StoreInner>,
}

impl MemoryHashStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        MemoryHashStore::default()
    }

    /// Number of distinct trees held.
    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.inner.read().trees.len()
    }
}

impl HashStore for MemoryHashStore {
    fn has_tree(&self, tth: &TthValue) -> bool {
        self.inner.read().trees.contains_key(tth)
    }

    fn get_tree(&self, tth: &TthValue) -> Option<HashedTree> {
        self.inner.read().trees.get(tth).cloned()
    }

    fn check_tth(&self, path_lower: &str, identity: FileIdentity) -> Option<TthValue> {
        let inner = self.inner.read();
        match inner.by_path.get(path_lower) {
            Some((stored, tth)) if *stored == identity => Some(*tth),
            _ => None,
        }
    }

    fn add_file(&self, path_lower: &str, identity: FileIdentity, tree: HashedTree) {
        let mut inner = self.inner.write();
        inner.by_path.insert(path_lower.to_string(), (identity, tree.root));
        inner.trees.insert(tree.root, tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::tth::hash_buffer;

    #[test]
    fn cache_hit_requires_identical_identity() {
        let store = MemoryHashStore::new();
        let tree = hash_buffer(b"content");
        let identity = FileIdentity { size: 7, mtime: 1000 };
        store.add_file("/share/a.txt", identity, tree.clone());

        assert_eq!(store.check_tth("/share/a.txt", identity), Some(tree.root));
        assert_eq!(
            store.check_tth("/share/a.txt", FileIdentity { size: 7, mtime: 2000 }),
            None
        );
        assert_eq!(store.check_tth("/share/other.txt", identity), None);
        assert!(store.has_tree(&tree.root));
        assert_eq!(store.get_tree(&tree.root).unwrap(), tree);
    }

    #[test]
    fn hashes_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0x5Au8; 3000]).unwrap();

        let tree = hash_file(&path).unwrap();
        assert_eq!(tree.file_size, 3000);
        assert_eq!(tree.root, hash_buffer(&vec![0x5Au8; 3000]).root);
    }

    #[test]
    fn missing_file_is_a_hash_error() {
        let err = hash_file(Path::new("/nonexistent/file.bin")).unwrap_err();
        assert!(matches!(err, ShareError::Hash { .. }));
    }
}

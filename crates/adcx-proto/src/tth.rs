//! Tiger tree hashing (TTH) for content addressing.
//!
//! Files are hashed in 1 KiB segments; segment hashes form the leaves of a
//! binary Merkle tree. Leaf hashes are `Tiger(0x00 ++ data)`, interior nodes
//! `Tiger(0x01 ++ left ++ right)`, and an unpaired rightmost node is
//! promoted unchanged. Stored trees keep one hash per *block* (a
//! power-of-two multiple of 1 KiB) so that the serialized leaf level stays
//! small for large files.

use crate::error::ProtoError;
use data_encoding::BASE32_NOPAD;
use digest::Digest;
use std::fmt;
use std::str::FromStr;
use tiger::Tiger;

/// Size of a tiger hash in bytes.
pub const HASH_SIZE: usize = 24;

/// Smallest hashed segment.
pub const BASE_SEGMENT: u64 = 1024;

/// Maximum number of stored leaves per tree.
const MAX_LEAVES: u64 = 512;

const LEAF_MARKER: u8 = 0x00;
const NODE_MARKER: u8 = 0x01;

/// A tiger tree root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TthValue(pub [u8; HASH_SIZE]);

impl TthValue {
    /// Base32 text form (39 characters).
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl FromStr for TthValue {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| ProtoError::InvalidBase32(s.to_string()))?;
        if decoded.len() != HASH_SIZE {
            return Err(ProtoError::InvalidBase32(s.to_string()));
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&decoded);
        Ok(TthValue(out))
    }
}

impl fmt::Debug for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TthValue({})", self.to_base32())
    }
}

impl fmt::Display for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

/// Pick the stored block size for a file: the smallest power-of-two
/// multiple of [`BASE_SEGMENT`] that keeps the leaf count under
/// [`MAX_LEAVES`].
#[must_use]
pub fn block_size(file_size: u64) -> u64 {
    let mut bs = BASE_SEGMENT;
    while file_size > bs * MAX_LEAVES {
        bs *= 2;
    }
    bs
}

fn leaf_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut h = Tiger::new();
    h.update([LEAF_MARKER]);
    h.update(data);
    h.finalize().into()
}

fn node_hash(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
    let mut h = Tiger::new();
    h.update([NODE_MARKER]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Fold a hash level upward, promoting an unpaired rightmost node.
fn fold_level(level: &[[u8; HASH_SIZE]]) -> [u8; HASH_SIZE] {
    debug_assert!(!level.is_empty());
    let mut current = level.to_vec();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for pair in current.chunks(2) {
            next.push(if pair.len() == 2 {
                node_hash(&pair[0], &pair[1])
            } else {
                pair[0]
            });
        }
        current = next;
    }
    current[0]
}

/// Streaming tiger tree hasher.
///
/// Feed data with [`update`](Self::update), then call
/// [`finalize`](Self::finalize). The tree keeps one stored hash per
/// `block_size` bytes.
pub struct TigerTree {
    block_size: u64,
    leaves: Vec<[u8; HASH_SIZE]>,
    /// 1 KiB segment hashes of the block currently being filled.
    segments: Vec<[u8; HASH_SIZE]>,
    buffer: Vec<u8>,
    total: u64,
}

impl TigerTree {
    /// Create a hasher with an explicit block size (must be a power-of-two
    /// multiple of [`BASE_SEGMENT`]).
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        debug_assert!(block_size >= BASE_SEGMENT && block_size % BASE_SEGMENT == 0);
        TigerTree {
            block_size,
            leaves: Vec::new(),
            segments: Vec::new(),
            buffer: Vec::with_capacity(BASE_SEGMENT as usize),
            total: 0,
        }
    }

    /// Create a hasher sized for a known file length.
    #[must_use]
    pub fn for_file(file_size: u64) -> Self {
        Self::new(block_size(file_size))
    }

    /// Feed file data.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let room = BASE_SEGMENT as usize - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == BASE_SEGMENT as usize {
                self.push_segment();
            }
        }
    }

    fn push_segment(&mut self) {
        let hash = leaf_hash(&self.buffer);
        self.buffer.clear();
        self.segments.push(hash);
        if self.segments.len() as u64 == self.block_size / BASE_SEGMENT {
            let block = fold_level(&self.segments);
            self.segments.clear();
            self.leaves.push(block);
        }
    }

    /// Finish hashing and return the stored leaves plus root.
    #[must_use]
    pub fn finalize(mut self) -> HashedTree {
        if !self.buffer.is_empty() || (self.total == 0 && self.leaves.is_empty()) {
            // Trailing partial segment, or the empty file's single leaf.
            let hash = leaf_hash(&self.buffer);
            self.buffer.clear();
            self.segments.push(hash);
        }
        if !self.segments.is_empty() {
            let block = fold_level(&self.segments);
            self.segments.clear();
            self.leaves.push(block);
        }

        let root = TthValue(fold_level(&self.leaves));
        HashedTree {
            root,
            block_size: self.block_size,
            leaves: self.leaves,
            file_size: self.total,
        }
    }
}

/// A finished tiger tree: root, stored leaves and geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedTree {
    /// Merkle root.
    pub root: TthValue,
    /// Bytes covered by each stored leaf.
    pub block_size: u64,
    /// Stored leaf hashes, in file order.
    pub leaves: Vec<[u8; HASH_SIZE]>,
    /// Total hashed length.
    pub file_size: u64,
}

impl HashedTree {
    /// Serialize the leaf level as the concatenated 24-byte hashes sent in
    /// reply to a `tthl` request.
    #[must_use]
    pub fn leaf_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * HASH_SIZE);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf);
        }
        out
    }

    /// Rebuild a tree from serialized leaf data, verifying it against an
    /// expected root.
    pub fn from_leaf_data(
        root: TthValue,
        block_size: u64,
        file_size: u64,
        data: &[u8],
    ) -> Result<Self, ProtoError> {
        if data.is_empty() || data.len() % HASH_SIZE != 0 {
            return Err(ProtoError::InvalidBase32(format!(
                "bad leaf data length {}",
                data.len()
            )));
        }
        let leaves: Vec<[u8; HASH_SIZE]> = data
            .chunks_exact(HASH_SIZE)
            .map(|c| {
                let mut leaf = [0u8; HASH_SIZE];
                leaf.copy_from_slice(c);
                leaf
            })
            .collect();
        let computed = TthValue(fold_level(&leaves));
        if computed != root {
            return Err(ProtoError::InvalidBase32("leaf data does not match root".into()));
        }
        Ok(HashedTree {
            root,
            block_size,
            leaves,
            file_size,
        })
    }
}

/// Hash an in-memory buffer in one call.
#[must_use]
pub fn hash_buffer(data: &[u8]) -> HashedTree {
    let mut tree = TigerTree::for_file(data.len() as u64);
    tree.update(data);
    tree.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known THEX vector: root of the empty input.
    #[test]
    fn empty_input_vector() {
        let tree = hash_buffer(b"");
        assert_eq!(
            tree.root.to_base32(),
            "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"
        );
        assert_eq!(tree.leaves.len(), 1);
    }

    #[test]
    fn single_byte_vector() {
        // Tiger tree of a single zero byte, per the THEX test vectors.
        let tree = hash_buffer(&[0u8]);
        assert_eq!(
            tree.root.to_base32(),
            "VK54ZIEEVTWNAUI5D5RDFIL37LX2IQNSTAXFKSA"
        );
    }

    #[test]
    fn block_size_scales() {
        assert_eq!(block_size(0), BASE_SEGMENT);
        assert_eq!(block_size(BASE_SEGMENT * MAX_LEAVES), BASE_SEGMENT);
        assert_eq!(block_size(BASE_SEGMENT * MAX_LEAVES + 1), BASE_SEGMENT * 2);
    }

    #[test]
    fn streaming_matches_oneshot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let oneshot = hash_buffer(&data);

        let mut streamed = TigerTree::for_file(data.len() as u64);
        for chunk in data.chunks(333) {
            streamed.update(chunk);
        }
        let streamed = streamed.finalize();
        assert_eq!(oneshot.root, streamed.root);
        assert_eq!(oneshot.leaves, streamed.leaves);
    }

    #[test]
    fn leaf_data_roundtrip() {
        let data = vec![0xABu8; 5000];
        let tree = hash_buffer(&data);
        let rebuilt = HashedTree::from_leaf_data(
            tree.root,
            tree.block_size,
            tree.file_size,
            &tree.leaf_data(),
        )
        .unwrap();
        assert_eq!(rebuilt, tree);
    }

    #[test]
    fn corrupt_leaf_data_rejected() {
        let tree = hash_buffer(&[1u8; 4096]);
        let mut data = tree.leaf_data();
        data[0] ^= 0xFF;
        assert!(
            HashedTree::from_leaf_data(tree.root, tree.block_size, tree.file_size, &data).is_err()
        );
    }

    #[test]
    fn tth_value_text_roundtrip() {
        let tree = hash_buffer(b"hello world");
        let text = tree.root.to_base32();
        assert_eq!(text.len(), 39);
        assert_eq!(text.parse::<TthValue>().unwrap(), tree.root);
    }
}

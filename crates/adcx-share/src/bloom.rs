//! Bloom filters over the share.
//!
//! Two filters live here:
//!
//! - [`ShareBloom`]: a fixed-geometry, five-hash-function filter over the
//!   lower-cased name tokens of every shared directory and file (plus
//!   queued bundle names). Rebuilt from scratch on a full refresh,
//!   extended in place on partial refreshes.
//! - [`HashBloom`]: the variable-geometry TTH filter built on demand for a
//!   hub's `GET blom` request, with the requester choosing `k`, `m` and
//!   `h` within guarded bounds.

use crate::error::ShareError;
use adcx_proto::TthValue;

/// Default bit count for the share-wide name filter.
pub const SHARE_BLOOM_BITS: usize = 1 << 20;

const SHARE_HASHES: usize = 5;

/// Largest accepted `k` for a hub bloom request.
pub const MAX_K: u64 = 8;
/// Largest accepted `h` for a hub bloom request.
pub const MAX_H: u64 = 64;

/// Five-hash-function bit filter over name tokens.
#[derive(Clone)]
pub struct ShareBloom {
    bits: Vec<u64>,
    m: usize,
}

impl ShareBloom {
    /// Create an empty filter with `m` bits.
    #[must_use]
    pub fn new(m: usize) -> Self {
        let m = m.max(64);
        ShareBloom {
            bits: vec![0; m.div_ceil(64)],
            m,
        }
    }

    /// Clear all bits.
    pub fn reset(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    fn positions(&self, token: &str) -> [usize; SHARE_HASHES] {
        // FNV-1a with per-function seeds; cheap and stable across runs.
        let mut out = [0usize; SHARE_HASHES];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut hash: u64 =
                0xcbf2_9ce4_8422_2325 ^ ((i as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
            for b in token.as_bytes() {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(0x1000_0000_01b3);
            }
            *slot = (hash % self.m as u64) as usize;
        }
        out
    }

    /// Add one lower-cased token.
    pub fn add(&mut self, token: &str) {
        if token.is_empty() {
            return;
        }
        for pos in self.positions(token) {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// Add a full lower-cased name: the name itself plus its
    /// separator-split tokens.
    pub fn add_name(&mut self, name_lower: &str) {
        self.add(name_lower);
        for token in name_lower.split(adcx_search::is_separator) {
            self.add(token);
        }
    }

    /// Membership test; false is definitive, true may be a false positive.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.positions(token)
            .iter()
            .all(|pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }
}

/// Variable-geometry filter over TTH values, answered to `GET blom`.
pub struct HashBloom {
    bits: Vec<u8>,
    k: u64,
    m: u64,
    h: u64,
}

impl HashBloom {
    /// Validate the requested geometry against the current file count and
    /// build an empty filter.
    ///
    /// # Errors
    ///
    /// Rejects `k` outside `[1, 8]`, `h` outside `[1, 64]`, and any `m`
    /// beyond five times the information-theoretic optimum for
    /// `file_count` entries (or beyond `2^h` when `h < 32`).
    pub fn new(k: u64, m_bits: u64, h: u64, file_count: u64) -> Result<Self, ShareError> {
        if !(1..=MAX_K).contains(&k) {
            return Err(ShareError::UnsupportedBloom("k"));
        }
        if !(1..=MAX_H).contains(&h) {
            return Err(ShareError::UnsupportedBloom("h"));
        }

        let ideal = (file_count as f64 * k as f64 / std::f64::consts::LN_2).ceil() as u64;
        let limit = 5 * ideal.div_ceil(64) * 64;
        if m_bits > limit.max(64) || (h < 32 && m_bits > 1u64 << h) {
            return Err(ShareError::UnsupportedBloom("m"));
        }

        Ok(HashBloom {
            bits: vec![0; (m_bits as usize).div_ceil(8)],
            k,
            m: m_bits,
            h,
        })
    }

    /// Bit position for hash function `n`: `h` bits of the TTH starting at
    /// `n * h`, wrapping around the 192-bit value, reduced modulo `m`.
    fn pos(&self, tth: &TthValue, n: u64) -> u64 {
        let bytes = tth.as_bytes();
        let total_bits = (bytes.len() * 8) as u64;
        let start = (n * self.h) % total_bits;

        let mut value: u64 = 0;
        for i in 0..self.h {
            let bit = (start + i) % total_bits;
            let byte = bytes[(bit / 8) as usize];
            let set = byte >> (7 - (bit % 8)) & 1;
            value = (value << 1) | u64::from(set);
        }
        value % self.m
    }

    /// Add a TTH.
    pub fn add(&mut self, tth: &TthValue) {
        if self.m == 0 {
            return;
        }
        for n in 0..self.k {
            let pos = self.pos(tth, n);
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, tth: &TthValue) -> bool {
        if self.m == 0 {
            return false;
        }
        (0..self.k).all(|n| {
            let pos = self.pos(tth, n);
            self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
        })
    }

    /// The raw bit pattern sent back to the hub.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::tth::hash_buffer;

    #[test]
    fn share_bloom_has_no_false_negatives() {
        let mut bloom = ShareBloom::new(SHARE_BLOOM_BITS);
        let names = ["ubuntu-22.04.iso", "track01.flac", "readme.txt"];
        for n in &names {
            bloom.add_name(n);
        }
        for n in &names {
            assert!(bloom.contains(n));
        }
        // Tokens of the names are present as well.
        assert!(bloom.contains("ubuntu"));
        assert!(bloom.contains("flac"));
    }

    #[test]
    fn share_bloom_reset_clears() {
        let mut bloom = ShareBloom::new(SHARE_BLOOM_BITS);
        bloom.add("token");
        assert!(bloom.contains("token"));
        bloom.reset();
        assert!(!bloom.contains("token"));
    }

    #[test]
    fn hash_bloom_roundtrip() {
        let mut bloom = HashBloom::new(4, 1 << 11, 24, 100).unwrap();
        let roots: Vec<TthValue> = (0..50u8).map(|i| hash_buffer(&[i; 100]).root).collect();
        for r in &roots {
            bloom.add(r);
        }
        for r in &roots {
            assert!(bloom.contains(r));
        }
    }

    #[test]
    fn hash_bloom_geometry_guards() {
        assert!(HashBloom::new(0, 64, 24, 10).is_err());
        assert!(HashBloom::new(9, 64, 24, 10).is_err());
        assert!(HashBloom::new(4, 64, 0, 10).is_err());
        assert!(HashBloom::new(4, 64, 65, 10).is_err());
        // m far beyond the optimum for 10 files
        assert!(HashBloom::new(4, 100_000_000_000, 32, 10).is_err());
        // m beyond 2^h for small h
        assert!(HashBloom::new(1, 1 << 10, 8, 1_000_000).is_err());
    }

    #[test]
    fn hash_bloom_bit_pattern_size() {
        let bloom = HashBloom::new(2, 1024, 24, 1000).unwrap();
        assert_eq!(bloom.into_bytes().len(), 128);
    }
}

//! Session, content and private identifiers.
//!
//! A peer generates a random 192-bit private ID (PID) once per install and
//! derives its public content ID as `CID = Tiger(PID)`. Hubs assign a short
//! session ID (SID) per connection; the SID travels as four base32
//! characters on the wire.

use crate::error::ProtoError;
use data_encoding::BASE32_NOPAD;
use digest::Digest;
use rand::RngCore;
use std::fmt;
use tiger::Tiger;
use zeroize::Zeroize;

/// Raw size of a CID/PID in bytes (192 bits).
pub const ID_SIZE: usize = 24;

/// Length of the base32 text form of a CID/PID.
pub const ID_BASE32_LEN: usize = 39;

/// Per-hub session identifier.
///
/// Stored as the four raw ASCII characters packed into a `u32` so that
/// comparisons and map lookups avoid re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sid(u32);

impl Sid {
    /// Reserved SID representing the hub itself.
    pub const HUB: Sid = Sid(u32::MAX);

    /// Parse a four-character SID token.
    pub fn parse(token: &str) -> Result<Self, ProtoError> {
        let bytes = token.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| BASE32_ALPHABET.contains(b)) {
            return Err(ProtoError::InvalidSid(token.to_string()));
        }
        Ok(Sid(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
    }

    /// Raw packed value.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Sid::HUB {
            return write!(f, "[hub]");
        }
        let b = self.0.to_le_bytes();
        for c in b {
            write!(f, "{}", c as char)?;
        }
        Ok(())
    }
}

/// Public content identifier derived from the PID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Cid([u8; ID_SIZE]);

impl Cid {
    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Cid(bytes)
    }

    /// Parse the 39-character base32 text form.
    pub fn from_base32(text: &str) -> Result<Self, ProtoError> {
        decode_b32(text).map(Cid)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Base32 text form used on the wire.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// True for the all-zero placeholder CID (used for the hub identity).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

/// Private identifier. Never sent anywhere except the initial `INF PD`
/// field of an unencrypted-bootstrap hub login; zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Pid([u8; ID_SIZE]);

impl Pid {
    /// Generate a fresh random PID.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Pid(bytes)
    }

    /// Construct from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Pid(bytes)
    }

    /// Parse the base32 text form.
    pub fn from_base32(text: &str) -> Result<Self, ProtoError> {
        decode_b32(text).map(Pid)
    }

    /// Derive the public CID: `Tiger(PID)`.
    #[must_use]
    pub fn derive_cid(&self) -> Cid {
        let digest = Tiger::digest(self.0);
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&digest);
        Cid(out)
    }

    /// Base32 text form.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pid(..)")
    }
}

fn decode_b32(text: &str) -> Result<[u8; ID_SIZE], ProtoError> {
    // Allow the trailing-bit slack RFC 4648 leaves in a 39-char group.
    let decoded = BASE32_NOPAD
        .decode(text.as_bytes())
        .map_err(|_| ProtoError::InvalidBase32(text.to_string()))?;
    if decoded.len() != ID_SIZE {
        return Err(ProtoError::InvalidBase32(text.to_string()));
    }
    let mut out = [0u8; ID_SIZE];
    out.copy_from_slice(&decoded);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_roundtrip() {
        let sid = Sid::parse("AAAB").unwrap();
        assert_eq!(sid.to_string(), "AAAB");
        assert_ne!(sid, Sid::parse("AAAC").unwrap());
    }

    #[test]
    fn sid_rejects_bad_tokens() {
        assert!(Sid::parse("AA").is_err());
        assert!(Sid::parse("AAAAB").is_err());
        assert!(Sid::parse("aaab").is_err());
        assert!(Sid::parse("AA0B").is_err()); // 0 and 1 are not in the alphabet
    }

    #[test]
    fn cid_derivation_is_stable() {
        let pid = Pid::from_bytes([7u8; ID_SIZE]);
        let a = pid.derive_cid();
        let b = pid.derive_cid();
        assert_eq!(a, b);
        assert_eq!(a.to_base32().len(), ID_BASE32_LEN);
        assert_eq!(Cid::from_base32(&a.to_base32()).unwrap(), a);
    }

    #[test]
    fn distinct_pids_yield_distinct_cids() {
        assert_ne!(Pid::generate().derive_cid(), Pid::generate().derive_cid());
    }
}

//! Status codes carried by `STA` commands.
//!
//! The wire form is a three-digit decimal: severity digit followed by a
//! two-digit error code (`000` success, `142` a recoverable HBRI timeout,
//! and so on).

use crate::error::ProtoError;
use std::fmt;

/// Severity digit of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Severity {
    /// Operation succeeded
    Success = 0,
    /// Error; the session may continue
    Recoverable = 1,
    /// Error; the sender will close the session
    Fatal = 2,
}

impl Severity {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            0 => Some(Severity::Success),
            1 => Some(Severity::Recoverable),
            2 => Some(Severity::Fatal),
            _ => None,
        }
    }
}

/// A decoded severity + code pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcStatus {
    /// Severity digit.
    pub severity: Severity,
    /// Two-digit error code; see the associated constants.
    pub code: u8,
}

impl AdcStatus {
    /// No error.
    pub const SUCCESS: u8 = 0;
    /// The requested transfer protocol is not supported.
    pub const PROTOCOL_UNSUPPORTED: u8 = 24;
    /// Command received in a state where it is not allowed.
    pub const BAD_STATE: u8 = 27;
    /// Password verification failed.
    pub const BAD_PASSWORD: u8 = 40;
    /// The hub refuses this command type for us.
    pub const COMMAND_ACCESS: u8 = 41;
    /// Secondary-protocol validation did not complete in time.
    pub const HBRI_TIMEOUT: u8 = 42;
    /// Generic transfer failure; shares the numeric slot of
    /// [`BAD_PASSWORD`] in this dialect, distinguished by context.
    pub const TRANSFER_GENERIC: u8 = 40;
    /// Requested virtual path resolves nowhere.
    pub const FILE_NOT_AVAILABLE: u8 = 43;
    /// Path resolves but is not visible to the requesting profile.
    pub const FILE_ACCESS_DENIED: u8 = 44;
    /// All upload slots are taken.
    pub const SLOTS_FULL: u8 = 45;
    /// Requesting user is unknown on every shared hub.
    pub const UNKNOWN_USER: u8 = 46;
    /// Encryption required for this connection.
    pub const TLS_REQUIRED: u8 = 50;
    /// A required feature is missing on the remote side.
    pub const FEATURE_MISSING: u8 = 51;
    /// Generic protocol violation.
    pub const PROTOCOL_GENERIC: u8 = 52;

    /// Build a status value.
    #[must_use]
    pub fn new(severity: Severity, code: u8) -> Self {
        AdcStatus { severity, code }
    }

    /// Shorthand for a `000` success status.
    #[must_use]
    pub fn success() -> Self {
        AdcStatus::new(Severity::Success, Self::SUCCESS)
    }

    /// Parse the three-digit wire token.
    pub fn parse(token: &str) -> Result<Self, ProtoError> {
        let bytes = token.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(ProtoError::InvalidStatus(token.to_string()));
        }
        let severity = Severity::from_digit(bytes[0] - b'0')
            .ok_or_else(|| ProtoError::InvalidStatus(token.to_string()))?;
        let code = (bytes[1] - b'0') * 10 + (bytes[2] - b'0');
        Ok(AdcStatus { severity, code })
    }

    /// True when the severity digit is zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.severity == Severity::Success
    }
}

impl fmt::Display for AdcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.severity as u8, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form() {
        assert_eq!(AdcStatus::success().to_string(), "000");
        assert_eq!(
            AdcStatus::new(Severity::Recoverable, AdcStatus::HBRI_TIMEOUT).to_string(),
            "142"
        );
        assert_eq!(
            AdcStatus::new(Severity::Fatal, AdcStatus::PROTOCOL_GENERIC).to_string(),
            "252"
        );
    }

    #[test]
    fn parse_roundtrip() {
        for text in ["000", "124", "127", "140", "141", "142", "150", "151", "152"] {
            assert_eq!(AdcStatus::parse(text).unwrap().to_string(), text);
        }
        assert!(AdcStatus::parse("300").is_err());
        assert!(AdcStatus::parse("14").is_err());
        assert!(AdcStatus::parse("abc").is_err());
    }
}

//! ADC command codec.
//!
//! An ADC frame is a single LF-terminated ASCII line: a type byte, a
//! three-letter command code, then whitespace-separated parameters. The
//! type byte selects the routing header that follows the code (source SID,
//! destination SID, feature filter). Spaces, newlines and backslashes
//! inside parameters travel escaped as `\s`, `\n` and `\\`.

use crate::error::ProtoError;
use crate::id::{Cid, Sid};
use crate::status::{AdcStatus, Severity};
use std::fmt;

/// Message routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// `B` - broadcast to all hub users
    Broadcast,
    /// `C` - client-client connection
    Client,
    /// `D` - direct to one SID
    Direct,
    /// `E` - direct, echoed back to the sender
    Echo,
    /// `F` - users matching a feature filter
    Feature,
    /// `I` - hub information (no source)
    Info,
    /// `H` - client to hub only
    Hub,
    /// `U` - UDP datagram (source is a CID)
    Udp,
}

impl CommandType {
    /// The wire type byte.
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            CommandType::Broadcast => 'B',
            CommandType::Client => 'C',
            CommandType::Direct => 'D',
            CommandType::Echo => 'E',
            CommandType::Feature => 'F',
            CommandType::Info => 'I',
            CommandType::Hub => 'H',
            CommandType::Udp => 'U',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'B' => Some(CommandType::Broadcast),
            'C' => Some(CommandType::Client),
            'D' => Some(CommandType::Direct),
            'E' => Some(CommandType::Echo),
            'F' => Some(CommandType::Feature),
            'I' => Some(CommandType::Info),
            'H' => Some(CommandType::Hub),
            'U' => Some(CommandType::Udp),
            _ => None,
        }
    }
}

/// Three-letter command code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub [u8; 3]);

impl Code {
    pub const SUP: Code = Code(*b"SUP");
    pub const SID: Code = Code(*b"SID");
    pub const INF: Code = Code(*b"INF");
    pub const MSG: Code = Code(*b"MSG");
    pub const GPA: Code = Code(*b"GPA");
    pub const PAS: Code = Code(*b"PAS");
    pub const QUI: Code = Code(*b"QUI");
    pub const CTM: Code = Code(*b"CTM");
    pub const RCM: Code = Code(*b"RCM");
    pub const NAT: Code = Code(*b"NAT");
    pub const RNT: Code = Code(*b"RNT");
    pub const SCH: Code = Code(*b"SCH");
    pub const RES: Code = Code(*b"RES");
    pub const PSR: Code = Code(*b"PSR");
    pub const PBD: Code = Code(*b"PBD");
    pub const UBD: Code = Code(*b"UBD");
    pub const GET: Code = Code(*b"GET");
    pub const GFI: Code = Code(*b"GFI");
    pub const SND: Code = Code(*b"SND");
    pub const CMD: Code = Code(*b"CMD");
    pub const STA: Code = Code(*b"STA");
    pub const TCP: Code = Code(*b"TCP");
    pub const ZON: Code = Code(*b"ZON");
    pub const ZOF: Code = Code(*b"ZOF");

    /// Text form of the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Codes only ever come from three-ASCII-letter tokens.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch key for forbidden-command bookkeeping: type byte + code, four
/// characters, as reported by the hub in `STA FC` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Parse a four-character key.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let b = text.as_bytes();
        if b.len() != 4 {
            return None;
        }
        Some(FourCc([b[0], b[1], b[2], b[3]]))
    }
}

/// Escape a parameter for the wire.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape`]. Unknown escapes drop the backslash.
#[must_use]
pub fn unescape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// A decoded ADC command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcCommand {
    typ: CommandType,
    code: Code,
    from: Sid,
    to: Sid,
    features: String,
    params: Vec<String>,
}

impl AdcCommand {
    /// New command with an explicit type and no routing targets.
    #[must_use]
    pub fn new(typ: CommandType, code: Code) -> Self {
        AdcCommand {
            typ,
            code,
            from: Sid::HUB,
            to: Sid::HUB,
            features: String::new(),
            params: Vec::new(),
        }
    }

    /// `H`-type client-to-hub command.
    #[must_use]
    pub fn hub(code: Code) -> Self {
        Self::new(CommandType::Hub, code)
    }

    /// `B`-type broadcast.
    #[must_use]
    pub fn broadcast(code: Code) -> Self {
        Self::new(CommandType::Broadcast, code)
    }

    /// `D`-type command addressed to `to`.
    #[must_use]
    pub fn direct(code: Code, to: Sid) -> Self {
        let mut c = Self::new(CommandType::Direct, code);
        c.to = to;
        c
    }

    /// `E`-type command addressed to `to`.
    #[must_use]
    pub fn echo(code: Code, to: Sid) -> Self {
        let mut c = Self::new(CommandType::Echo, code);
        c.to = to;
        c
    }

    /// `C`-type command for a client-client connection.
    #[must_use]
    pub fn client(code: Code) -> Self {
        Self::new(CommandType::Client, code)
    }

    /// A `STA` carrying a status and a human-readable message.
    #[must_use]
    pub fn status(typ: CommandType, status: AdcStatus, message: &str) -> Self {
        let mut c = Self::new(typ, Code::STA);
        c.params.push(status.to_string());
        c.params.push(message.to_string());
        c
    }

    /// Parse one LF-terminated line (the terminator may be absent).
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.len() < 4 {
            return Err(ProtoError::TooShort(line.to_string()));
        }
        let mut chars = line.chars();
        let type_char = chars.next().unwrap_or('?');
        let typ =
            CommandType::from_char(type_char).ok_or(ProtoError::InvalidType(type_char))?;

        let code_bytes = line.as_bytes();
        let code = Code([code_bytes[1], code_bytes[2], code_bytes[3]]);

        let mut cmd = AdcCommand::new(typ, code);
        let mut tokens = line[4..].split(' ').filter(|t| !t.is_empty());

        match typ {
            CommandType::Broadcast => {
                let from = tokens.next().ok_or(ProtoError::MissingParameter(0))?;
                cmd.from = Sid::parse(from)?;
            }
            CommandType::Direct | CommandType::Echo => {
                let from = tokens.next().ok_or(ProtoError::MissingParameter(0))?;
                let to = tokens.next().ok_or(ProtoError::MissingParameter(1))?;
                cmd.from = Sid::parse(from)?;
                cmd.to = Sid::parse(to)?;
            }
            CommandType::Feature => {
                let from = tokens.next().ok_or(ProtoError::MissingParameter(0))?;
                let features = tokens.next().ok_or(ProtoError::MissingParameter(1))?;
                cmd.from = Sid::parse(from)?;
                cmd.features = features.to_string();
            }
            CommandType::Udp => {
                // Source CID; kept as an opaque first parameter.
                let from = tokens.next().ok_or(ProtoError::MissingParameter(0))?;
                cmd.params.push(unescape(from));
            }
            CommandType::Info | CommandType::Hub | CommandType::Client => {}
        }

        cmd.params.extend(tokens.map(unescape));
        Ok(cmd)
    }

    /// Serialize with `my_sid` as the source where the type requires one.
    #[must_use]
    pub fn to_line(&self, my_sid: Sid) -> String {
        let mut out = String::with_capacity(64);
        out.push(self.typ.as_char());
        out.push_str(self.code.as_str());
        match self.typ {
            CommandType::Broadcast => {
                out.push(' ');
                out.push_str(&my_sid.to_string());
            }
            CommandType::Direct | CommandType::Echo => {
                out.push(' ');
                out.push_str(&my_sid.to_string());
                out.push(' ');
                out.push_str(&self.to.to_string());
            }
            CommandType::Feature => {
                out.push(' ');
                out.push_str(&my_sid.to_string());
                out.push(' ');
                out.push_str(&self.features);
            }
            CommandType::Info | CommandType::Hub | CommandType::Client | CommandType::Udp => {}
        }
        for p in &self.params {
            out.push(' ');
            out.push_str(&escape(p));
        }
        out.push('\n');
        out
    }

    /// Serialize a `U`-type datagram with our CID as source.
    #[must_use]
    pub fn to_udp_line(&self, my_cid: &Cid) -> String {
        let mut out = String::with_capacity(64);
        out.push('U');
        out.push_str(self.code.as_str());
        out.push(' ');
        out.push_str(&my_cid.to_base32());
        for p in &self.params {
            out.push(' ');
            out.push_str(&escape(p));
        }
        out.push('\n');
        out
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn add_param(mut self, value: impl Into<String>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Append a named parameter (`key` must be two characters).
    #[must_use]
    pub fn add_named(mut self, key: &str, value: impl AsRef<str>) -> Self {
        debug_assert_eq!(key.len(), 2);
        self.params.push(format!("{}{}", key, value.as_ref()));
        self
    }

    /// Routing type.
    #[must_use]
    pub fn typ(&self) -> CommandType {
        self.typ
    }

    /// Command code.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Dispatch key: type byte + code.
    #[must_use]
    pub fn four_cc(&self) -> FourCc {
        FourCc([
            self.typ.as_char() as u8,
            self.code.0[0],
            self.code.0[1],
            self.code.0[2],
        ])
    }

    /// Source SID ([`Sid::HUB`] for types without one).
    #[must_use]
    pub fn from(&self) -> Sid {
        self.from
    }

    /// Destination SID for `D`/`E` types.
    #[must_use]
    pub fn to(&self) -> Sid {
        self.to
    }

    /// Set the destination SID.
    #[must_use]
    pub fn with_to(mut self, to: Sid) -> Self {
        self.to = to;
        self
    }

    /// Feature filter string of an `F`-type command.
    #[must_use]
    pub fn features(&self) -> &str {
        &self.features
    }

    /// Replace the type and feature filter (used when re-targeting a
    /// broadcast at a feature subset).
    pub fn set_feature_filter(&mut self, features: impl Into<String>) {
        self.typ = CommandType::Feature;
        self.features = features.into();
    }

    /// `+`/`-` tokens of the feature filter: `(required, feature)`.
    #[must_use]
    pub fn feature_tokens(&self) -> Vec<(bool, String)> {
        let mut out = Vec::new();
        let mut current: Option<(bool, String)> = None;
        for c in self.features.chars() {
            match c {
                '+' | '-' => {
                    if let Some(t) = current.take() {
                        out.push(t);
                    }
                    current = Some((c == '+', String::new()));
                }
                other => {
                    if let Some((_, name)) = current.as_mut() {
                        name.push(other);
                    }
                }
            }
        }
        if let Some(t) = current.take() {
            out.push(t);
        }
        out
    }

    /// All decoded parameters.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Positional parameter by index.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Value of the first `key`-prefixed parameter at or after `start`.
    #[must_use]
    pub fn named(&self, key: &str, start: usize) -> Option<&str> {
        debug_assert_eq!(key.len(), 2);
        self.params
            .iter()
            .skip(start)
            .find(|p| p.as_bytes().get(..2) == Some(key.as_bytes()))
            .map(|p| &p[2..])
    }

    /// True when the named parameter equals `"1"`.
    #[must_use]
    pub fn flag(&self, key: &str, start: usize) -> bool {
        self.named(key, start) == Some("1")
    }

    /// Parse the first parameter as a status token (for `STA`).
    pub fn sta_status(&self) -> Result<AdcStatus, ProtoError> {
        let token = self.param(0).ok_or(ProtoError::MissingParameter(0))?;
        AdcStatus::parse(token)
    }
}

/// Shorthand for a fatal hub-directed error status.
#[must_use]
pub fn fatal_status(code: u8, message: &str) -> AdcCommand {
    AdcCommand::status(CommandType::Hub, AdcStatus::new(Severity::Fatal, code), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hub_sup() {
        let c = AdcCommand::parse("ISUP ADBAS0 ADTIGR\n").unwrap();
        assert_eq!(c.typ(), CommandType::Info);
        assert_eq!(c.code(), Code::SUP);
        assert_eq!(c.params(), ["ADBAS0", "ADTIGR"]);
    }

    #[test]
    fn parses_broadcast_inf() {
        let c = AdcCommand::parse("BINF AAAB NIfoo\\sbar SS123").unwrap();
        assert_eq!(c.from(), Sid::parse("AAAB").unwrap());
        assert_eq!(c.named("NI", 0), Some("foo bar"));
        assert_eq!(c.named("SS", 0), Some("123"));
        assert_eq!(c.named("XX", 0), None);
    }

    #[test]
    fn parses_direct_with_destination() {
        let c = AdcCommand::parse("DCTM AAAB AAAC ADC/1.0 3000 token").unwrap();
        assert_eq!(c.from().to_string(), "AAAB");
        assert_eq!(c.to().to_string(), "AAAC");
        assert_eq!(c.param(0), Some("ADC/1.0"));
        assert_eq!(c.param(2), Some("token"));
    }

    #[test]
    fn feature_filter_tokens() {
        let c = AdcCommand::parse("FSCH AAAB +TCP4-NAT0 ANubuntu").unwrap();
        assert_eq!(
            c.feature_tokens(),
            vec![(true, "TCP4".to_string()), (false, "NAT0".to_string())]
        );
        assert_eq!(c.param(0), Some("ANubuntu"));
    }

    #[test]
    fn escape_roundtrip() {
        for s in ["plain", "with space", "line\nbreak", "back\\slash", " \\n "] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }

    #[test]
    fn serialize_matches_wire_form() {
        let sid = Sid::parse("AAAB").unwrap();
        let c = AdcCommand::broadcast(Code::SCH)
            .add_named("AN", "ubuntu iso")
            .add_named("GE", "734003200");
        assert_eq!(c.to_line(sid), "BSCH AAAB ANubuntu\\siso GE734003200\n");
    }

    #[test]
    fn line_roundtrip() {
        let sid = Sid::parse("AAAB").unwrap();
        let original = AdcCommand::direct(Code::MSG, Sid::parse("AAAC").unwrap())
            .add_param("hello there")
            .add_named("PM", "AAAB");
        let parsed = AdcCommand::parse(&original.to_line(sid)).unwrap();
        assert_eq!(parsed.code(), Code::MSG);
        assert_eq!(parsed.from(), sid);
        assert_eq!(parsed.param(0), Some("hello there"));
        assert_eq!(parsed.named("PM", 1), Some("AAAB"));
    }

    #[test]
    fn four_cc_dispatch_key() {
        let c = AdcCommand::parse("ISTA 141 denied FCBMSG").unwrap();
        assert_eq!(c.sta_status().unwrap().to_string(), "141");
        assert_eq!(c.named("FC", 1), Some("BMSG"));
        assert_eq!(FourCc::parse("BMSG"), Some(FourCc(*b"BMSG")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(AdcCommand::parse("XY").is_err());
        assert!(AdcCommand::parse("QINF AAAB").is_err());
        assert!(AdcCommand::parse("BINF").is_err());
    }
}

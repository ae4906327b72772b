//! Feature identifiers exchanged during `SUP` negotiation and advertised
//! in the `SU` identity field.

/// `SUP` tokens (with the `AD` add-prefix).
pub mod sup {
    /// Base protocol, current revision.
    pub const BASE: &str = "ADBASE";
    /// Base protocol, draft revision some hubs still announce.
    pub const BAS0: &str = "ADBAS0";
    /// Tiger tree hash support.
    pub const TIGR: &str = "ADTIGR";
    /// Hub user commands.
    pub const UCM0: &str = "ADUCM0";
    /// Bloom filter share summaries.
    pub const BLO0: &str = "ADBLO0";
    /// Compressed command stream (`ZON`/`ZOF`).
    pub const ZLIF: &str = "ADZLIF";
    /// Secondary-protocol (hybrid connectivity) validation.
    pub const HBRI: &str = "ADHBRI";
}

/// `SU` identity tokens.
pub mod su {
    /// TLS client-client connections.
    pub const ADCS: &str = "ADC0";
    /// Active TCP over IPv4.
    pub const TCP4: &str = "TCP4";
    /// Active TCP over IPv6.
    pub const TCP6: &str = "TCP6";
    /// Active UDP over IPv4.
    pub const UDP4: &str = "UDP4";
    /// Active UDP over IPv6.
    pub const UDP6: &str = "UDP6";
    /// NAT traversal handshake.
    pub const NAT0: &str = "NAT0";
    /// Grouped search extensions.
    pub const SEGA: &str = "SEGA";
    /// Encrypted private channels.
    pub const CCPM: &str = "CCPM";
    /// Extended (directed) search.
    pub const ASCH: &str = "ASCH";
    /// Encrypted UDP search results.
    pub const SUD1: &str = "SUD1";
}

/// Client-client protocol strings.
pub const CLIENT_PROTOCOL: &str = "ADC/1.0";
/// TLS client-client protocol string.
pub const SECURE_CLIENT_PROTOCOL: &str = "ADCS/0.10";

/// Check whether a comma-separated `SU` value contains a feature.
#[must_use]
pub fn supports(su_value: &str, feature: &str) -> bool {
    su_value.split(',').any(|f| f == feature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn su_membership() {
        assert!(supports("SEGA,ADC0,TCP4,UDP4", su::TCP4));
        assert!(!supports("SEGA,ADC0", su::NAT0));
        assert!(!supports("", su::SEGA));
    }
}

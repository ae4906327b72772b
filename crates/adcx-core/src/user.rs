//! Users, identities and their per-hub bindings.
//!
//! A [`User`] is the hub-independent entity keyed by CID; an [`Identity`]
//! is the attribute map one hub reports for it; an [`OnlineUser`] binds an
//! identity to one hub session. The same user can be online on several
//! hubs at once, each binding owned by its hub.

use adcx_proto::features::{self, su};
use adcx_proto::{Cid, Sid};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// User capability and state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserFlags(u32);

impl UserFlags {
    /// Online on at least one hub.
    pub const ONLINE: u32 = 1 << 0;
    /// Hub-declared bot.
    pub const BOT: u32 = 1 << 1;
    /// The hub's own identity.
    pub const HUB: u32 = 1 << 2;
    /// Favorite user.
    pub const FAVORITE: u32 = 1 << 3;
    /// Messages from this user are dropped.
    pub const IGNORED: u32 = 1 << 4;
    /// Supports TLS client connections.
    pub const TLS: u32 = 1 << 5;
    /// Supports encrypted private channels.
    pub const CCPM: u32 = 1 << 6;
    /// Supports directed search.
    pub const ASCH: u32 = 1 << 7;
    /// Reached only over the legacy protocol.
    pub const NMDC: u32 = 1 << 8;
    /// Peer rejected the plain client protocol.
    pub const NO_ADC_1_0: u32 = 1 << 9;
    /// Peer rejected the TLS client protocol.
    pub const NO_ADCS_0_10: u32 = 1 << 10;

    /// Is `flag` set?
    #[must_use]
    pub fn is_set(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// A hub-independent user, shared between hubs, queue and chats.
#[derive(Debug)]
pub struct User {
    /// Content identifier.
    pub cid: Cid,
    flags: AtomicU32,
}

impl User {
    /// New user with no flags.
    #[must_use]
    pub fn new(cid: Cid) -> Arc<Self> {
        Arc::new(User {
            cid,
            flags: AtomicU32::new(0),
        })
    }

    /// Set a flag.
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    /// Clear a flag.
    pub fn unset_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    /// Is `flag` set?
    #[must_use]
    pub fn is_set(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    /// Snapshot of the flag set.
    #[must_use]
    pub fn flags(&self) -> UserFlags {
        UserFlags(self.flags.load(Ordering::Relaxed))
    }
}

/// Cached TCP/UDP connectivity classification against our own identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Not computed yet
    #[default]
    Undefined,
    /// The user is ourselves
    Me,
    /// No shared IP protocol
    NoConnectIp,
    /// Both sides passive
    NoConnectPassive,
    /// Active over both families
    ActiveDual,
    /// Active over IPv4
    ActiveV4,
    /// Active over IPv6
    ActiveV6,
    /// Peer passive, we are active over IPv4
    PassiveV4,
    /// Peer passive, we are active over IPv6
    PassiveV6,
    /// Support unknown, IPv4 visible
    PassiveV4Unknown,
    /// Support unknown, IPv6 visible
    PassiveV6Unknown,
}

impl ConnectMode {
    /// Can a connection be attempted in this mode?
    #[must_use]
    pub fn allows_connections(self) -> bool {
        !matches!(
            self,
            ConnectMode::Undefined | ConnectMode::Me | ConnectMode::NoConnectIp
                | ConnectMode::NoConnectPassive
        )
    }

    /// Is the peer directly reachable (no reverse request needed)?
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectMode::ActiveDual | ConnectMode::ActiveV4 | ConnectMode::ActiveV6
        )
    }

    /// May IPv4 be used in this mode?
    #[must_use]
    pub fn allows_v4(self) -> bool {
        matches!(
            self,
            ConnectMode::ActiveDual
                | ConnectMode::ActiveV4
                | ConnectMode::PassiveV4
                | ConnectMode::PassiveV4Unknown
        )
    }

    /// May IPv6 be used in this mode?
    #[must_use]
    pub fn allows_v6(self) -> bool {
        matches!(
            self,
            ConnectMode::ActiveDual
                | ConnectMode::ActiveV6
                | ConnectMode::PassiveV6
                | ConnectMode::PassiveV6Unknown
        )
    }
}

/// The attribute map a hub reports for one user, with cached
/// classifications.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    sid: Sid,
    attributes: HashMap<String, String>,
    tcp_mode: ConnectMode,
    udp_mode: ConnectMode,
}

impl Identity {
    /// Empty identity bound to a SID.
    #[must_use]
    pub fn new(sid: Sid) -> Self {
        Identity {
            sid,
            ..Default::default()
        }
    }

    /// Session ID on this hub.
    #[must_use]
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Raw attribute by two-letter key.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.attributes.get(key).map_or("", String::as_str)
    }

    /// Set (or with an empty value, clear) an attribute.
    pub fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.attributes.remove(key);
        } else {
            self.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Nick (`NI`).
    #[must_use]
    pub fn nick(&self) -> &str {
        self.get("NI")
    }

    /// Description (`DE`).
    #[must_use]
    pub fn description(&self) -> &str {
        self.get("DE")
    }

    /// IPv4 address (`I4`).
    #[must_use]
    pub fn ip4(&self) -> &str {
        self.get("I4")
    }

    /// IPv6 address (`I6`).
    #[must_use]
    pub fn ip6(&self) -> &str {
        self.get("I6")
    }

    /// UDP port for the visible family.
    #[must_use]
    pub fn udp_port(&self) -> &str {
        if !self.ip6().is_empty() && !self.get("U6").is_empty() {
            self.get("U6")
        } else {
            self.get("U4")
        }
    }

    /// UDP address for search results.
    #[must_use]
    pub fn udp_ip(&self) -> &str {
        if !self.ip6().is_empty() && !self.get("U6").is_empty() {
            self.ip6()
        } else {
            self.ip4()
        }
    }

    /// Shared bytes (`SS`).
    #[must_use]
    pub fn bytes_shared(&self) -> u64 {
        self.get("SS").parse().unwrap_or(0)
    }

    /// Shared file count (`SF`).
    #[must_use]
    pub fn files_shared(&self) -> u64 {
        self.get("SF").parse().unwrap_or(0)
    }

    /// Does the comma-separated `SU` field contain `feature`?
    #[must_use]
    pub fn supports(&self, feature: &str) -> bool {
        features::supports(self.get("SU"), feature)
    }

    /// Client type bits (`CT`).
    #[must_use]
    pub fn client_type(&self) -> u32 {
        self.get("CT").parse().unwrap_or(0)
    }

    /// Bot bit of `CT`.
    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.client_type() & 0x01 != 0
    }

    /// Hub bit of `CT`.
    #[must_use]
    pub fn is_hub(&self) -> bool {
        self.client_type() & 0x20 != 0
    }

    /// Operator bits of `CT`.
    #[must_use]
    pub fn is_op(&self) -> bool {
        self.client_type() & (0x04 | 0x08 | 0x10) != 0
    }

    /// Hidden-user flag (`HI`).
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.get("HI") == "1"
    }

    /// TLS keyprint (`KP`).
    #[must_use]
    pub fn keyprint(&self) -> &str {
        self.get("KP")
    }

    /// Active over TCP4 (advertises the feature and an address)?
    #[must_use]
    pub fn is_tcp4_active(&self) -> bool {
        !self.ip4().is_empty() && self.ip4() != "0.0.0.0" && self.supports(su::TCP4)
    }

    /// Active over TCP6?
    #[must_use]
    pub fn is_tcp6_active(&self) -> bool {
        !self.ip6().is_empty() && self.ip6() != "::" && self.supports(su::TCP6)
    }

    /// Active over UDP in any family?
    #[must_use]
    pub fn is_udp_active(&self) -> bool {
        (!self.get("U4").is_empty() && self.supports(su::UDP4))
            || (!self.get("U6").is_empty() && self.supports(su::UDP6))
    }

    /// Cached TCP classification.
    #[must_use]
    pub fn tcp_mode(&self) -> ConnectMode {
        self.tcp_mode
    }

    /// Cached UDP classification.
    #[must_use]
    pub fn udp_mode(&self) -> ConnectMode {
        self.udp_mode
    }

    /// Recompute both connect-mode classifications against our own
    /// identity. Returns true when either changed.
    pub fn update_connect_modes(&mut self, me: &Identity, is_me: bool) -> bool {
        let tcp = if is_me {
            ConnectMode::Me
        } else {
            classify(
                self.is_tcp4_active(),
                self.is_tcp6_active(),
                !self.ip4().is_empty(),
                !self.ip6().is_empty(),
                self.get("SU").is_empty(),
                me.is_tcp4_active(),
                me.is_tcp6_active(),
                !me.ip4().is_empty(),
                !me.ip6().is_empty(),
            )
        };
        let udp = if is_me {
            ConnectMode::Me
        } else {
            classify(
                !self.get("U4").is_empty() && self.supports(su::UDP4),
                !self.get("U6").is_empty() && self.supports(su::UDP6),
                !self.ip4().is_empty(),
                !self.ip6().is_empty(),
                self.get("SU").is_empty(),
                !me.get("U4").is_empty(),
                !me.get("U6").is_empty(),
                !me.ip4().is_empty(),
                !me.ip6().is_empty(),
            )
        };

        let changed = tcp != self.tcp_mode || udp != self.udp_mode;
        self.tcp_mode = tcp;
        self.udp_mode = udp;
        changed
    }
}

#[allow(clippy::too_many_arguments, clippy::fn_params_excessive_bools)]
fn classify(
    peer_active_v4: bool,
    peer_active_v6: bool,
    peer_has_v4: bool,
    peer_has_v6: bool,
    peer_support_unknown: bool,
    me_active_v4: bool,
    me_active_v6: bool,
    me_has_v4: bool,
    me_has_v6: bool,
) -> ConnectMode {
    let common_v4 = peer_has_v4 && me_has_v4;
    let common_v6 = peer_has_v6 && me_has_v6;

    if !common_v4 && !common_v6 {
        return ConnectMode::NoConnectIp;
    }

    // Peer reachable directly.
    if peer_active_v4 && common_v4 && peer_active_v6 && common_v6 {
        return ConnectMode::ActiveDual;
    }
    if peer_active_v6 && common_v6 {
        return ConnectMode::ActiveV6;
    }
    if peer_active_v4 && common_v4 {
        return ConnectMode::ActiveV4;
    }

    // Peer passive: we must accept the connection instead.
    if me_active_v6 && common_v6 {
        return if peer_support_unknown {
            ConnectMode::PassiveV6Unknown
        } else {
            ConnectMode::PassiveV6
        };
    }
    if me_active_v4 && common_v4 {
        return if peer_support_unknown {
            ConnectMode::PassiveV4Unknown
        } else {
            ConnectMode::PassiveV4
        };
    }

    ConnectMode::NoConnectPassive
}

/// An identity bound to one hub session.
#[derive(Debug)]
pub struct OnlineUser {
    /// The shared hub-independent user.
    pub user: Arc<User>,
    /// Hub URL this binding belongs to.
    pub hub_url: String,
    identity: RwLock<Identity>,
}

impl OnlineUser {
    /// Bind a user to a hub session.
    #[must_use]
    pub fn new(user: Arc<User>, hub_url: String, sid: Sid) -> Arc<Self> {
        Arc::new(OnlineUser {
            user,
            hub_url,
            identity: RwLock::new(Identity::new(sid)),
        })
    }

    /// Snapshot of the identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    /// Session ID.
    #[must_use]
    pub fn sid(&self) -> Sid {
        self.identity.read().sid()
    }

    /// Nick, cloned out of the identity.
    #[must_use]
    pub fn nick(&self) -> String {
        self.identity.read().nick().to_string()
    }

    /// Mutate the identity in place.
    pub fn with_identity_mut<R>(&self, f: impl FnOnce(&mut Identity) -> R) -> R {
        f(&mut self.identity.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::Pid;

    fn identity(sid: &str, attrs: &[(&str, &str)]) -> Identity {
        let mut id = Identity::new(Sid::parse(sid).unwrap());
        for (k, v) in attrs {
            id.set(k, v);
        }
        id
    }

    #[test]
    fn attribute_basics() {
        let mut id = identity("AAAB", &[("NI", "alice"), ("SS", "1234"), ("SU", "TCP4,UDP4")]);
        assert_eq!(id.nick(), "alice");
        assert_eq!(id.bytes_shared(), 1234);
        assert!(id.supports("TCP4"));
        assert!(!id.supports("TCP6"));

        id.set("NI", "");
        assert_eq!(id.nick(), "");
    }

    #[test]
    fn client_type_bits() {
        let bot = identity("AAAB", &[("CT", "1")]);
        assert!(bot.is_bot());
        let hub = identity("AAAB", &[("CT", "32")]);
        assert!(hub.is_hub());
        let op = identity("AAAB", &[("CT", "4")]);
        assert!(op.is_op());
    }

    #[test]
    fn active_dual_classification() {
        let me = identity(
            "AAAA",
            &[("I4", "1.2.3.4"), ("I6", "::2"), ("SU", "TCP4,TCP6,UDP4,UDP6"), ("U4", "1000")],
        );
        let mut peer = identity(
            "AAAB",
            &[("I4", "5.6.7.8"), ("I6", "::3"), ("SU", "TCP4,TCP6")],
        );
        assert!(peer.update_connect_modes(&me, false));
        assert_eq!(peer.tcp_mode(), ConnectMode::ActiveDual);
        assert!(peer.tcp_mode().is_active());
    }

    #[test]
    fn passive_peer_against_active_me() {
        let me = identity("AAAA", &[("I4", "1.2.3.4"), ("SU", "TCP4,UDP4")]);
        let mut peer = identity("AAAB", &[("I4", "5.6.7.8"), ("SU", "SEGA")]);
        peer.update_connect_modes(&me, false);
        assert_eq!(peer.tcp_mode(), ConnectMode::PassiveV4);
        assert!(peer.tcp_mode().allows_connections());
        assert!(!peer.tcp_mode().is_active());
    }

    #[test]
    fn both_passive_cannot_connect() {
        let me = identity("AAAA", &[("I4", "1.2.3.4")]);
        let mut peer = identity("AAAB", &[("I4", "5.6.7.8"), ("SU", "SEGA")]);
        peer.update_connect_modes(&me, false);
        assert_eq!(peer.tcp_mode(), ConnectMode::NoConnectPassive);
        assert!(!peer.tcp_mode().allows_connections());
    }

    #[test]
    fn disjoint_families_cannot_connect() {
        let me = identity("AAAA", &[("I6", "::2"), ("SU", "TCP6")]);
        let mut peer = identity("AAAB", &[("I4", "5.6.7.8"), ("SU", "TCP4")]);
        peer.update_connect_modes(&me, false);
        assert_eq!(peer.tcp_mode(), ConnectMode::NoConnectIp);
    }

    #[test]
    fn me_mode() {
        let me = identity("AAAA", &[("I4", "1.2.3.4")]);
        let mut mine = me.clone();
        mine.update_connect_modes(&me, true);
        assert_eq!(mine.tcp_mode(), ConnectMode::Me);
    }

    #[test]
    fn user_flags() {
        let user = User::new(Pid::from_bytes([1; 24]).derive_cid());
        user.set_flag(UserFlags::TLS | UserFlags::CCPM);
        assert!(user.is_set(UserFlags::TLS));
        assert!(user.is_set(UserFlags::CCPM));
        user.unset_flag(UserFlags::TLS);
        assert!(!user.is_set(UserFlags::TLS));
        assert!(user.flags().is_set(UserFlags::CCPM));
    }
}

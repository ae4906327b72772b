//! Cross-hub bookkeeping.
//!
//! The registry owns the user store (one [`User`] per CID, created on
//! first reference) and the online multimap (CID → hub bindings), and
//! resolves clients by URL or by session token. Broadcasts fan a command
//! out to every connected hub.

use crate::client::HubClient;
use crate::user::{OnlineUser, User, UserFlags};
use adcx_proto::Cid;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Hub membership counts advertised in `INF` (`HN`/`HR`/`HO`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubCounts {
    /// Hubs where we are a normal user.
    pub normal: u32,
    /// Hubs where we are registered.
    pub registered: u32,
    /// Hubs where we are an operator.
    pub op: u32,
}

/// URL → client and token → client maps plus user bookkeeping.
#[derive(Default)]
pub struct ClientRegistry {
    by_url: DashMap<String, Arc<HubClient>>,
    by_token: DashMap<u32, Arc<HubClient>>,
    users: DashMap<Cid, Arc<User>>,
    online: DashMap<Cid, Vec<Arc<OnlineUser>>>,
    next_token: AtomicU32,
}

impl ClientRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(ClientRegistry {
            next_token: AtomicU32::new(1),
            ..Default::default()
        })
    }

    /// Allocate a session token for a new client.
    pub fn allocate_token(&self) -> u32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a client under its URL and token.
    pub fn register(&self, client: Arc<HubClient>) {
        self.by_url.insert(client.url().to_string(), Arc::clone(&client));
        self.by_token.insert(client.token(), client);
    }

    /// Remove a client; its users are put offline first by the caller.
    pub fn unregister(&self, url: &str) -> Option<Arc<HubClient>> {
        let client = self.by_url.remove(url).map(|(_, c)| c)?;
        self.by_token.remove(&client.token());
        Some(client)
    }

    /// Client by hub URL.
    #[must_use]
    pub fn by_url(&self, url: &str) -> Option<Arc<HubClient>> {
        self.by_url.get(url).map(|c| Arc::clone(&c))
    }

    /// Client by session token (the numeric prefix of search tokens).
    #[must_use]
    pub fn by_token(&self, token: u32) -> Option<Arc<HubClient>> {
        self.by_token.get(&token).map(|c| Arc::clone(&c))
    }

    /// Snapshot of all clients.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<HubClient>> {
        self.by_url.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Fetch or create the user for a CID.
    #[must_use]
    pub fn user(&self, cid: Cid) -> Arc<User> {
        self.users
            .entry(cid)
            .or_insert_with(|| User::new(cid))
            .clone()
    }

    /// A user came online on some hub.
    pub fn put_online(&self, online: &Arc<OnlineUser>) {
        online.user.set_flag(UserFlags::ONLINE);
        self.online
            .entry(online.user.cid)
            .or_default()
            .push(Arc::clone(online));
    }

    /// A hub binding went away. Clears the online flag with the last one.
    pub fn put_offline(&self, online: &Arc<OnlineUser>) {
        let mut gone = false;
        if let Some(mut list) = self.online.get_mut(&online.user.cid) {
            list.retain(|o| !Arc::ptr_eq(o, online));
            gone = list.is_empty();
        }
        if gone {
            self.online.remove(&online.user.cid);
            online.user.unset_flag(UserFlags::ONLINE);
        }
    }

    /// All hub bindings of a user.
    #[must_use]
    pub fn online_users(&self, cid: &Cid) -> Vec<Arc<OnlineUser>> {
        self.online.get(cid).map(|l| l.clone()).unwrap_or_default()
    }

    /// Is the user online anywhere?
    #[must_use]
    pub fn is_online(&self, cid: &Cid) -> bool {
        self.online.contains_key(cid)
    }

    /// Current membership counts across connected hubs.
    #[must_use]
    pub fn hub_counts(&self) -> HubCounts {
        let mut counts = HubCounts::default();
        for client in self.by_url.iter() {
            if !client.is_counted() {
                continue;
            }
            let my = client.my_identity();
            if my.is_op() {
                counts.op += 1;
            } else if client.is_registered() {
                counts.registered += 1;
            } else {
                counts.normal += 1;
            }
        }
        counts
    }

    /// Send a command on every connected hub.
    pub fn broadcast(&self, command: &adcx_proto::AdcCommand) {
        for client in self.by_url.iter() {
            if client.is_connected() {
                let _ = client.send(command.clone());
            }
        }
    }

    /// Profiles shared with the hubs a user is on.
    #[must_use]
    pub fn profiles_for_user(&self, cid: &Cid) -> std::collections::BTreeSet<u32> {
        self.online_users(cid)
            .iter()
            .filter_map(|o| self.by_url(&o.hub_url))
            .map(|c| c.settings().share_profile)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::{Pid, Sid};

    fn cid(seed: u8) -> Cid {
        Pid::from_bytes([seed; 24]).derive_cid()
    }

    #[test]
    fn user_store_is_shared() {
        let registry = ClientRegistry::new();
        let a = registry.user(cid(1));
        let b = registry.user(cid(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.user(cid(2))));
    }

    #[test]
    fn online_multimap_tracks_bindings() {
        let registry = ClientRegistry::new();
        let user = registry.user(cid(1));

        let first = OnlineUser::new(
            Arc::clone(&user),
            "adc://a.example:411".into(),
            Sid::parse("AAAB").unwrap(),
        );
        let second = OnlineUser::new(
            Arc::clone(&user),
            "adc://b.example:411".into(),
            Sid::parse("AAAC").unwrap(),
        );

        registry.put_online(&first);
        registry.put_online(&second);
        assert!(user.is_set(UserFlags::ONLINE));
        assert_eq!(registry.online_users(&cid(1)).len(), 2);

        registry.put_offline(&first);
        assert!(user.is_set(UserFlags::ONLINE));
        registry.put_offline(&second);
        assert!(!user.is_set(UserFlags::ONLINE));
        assert!(!registry.is_online(&cid(1)));
    }

    #[test]
    fn tokens_are_unique() {
        let registry = ClientRegistry::new();
        let a = registry.allocate_token();
        let b = registry.allocate_token();
        assert_ne!(a, b);
    }
}

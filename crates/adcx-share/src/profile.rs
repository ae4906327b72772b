//! Share profiles and root bookkeeping.
//!
//! A profile is a named view: a directory is visible in profile `P` iff
//! one of its ancestor roots carries `P` in its profile set.

use crate::dual_string::DualString;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Identifier of a share profile.
pub type ProfileToken = u32;

/// The default profile every install starts with.
pub const DEFAULT_PROFILE: ProfileToken = 0;

/// Hidden profile; shares nothing and never answers list requests.
pub const HIDDEN_PROFILE: ProfileToken = u32::MAX;

/// A named view over a subset of the share roots.
pub struct ShareProfile {
    /// Profile identifier.
    pub token: ProfileToken,
    /// Display name.
    pub name: String,
    /// Cached generated file list, invalidated by refreshes.
    list_cache: Mutex<Option<GeneratedList>>,
}

/// A generated full file list kept for re-serving.
#[derive(Clone)]
pub struct GeneratedList {
    /// Plain XML document.
    pub xml: Vec<u8>,
    /// bzip2-compressed document.
    pub bz2: Vec<u8>,
    /// Share revision the list was built from.
    pub revision: u64,
}

impl ShareProfile {
    /// New profile with an empty list cache.
    #[must_use]
    pub fn new(token: ProfileToken, name: impl Into<String>) -> Self {
        ShareProfile {
            token,
            name: name.into(),
            list_cache: Mutex::new(None),
        }
    }

    /// Fetch the cached list if it matches `revision`, otherwise build one
    /// via `generate` while holding the per-profile generation lock (one
    /// generation at a time per profile).
    pub fn cached_list<F>(&self, revision: u64, generate: F) -> GeneratedList
    where
        F: FnOnce() -> GeneratedList,
    {
        let mut cache = self.list_cache.lock();
        if let Some(list) = cache.as_ref() {
            if list.revision == revision {
                return list.clone();
            }
        }
        let fresh = generate();
        *cache = Some(fresh.clone());
        fresh
    }

    /// Drop the cached list.
    pub fn invalidate(&self) {
        self.list_cache.lock().take();
    }
}

/// Refresh lifecycle of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefreshState {
    /// Not being refreshed
    Normal = 0,
    /// Queued for refresh
    Pending = 1,
    /// Refresh in progress
    Running = 2,
}

/// A mounted share root.
pub struct ShareRoot {
    /// Real filesystem path of the root (directory, with trailing separator
    /// normalized away).
    pub path: PathBuf,
    /// Lower-cased path used as the index key.
    pub path_lower: String,
    /// Virtual name the root appears under.
    pub virtual_name: DualString,
    /// Profiles this root belongs to.
    profiles: RwLock<BTreeSet<ProfileToken>>,
    /// Incoming roots are picked up by `REFRESH_INCOMING`.
    pub incoming: bool,
    last_refresh: AtomicU64,
    refresh_state: AtomicU8,
}

impl ShareRoot {
    /// Describe a new root.
    #[must_use]
    pub fn new(
        path: PathBuf,
        virtual_name: impl Into<String>,
        profiles: BTreeSet<ProfileToken>,
        incoming: bool,
    ) -> Self {
        let path_lower = path.to_string_lossy().to_lowercase();
        ShareRoot {
            path,
            path_lower,
            virtual_name: DualString::new(virtual_name),
            profiles: RwLock::new(profiles),
            incoming,
            last_refresh: AtomicU64::new(0),
            refresh_state: AtomicU8::new(RefreshState::Normal as u8),
        }
    }

    /// Is this root visible to `profile`?
    #[must_use]
    pub fn has_profile(&self, profile: ProfileToken) -> bool {
        self.profiles.read().contains(&profile)
    }

    /// Snapshot of the profile set.
    #[must_use]
    pub fn profiles(&self) -> BTreeSet<ProfileToken> {
        self.profiles.read().clone()
    }

    /// Replace the profile set.
    pub fn set_profiles(&self, profiles: BTreeSet<ProfileToken>) {
        *self.profiles.write() = profiles;
    }

    /// Unix time of the last completed refresh.
    #[must_use]
    pub fn last_refresh(&self) -> u64 {
        self.last_refresh.load(Ordering::Relaxed)
    }

    /// Record a completed refresh.
    pub fn set_last_refresh(&self, time: u64) {
        self.last_refresh.store(time, Ordering::Relaxed);
    }

    /// Current refresh lifecycle state.
    #[must_use]
    pub fn refresh_state(&self) -> RefreshState {
        match self.refresh_state.load(Ordering::Relaxed) {
            1 => RefreshState::Pending,
            2 => RefreshState::Running,
            _ => RefreshState::Normal,
        }
    }

    /// Move to a new refresh lifecycle state.
    pub fn set_refresh_state(&self, state: RefreshState) {
        self.refresh_state.store(state as u8, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_visibility() {
        let root = ShareRoot::new(
            PathBuf::from("/mnt/media"),
            "Media",
            [0, 3].into_iter().collect(),
            false,
        );
        assert!(root.has_profile(0));
        assert!(root.has_profile(3));
        assert!(!root.has_profile(1));

        root.set_profiles([1].into_iter().collect());
        assert!(root.has_profile(1));
        assert!(!root.has_profile(0));
    }

    #[test]
    fn list_cache_by_revision() {
        let profile = ShareProfile::new(0, "default");
        let first = profile.cached_list(1, || GeneratedList {
            xml: b"one".to_vec(),
            bz2: Vec::new(),
            revision: 1,
        });
        assert_eq!(first.xml, b"one");

        // Same revision: generator must not run.
        let again = profile.cached_list(1, || panic!("generator re-ran"));
        assert_eq!(again.xml, b"one");

        // New revision rebuilds.
        let fresh = profile.cached_list(2, || GeneratedList {
            xml: b"two".to_vec(),
            bz2: Vec::new(),
            revision: 2,
        });
        assert_eq!(fresh.xml, b"two");
    }
}

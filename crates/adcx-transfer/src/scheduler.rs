//! Slot accounting and the `GET` preparation pipeline.
//!
//! Slot classes: standard slots (configured count), extra slots for
//! mini-files, extra slots for partial-sharing peers, one logical
//! multi-connection (MCN) slot per user with extra sockets inside it, and
//! up to eight small-file slots. A connection keeps its granted slot
//! across requests; the slot is released when the connection goes away.

use crate::error::UploadError;
use crate::stream::UploadStream;
use crate::upload::{TransferKind, Upload};
use adcx_proto::tth::TthValue;
use adcx_proto::{Cid, USER_LIST_NAME, USER_LIST_NAME_BZ};
use adcx_share::filelist::{generate_full_list, generate_partial_list, generate_tth_list};
use adcx_share::profile::ProfileToken;
use adcx_share::{HashStore, ShareError, ShareTree};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Small-file threshold: 64 KiB plus one tree block of slack.
pub const SMALL_FILE_LIMIT: u64 = 65_792;

/// Maximum concurrent small-file slots.
pub const MAX_SMALL_SLOTS: u32 = 8;

/// Seconds a notified peer keeps its cached token.
pub const NOTIFY_TIMEOUT_SECS: u64 = 90;

/// Seconds a finished chunked upload lingers in the delay pool.
pub const DELAY_POOL_SECS: u64 = 10;

/// Slot classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotKind {
    /// No slot granted yet
    #[default]
    None,
    /// A standard slot
    Std,
    /// Mini-file extra slot
    Extra,
    /// Partial-sharing extra slot
    Partial,
    /// Multi-connection slot (per user)
    Mcn,
    /// Small-file slot
    Small,
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Standard slot count.
    pub slots: u32,
    /// Extra slots grantable for mini-files.
    pub extra_slots: u32,
    /// Extra slots grantable for partial-sharing peers.
    pub extra_partial_slots: u32,
    /// Files at or below this many bytes qualify for a mini slot.
    pub minislot_size: u64,
    /// File extensions (lower-cased) always treated as mini-slot files.
    pub free_extensions: Vec<String>,
    /// Grant bonus slots while total upload speed is below this (bytes/s);
    /// zero disables auto-grants.
    pub auto_slot_speed_limit: u64,
    /// Bonus slots the auto-grant may open.
    pub max_auto_opened: u32,
    /// Max sockets per MCN user; zero means unlimited.
    pub slots_per_user: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            slots: 2,
            extra_slots: 3,
            extra_partial_slots: 1,
            minislot_size: 512 * 1024,
            free_extensions: vec!["nfo".into(), "sfv".into(), "txt".into()],
            auto_slot_speed_limit: 0,
            max_auto_opened: 1,
            slots_per_user: 2,
        }
    }
}

/// The requesting peer, as the hub layer knows it.
#[derive(Debug, Clone)]
pub struct UploadUser {
    /// Content ID.
    pub cid: Cid,
    /// Profile resolved from the hub the request arrived through.
    pub profile: ProfileToken,
    /// All profiles shared with hubs this user is on.
    pub profiles: BTreeSet<ProfileToken>,
    /// Favorite user with an always-granted slot.
    pub favorite: bool,
    /// Hub operator.
    pub op: bool,
    /// Supports multiple connections.
    pub mcn: bool,
    /// Advertises mini-slot support.
    pub supports_minislots: bool,
}

/// A decoded `GET` request.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Type token: `file`, `tthl` or `list`.
    pub kind: String,
    /// Virtual path, `TTH/<base32>` form, or a list path.
    pub path: String,
    /// Range start.
    pub start: i64,
    /// Range length; `-1` means to the end.
    pub bytes: i64,
    /// `RE1`: recursive partial list.
    pub recursive: bool,
    /// The list request asks for TTH entries only.
    pub tth_list: bool,
    /// Slot currently held by the requesting connection.
    pub current_slot: SlotKind,
}

/// A partially downloaded file offered through partial sharing.
#[derive(Debug, Clone)]
pub struct PartialSource {
    /// Real path of the partial file.
    pub path: PathBuf,
    /// Final size of the complete file.
    pub file_size: u64,
}

/// Supplier of partially downloaded files (the download queue).
pub trait PartialSourceProvider: Send + Sync {
    /// A partial file whose tree may be served.
    fn find_partial_file(&self, tth: &TthValue) -> Option<PartialSource>;

    /// A partial file with `[start, start+len)` already on disk.
    fn chunk_downloaded(&self, tth: &TthValue, start: u64, len: i64) -> Option<PartialSource>;
}

/// Result of a granted request.
#[derive(Debug)]
pub struct PreparedUpload {
    /// Accounting handle registered with the scheduler.
    pub upload: Arc<Upload>,
    /// Slot the connection now holds.
    pub slot: SlotKind,
    /// Range start to echo in `SND`.
    pub start: u64,
    /// Byte count to echo in `SND`.
    pub length: u64,
}

struct WaitingUser {
    user: Cid,
    token: String,
    files: Vec<String>,
}

#[derive(Default)]
struct State {
    running: u32,
    extra: u32,
    extra_partial: u32,
    small_slots: u32,
    mcn_slots: u32,
    multi_uploads: HashMap<Cid, u16>,
    reserved: HashMap<Cid, u64>,
    notified: HashMap<Cid, (u64, String)>,
    queue: Vec<WaitingUser>,
    uploads: Vec<Arc<Upload>>,
    delay_pool: Vec<Arc<Upload>>,
    last_grant: u64,
}

/// The upload scheduler.
pub struct UploadScheduler {
    tree: Arc<ShareTree>,
    store: Arc<dyn HashStore>,
    partial: Option<Arc<dyn PartialSourceProvider>>,
    config: RwLock<UploadConfig>,
    state: RwLock<State>,
    next_id: AtomicU64,
    my_cid: Cid,
}

impl UploadScheduler {
    /// Build a scheduler over the share.
    #[must_use]
    pub fn new(
        tree: Arc<ShareTree>,
        store: Arc<dyn HashStore>,
        partial: Option<Arc<dyn PartialSourceProvider>>,
        config: UploadConfig,
        my_cid: Cid,
    ) -> Self {
        UploadScheduler {
            tree,
            store,
            partial,
            config: RwLock::new(config),
            state: RwLock::new(State::default()),
            next_id: AtomicU64::new(1),
            my_cid,
        }
    }

    /// Configured standard slot count.
    #[must_use]
    pub fn slots(&self) -> u32 {
        self.config.read().slots
    }

    /// Standard slots currently free.
    #[must_use]
    pub fn free_slots(&self) -> u32 {
        let state = self.state.read();
        self.config.read().slots.saturating_sub(state.running)
    }

    /// Replace the tuning parameters.
    pub fn set_config(&self, config: UploadConfig) {
        *self.config.write() = config;
    }

    /// Reserve a slot for a user until `expires` (unix seconds).
    pub fn reserve_slot(&self, user: Cid, expires: u64) {
        self.state.write().reserved.insert(user, expires);
    }

    /// Drop a reservation.
    pub fn unreserve_slot(&self, user: &Cid) {
        self.state.write().reserved.remove(user);
    }

    /// Does the user currently hold a reservation?
    #[must_use]
    pub fn has_reserved_slot(&self, user: &Cid) -> bool {
        self.state.read().reserved.contains_key(user)
    }

    /// Number of active uploads.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.state.read().uploads.len()
    }

    fn total_speed(&self) -> u64 {
        // Monotone approximation: bytes sent per second of each running
        // upload since it started.
        let state = self.state.read();
        state
            .uploads
            .iter()
            .map(|u| {
                let secs = u.elapsed().as_secs().max(1);
                u.pos() / secs
            })
            .sum()
    }

    fn auto_slot_allowed(&self, now: u64) -> bool {
        let config = self.config.read();
        if config.auto_slot_speed_limit == 0 {
            return false;
        }
        let state = self.state.read();
        if config.slots + config.max_auto_opened <= state.running {
            return false;
        }
        if now < state.last_grant + 30 {
            return false;
        }
        drop(state);
        self.total_speed() < config.auto_slot_speed_limit
    }

    /// Serve a `GET`: resolve, pick and charge a slot, open the stream.
    ///
    /// # Errors
    ///
    /// The full taxonomy of [`UploadError`]; `SlotsFull` means the peer
    /// was appended to the waiting queue.
    pub fn prepare_upload(
        &self,
        request: &UploadRequest,
        user: &UploadUser,
        token: &str,
        now: u64,
    ) -> Result<PreparedUpload, UploadError> {
        if request.path.is_empty() {
            return Err(UploadError::InvalidRequest("empty path"));
        }
        if request.start < 0 || request.bytes < -1 || request.bytes == 0 {
            return Err(UploadError::InvalidRequest("bad range"));
        }

        let resolved = self.resolve(request, user)?;

        let slot = self.charge_slot(request, user, &resolved, token, now)?;

        // Delay-pool resume: same user, same file, stream still open.
        let resumed_stream = self.take_delayed_stream(user, &resolved);
        let resumed = resumed_stream.is_some();

        let (stream, start, length) =
            match self.open_stream(request, &resolved, resumed_stream) {
                Ok(opened) => opened,
                Err(err) => {
                    // Give back a slot charged for a request that never
                    // produced an upload.
                    let mut state = self.state.write();
                    Self::transition_slot(&mut state, &user.cid, slot, request.current_slot);
                    return Err(err);
                }
            };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let upload = Arc::new(Upload::new(
            id,
            user.cid,
            resolved.display_path.clone(),
            resolved.kind,
            start,
            length,
            resolved.file_size.max(length),
            resolved.partial,
            resumed,
        ));
        upload.store_stream(stream);

        {
            let mut state = self.state.write();
            state.queue.retain(|w| w.user != user.cid);
            state.notified.remove(&user.cid);
            state.uploads.push(Arc::clone(&upload));
        }

        tracing::debug!(
            user = %user.cid,
            path = %resolved.display_path,
            kind = ?resolved.kind,
            start,
            length,
            "upload prepared"
        );

        Ok(PreparedUpload {
            upload,
            slot,
            start,
            length,
        })
    }

    fn resolve(
        &self,
        request: &UploadRequest,
        user: &UploadUser,
    ) -> Result<ResolvedSource, UploadError> {
        let userlist =
            request.path == USER_LIST_NAME || request.path == USER_LIST_NAME_BZ;

        match request.kind.as_str() {
            "file" if userlist => Ok(ResolvedSource {
                kind: TransferKind::FullList,
                display_path: request.path.clone(),
                real_path: None,
                file_size: 0,
                mini: true,
                partial: false,
            }),
            "file" => match self.tree.resolve_file(&request.path, &user.profiles) {
                Ok(file) => {
                    let config = self.config.read();
                    let name_lower = file.name.lower();
                    let by_ext = config
                        .free_extensions
                        .iter()
                        .any(|e| name_lower.ends_with(&format!(".{e}")));
                    Ok(ResolvedSource {
                        kind: TransferKind::File,
                        display_path: file.real_path().to_string_lossy().to_string(),
                        real_path: Some(file.real_path()),
                        file_size: file.size,
                        mini: by_ext || file.size <= config.minislot_size,
                        partial: false,
                    })
                }
                Err(err) => self.resolve_partial(request, err),
            },
            "tthl" => {
                let tth = parse_tth_path(&request.path)
                    .ok_or(UploadError::FileNotAvailable)?;
                let visible = !self
                    .tree
                    .files_by_tth(&tth, Some(&user.profiles))
                    .is_empty();
                if visible || self.partial_has_tree(&tth) {
                    Ok(ResolvedSource {
                        kind: TransferKind::Tree,
                        display_path: request.path.clone(),
                        real_path: None,
                        file_size: 0,
                        mini: true,
                        partial: !visible,
                    })
                } else {
                    Err(UploadError::FileNotAvailable)
                }
            }
            "list" => Ok(ResolvedSource {
                kind: TransferKind::PartialList,
                display_path: request.path.clone(),
                real_path: None,
                file_size: 0,
                mini: true,
                partial: false,
            }),
            other => Err(UploadError::UnknownType(other.to_string())),
        }
    }

    fn partial_has_tree(&self, tth: &TthValue) -> bool {
        self.partial
            .as_ref()
            .and_then(|p| p.find_partial_file(tth))
            .is_some()
            && self.store.has_tree(tth)
    }

    fn resolve_partial(
        &self,
        request: &UploadRequest,
        share_err: ShareError,
    ) -> Result<ResolvedSource, UploadError> {
        let fallback = || match share_err {
            ShareError::FileAccessDenied(_) => UploadError::FileAccessDenied,
            _ => UploadError::FileNotAvailable,
        };

        let Some(provider) = &self.partial else {
            return Err(fallback());
        };
        let Some(tth) = parse_tth_path(&request.path) else {
            return Err(fallback());
        };
        let Some(source) =
            provider.chunk_downloaded(&tth, request.start.max(0) as u64, request.bytes)
        else {
            return Err(fallback());
        };

        Ok(ResolvedSource {
            kind: TransferKind::File,
            display_path: source.path.to_string_lossy().to_string(),
            real_path: Some(source.path),
            file_size: source.file_size,
            mini: false,
            partial: true,
        })
    }

    fn charge_slot(
        &self,
        request: &UploadRequest,
        user: &UploadUser,
        resolved: &ResolvedSource,
        token: &str,
        now: u64,
    ) -> Result<SlotKind, UploadError> {
        // Connections holding a standard or MCN slot keep it.
        if matches!(request.current_slot, SlotKind::Std | SlotKind::Mcn) {
            return Ok(request.current_slot);
        }

        let auto_slot = self.auto_slot_allowed(now);
        let config = self.config.read().clone();
        let mut state = self.state.write();

        let small_file = resolved.kind == TransferKind::PartialList
            || (resolved.kind != TransferKind::FullList
                && resolved.kind != TransferKind::File)
            || (resolved.kind == TransferKind::File && resolved.file_size <= SMALL_FILE_LIMIT);

        let reserved = state.reserved.contains_key(&user.cid);
        let notified = state.notified.contains_key(&user.cid);
        let free_slot = config.slots.saturating_sub(state.running) > 0
            && ((state.queue.is_empty() && state.notified.is_empty()) || notified);

        let mut slot = SlotKind::None;
        let mut no_slots = false;

        if small_file && state.small_slots <= MAX_SMALL_SLOTS {
            slot = SlotKind::Small;
        } else if user.mcn {
            if Self::mcn_allowed(&state, &config, &user.cid, notified)
                || ((reserved || user.favorite || auto_slot)
                    && !Self::uploading_to(&state, &user.cid))
            {
                slot = SlotKind::Mcn;
            } else {
                no_slots = true;
            }
        } else if reserved || user.favorite || free_slot || auto_slot {
            slot = SlotKind::Std;
        } else {
            no_slots = true;
        }

        if no_slots {
            let allowed_free = request.current_slot == SlotKind::Extra
                || user.op
                || state.extra < config.extra_slots;
            let partial_free = resolved.partial
                && (request.current_slot == SlotKind::Partial
                    || state.extra_partial < config.extra_partial_slots);

            if resolved.mini && user.supports_minislots && allowed_free {
                slot = SlotKind::Extra;
            } else if partial_free {
                slot = SlotKind::Partial;
            } else {
                // MCN peers already uploading are refused without queuing.
                let position = if user.mcn && Self::uploading_to(&state, &user.cid) {
                    None
                } else {
                    Some(Self::queue_user(
                        &mut state,
                        user.cid,
                        token,
                        &resolved.display_path,
                    ))
                };
                return Err(UploadError::SlotsFull {
                    queue_position: position,
                });
            }
        }

        Self::transition_slot(&mut state, &user.cid, request.current_slot, slot);
        state.last_grant = now;
        Ok(slot)
    }

    fn mcn_allowed(state: &State, config: &UploadConfig, user: &Cid, notified: bool) -> bool {
        let logical_free = (config.slots as i64
            - state.running as i64
            - state.mcn_slots as i64
            + state.multi_uploads.len() as i64)
            > 0;
        let has_free_slot =
            logical_free && ((state.queue.is_empty() && state.notified.is_empty()) || notified);

        let per_user_ok = |count: u16| {
            config.slots_per_user == 0 || u32::from(count) + 1 <= config.slots_per_user
        };

        if !state.multi_uploads.is_empty() {
            let highest_other = state
                .multi_uploads
                .iter()
                .filter(|(u, _)| *u != user)
                .map(|(_, c)| *c)
                .max()
                .unwrap_or(0);
            if let Some(count) = state.multi_uploads.get(user) {
                return (highest_other > count + 1 || has_free_slot) && per_user_ok(*count);
            }
        }

        config.slots.saturating_sub(state.running) > 0
            && ((state.queue.is_empty() && state.notified.is_empty()) || notified)
    }

    fn uploading_to(state: &State, user: &Cid) -> bool {
        state.uploads.iter().any(|u| u.user == *user)
    }

    fn queue_user(state: &mut State, user: Cid, token: &str, file: &str) -> usize {
        if let Some(existing) = state.queue.iter_mut().find(|w| w.user == user) {
            if !existing.files.iter().any(|f| f == file) {
                existing.files.push(file.to_string());
            }
            existing.token = token.to_string();
        } else {
            state.queue.push(WaitingUser {
                user,
                token: token.to_string(),
                files: vec![file.to_string()],
            });
        }
        state
            .queue
            .iter()
            .position(|w| w.user == user)
            .map_or(1, |i| i + 1)
    }

    fn transition_slot(state: &mut State, user: &Cid, old: SlotKind, new: SlotKind) {
        if old == new {
            return;
        }
        match old {
            SlotKind::Std => state.running = state.running.saturating_sub(1),
            SlotKind::Extra => state.extra = state.extra.saturating_sub(1),
            SlotKind::Partial => state.extra_partial = state.extra_partial.saturating_sub(1),
            SlotKind::Small => state.small_slots = state.small_slots.saturating_sub(1),
            SlotKind::Mcn => Self::mcn_release(state, user),
            SlotKind::None => {}
        }
        match new {
            SlotKind::Std => state.running += 1,
            SlotKind::Extra => state.extra += 1,
            SlotKind::Partial => state.extra_partial += 1,
            SlotKind::Small => state.small_slots += 1,
            SlotKind::Mcn => {
                let entry = state.multi_uploads.entry(*user).or_insert(0);
                if *entry == 0 {
                    state.running += 1;
                }
                *entry += 1;
                state.mcn_slots += 1;
            }
            SlotKind::None => {}
        }
    }

    fn mcn_release(state: &mut State, user: &Cid) {
        if let Some(count) = state.multi_uploads.get_mut(user) {
            *count = count.saturating_sub(1);
            state.mcn_slots = state.mcn_slots.saturating_sub(1);
            if *count == 0 {
                state.multi_uploads.remove(user);
                state.running = state.running.saturating_sub(1);
            }
        }
    }

    fn take_delayed_stream(
        &self,
        user: &UploadUser,
        resolved: &ResolvedSource,
    ) -> Option<UploadStream> {
        if resolved.kind != TransferKind::File {
            return None;
        }
        let mut state = self.state.write();
        let index = state.delay_pool.iter().position(|u| {
            u.user == user.cid && u.kind == TransferKind::File && u.path == resolved.display_path
        })?;
        let upload = state.delay_pool.remove(index);
        upload.take_stream()
    }

    fn open_stream(
        &self,
        request: &UploadRequest,
        resolved: &ResolvedSource,
        resumed: Option<UploadStream>,
    ) -> Result<(UploadStream, u64, u64), UploadError> {
        match resolved.kind {
            TransferKind::File => {
                let start = request.start.max(0) as u64;
                let length = if request.bytes == -1 {
                    resolved.file_size.saturating_sub(start)
                } else {
                    request.bytes as u64
                };
                if start + length > resolved.file_size {
                    return Err(UploadError::RangeBeyondEnd);
                }
                let path = resolved
                    .real_path
                    .as_ref()
                    .ok_or(UploadError::FileNotAvailable)?;
                let stream = match resumed {
                    Some(mut s) => {
                        s.reposition(start, length)?;
                        s
                    }
                    None => UploadStream::open_file(path, start, length)?,
                };
                Ok((stream, start, length))
            }
            TransferKind::FullList => {
                let list = generate_full_list(
                    &self.tree,
                    // FullList resolution happens against the hub profile.
                    0,
                    &self.my_cid,
                );
                let data = if request.path == USER_LIST_NAME_BZ {
                    list.bz2
                } else {
                    list.xml
                };
                let length = data.len() as u64;
                Ok((UploadStream::memory(data), 0, length))
            }
            TransferKind::PartialList => {
                let data = if request.tth_list {
                    generate_tth_list(&self.tree, &request.path, request.recursive, 0)
                } else {
                    generate_partial_list(
                        &self.tree,
                        &request.path,
                        request.recursive,
                        0,
                        &self.my_cid,
                    )
                }
                .map_err(|_| UploadError::FileNotAvailable)?;
                let length = data.len() as u64;
                Ok((UploadStream::memory(data), 0, length))
            }
            TransferKind::Tree => {
                let tth =
                    parse_tth_path(&request.path).ok_or(UploadError::FileNotAvailable)?;
                let tree = self
                    .store
                    .get_tree(&tth)
                    .ok_or(UploadError::FileNotAvailable)?;
                let data = tree.leaf_data();
                let length = data.len() as u64;
                Ok((UploadStream::memory(data), 0, length))
            }
        }
    }

    /// A transfer finished. Chunked file uploads move to the delay pool;
    /// everything else is dropped immediately.
    pub fn transmit_done(&self, upload: &Arc<Upload>) {
        let mut state = self.state.write();
        state.uploads.retain(|u| u.id != upload.id);
        if upload.chunked && upload.kind == TransferKind::File {
            upload.reset_delay();
            state.delay_pool.push(Arc::clone(upload));
        }
    }

    /// The connection died. Frees its slot and drops its uploads.
    pub fn connection_closed(&self, user: &Cid, slot: SlotKind, upload: Option<&Arc<Upload>>) {
        let mut state = self.state.write();
        if let Some(upload) = upload {
            state.uploads.retain(|u| u.id != upload.id);
            state.delay_pool.retain(|u| u.id != upload.id);
        }
        Self::transition_slot(&mut state, user, slot, SlotKind::None);
    }

    /// Once-per-second housekeeping: expire delay-pool entries and pick
    /// users to notify about free slots. Returns `(user, token)` pairs the
    /// hub layer should dial.
    pub fn second_tick(&self, now: u64) -> Vec<(Cid, String)> {
        let mut state = self.state.write();

        state.delay_pool.retain(|u| {
            if u.tick_delay() > DELAY_POOL_SECS {
                tracing::debug!(path = %u.path, "delay pool entry expired");
                false
            } else {
                true
            }
        });

        // Free-slot notifications.
        let config = self.config.read();
        let mut notify = Vec::new();
        if !state.queue.is_empty() {
            let mut free = config.slots.saturating_sub(state.running) as i64
                - state.notified.len() as i64;
            while free > 0 && !state.queue.is_empty() {
                let waiting = state.queue.remove(0);
                state
                    .notified
                    .insert(waiting.user, (now, waiting.token.clone()));
                notify.push((waiting.user, waiting.token));
                free -= 1;
            }
        }
        notify
    }

    /// Once-per-minute housekeeping: expire reservations and notified
    /// tokens, and reconcile the MCN counters against live uploads.
    /// Returns users whose reservation lapsed.
    pub fn minute_tick(&self, now: u64) -> Vec<Cid> {
        let mut state = self.state.write();

        let mut lapsed = Vec::new();
        state.reserved.retain(|user, expires| {
            if *expires > 0 && *expires < now {
                lapsed.push(*user);
                false
            } else {
                true
            }
        });

        state
            .notified
            .retain(|_, (at, _)| *at + NOTIFY_TIMEOUT_SECS >= now);

        // The per-user counters drift when sockets of one user close in a
        // burst; rebuild them from the live upload set.
        let mut rebuilt: HashMap<Cid, u16> = HashMap::new();
        for upload in &state.uploads {
            if state.multi_uploads.contains_key(&upload.user) {
                *rebuilt.entry(upload.user).or_insert(0) += 1;
            }
        }
        let stale: Vec<Cid> = state
            .multi_uploads
            .keys()
            .filter(|u| !rebuilt.contains_key(*u))
            .copied()
            .collect();
        for user in stale {
            state.multi_uploads.remove(&user);
            state.running = state.running.saturating_sub(1);
        }
        let total: u32 = rebuilt.values().map(|c| u32::from(*c)).sum();
        for (user, count) in rebuilt {
            state.multi_uploads.insert(user, count);
        }
        state.mcn_slots = total;

        lapsed
    }

    /// Disconnect every running or delayed upload of `path`. Returns the
    /// affected upload ids; with `wait_disconnected` the call blocks up to
    /// five seconds for them to drain.
    pub fn abort_upload(&self, path: &str, wait_disconnected: bool) -> Vec<u64> {
        let ids: Vec<u64> = {
            let state = self.state.read();
            state
                .uploads
                .iter()
                .chain(state.delay_pool.iter())
                .filter(|u| u.path == path)
                .map(|u| u.id)
                .collect()
        };
        if ids.is_empty() || !wait_disconnected {
            // Delay-pool entries can be dropped synchronously.
            let mut state = self.state.write();
            state.delay_pool.retain(|u| u.path != path);
            return ids;
        }

        for _ in 0..20 {
            {
                let mut state = self.state.write();
                state.delay_pool.retain(|u| u.path != path);
                if !state.uploads.iter().any(|u| u.path == path) {
                    return ids;
                }
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        tracing::error!(path, "upload still alive after abort wait");
        ids
    }

    /// Snapshot of the waiting queue: `(user, queued files)`.
    #[must_use]
    pub fn waiting_users(&self) -> Vec<(Cid, Vec<String>)> {
        self.state
            .read()
            .queue
            .iter()
            .map(|w| (w.user, w.files.clone()))
            .collect()
    }

    /// Drop a user's queued files (user went offline).
    pub fn clear_user_files(&self, user: &Cid) {
        let mut state = self.state.write();
        state.queue.retain(|w| w.user != *user);
        state.notified.remove(user);
    }
}

struct ResolvedSource {
    kind: TransferKind,
    display_path: String,
    real_path: Option<PathBuf>,
    file_size: u64,
    mini: bool,
    partial: bool,
}

fn parse_tth_path(path: &str) -> Option<TthValue> {
    path.strip_prefix("TTH/")
        .and_then(|b32| TthValue::from_str(b32).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_share::dual_string::DualString;
    use adcx_share::hash_store::{FileIdentity, MemoryHashStore};
    use adcx_share::profile::ShareRoot;
    use adcx_share::tree::Directory;
    use adcx_proto::{AdcStatus, Pid};
    use std::io::Read;

    struct Fixture {
        scheduler: UploadScheduler,
        tth: TthValue,
        real_path: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn cid(seed: u8) -> Cid {
        Pid::from_bytes([seed; 24]).derive_cid()
    }

    fn user(seed: u8) -> UploadUser {
        UploadUser {
            cid: cid(seed),
            profile: 0,
            profiles: [0].into_iter().collect(),
            favorite: false,
            op: false,
            mcn: false,
            supports_minislots: false,
        }
    }

    fn file_request(path: &str, start: i64, bytes: i64) -> UploadRequest {
        UploadRequest {
            kind: "file".into(),
            path: path.into(),
            start,
            bytes,
            recursive: false,
            tth_list: false,
            current_slot: SlotKind::None,
        }
    }

    fn fixture(file_len: usize, config: UploadConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let data = vec![0x42u8; file_len];
        let real_path = tmp.path().join("payload.bin");
        std::fs::write(&real_path, &data).unwrap();

        let hashed = adcx_proto::tth::hash_buffer(&data);
        let store = Arc::new(MemoryHashStore::new());
        store.add_file(
            &real_path.to_string_lossy().to_lowercase(),
            FileIdentity { size: file_len as u64, mtime: 1 },
            hashed.clone(),
        );

        let tree = Arc::new(ShareTree::new());
        let root = Arc::new(ShareRoot::new(
            tmp.path().to_path_buf(),
            "Share",
            [0].into_iter().collect(),
            false,
        ));
        let dir = Directory::new_root(root, 1);
        let _ = Directory::add_file(
            &dir,
            DualString::new("payload.bin"),
            file_len as u64,
            1,
            hashed.root,
        );
        tree.replace_root_subtree(dir).unwrap();

        let scheduler = UploadScheduler::new(
            tree,
            store,
            None,
            config,
            cid(0xEE),
        );
        Fixture {
            scheduler,
            tth: hashed.root,
            real_path,
            _tmp: tmp,
        }
    }

    #[test]
    fn serves_whole_file_by_tth_path() {
        let fx = fixture(1234, UploadConfig::default());
        let request = file_request(&format!("TTH/{}", fx.tth.to_base32()), 0, -1);

        // TTH/ paths resolve through the share only via the virtual name;
        // the tree request path goes through the index.
        let request = UploadRequest {
            path: "/Share/payload.bin".into(),
            ..request
        };
        let prepared = fx
            .scheduler
            .prepare_upload(&request, &user(1), "tok", 100)
            .unwrap();
        assert_eq!(prepared.start, 0);
        assert_eq!(prepared.length, 1234);
        assert_eq!(prepared.slot, SlotKind::Small);

        let mut stream = prepared.upload.take_stream().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 1234);
    }

    #[test]
    fn rejects_bad_ranges() {
        let fx = fixture(100, UploadConfig::default());
        let cases = [
            file_request("/Share/payload.bin", -1, -1),
            file_request("/Share/payload.bin", 0, 0),
            file_request("/Share/payload.bin", 0, -2),
            file_request("", 0, -1),
        ];
        for request in cases {
            assert!(matches!(
                fx.scheduler.prepare_upload(&request, &user(1), "t", 0),
                Err(UploadError::InvalidRequest(_))
            ));
        }

        let beyond = file_request("/Share/payload.bin", 50, 100);
        assert!(matches!(
            fx.scheduler.prepare_upload(&beyond, &user(1), "t", 0),
            Err(UploadError::RangeBeyondEnd)
        ));
    }

    #[test]
    fn missing_file_not_available() {
        let fx = fixture(100, UploadConfig::default());
        let request = file_request("/Share/other.bin", 0, -1);
        assert!(matches!(
            fx.scheduler.prepare_upload(&request, &user(1), "t", 0),
            Err(UploadError::FileNotAvailable)
        ));
    }

    #[test]
    fn std_slots_run_out_and_queue() {
        // Large file so the small-slot path does not trigger.
        let config = UploadConfig {
            slots: 1,
            extra_slots: 0,
            extra_partial_slots: 0,
            minislot_size: 1024,
            free_extensions: vec![],
            ..UploadConfig::default()
        };
        let fx = fixture(200_000, config);

        let request = file_request("/Share/payload.bin", 0, -1);
        let first = fx
            .scheduler
            .prepare_upload(&request, &user(1), "t1", 0)
            .unwrap();
        assert_eq!(first.slot, SlotKind::Std);
        assert_eq!(fx.scheduler.free_slots(), 0);

        // Second user is queued.
        let err = fx
            .scheduler
            .prepare_upload(&request, &user(2), "t2", 0)
            .unwrap_err();
        match err {
            UploadError::SlotsFull { queue_position } => {
                assert_eq!(queue_position, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.status_code(), AdcStatus::SLOTS_FULL);
        assert_eq!(fx.scheduler.waiting_users().len(), 1);

        // Slot freed: the queued user is notified on the next tick.
        fx.scheduler.transmit_done(&first.upload);
        fx.scheduler
            .connection_closed(&cid(1), SlotKind::Std, None);
        let notify = fx.scheduler.second_tick(10);
        assert_eq!(notify.len(), 1);
        assert_eq!(notify[0].0, cid(2));
        assert_eq!(notify[0].1, "t2");

        // Notified user passes the free-slot check now.
        let granted = fx
            .scheduler
            .prepare_upload(&request, &user(2), "t2", 20)
            .unwrap();
        assert_eq!(granted.slot, SlotKind::Std);
    }

    #[test]
    fn favorite_bypasses_full_slots() {
        let config = UploadConfig {
            slots: 0,
            extra_slots: 0,
            minislot_size: 1,
            free_extensions: vec![],
            ..UploadConfig::default()
        };
        let fx = fixture(200_000, config);
        let request = file_request("/Share/payload.bin", 0, -1);

        let mut favorite = user(3);
        favorite.favorite = true;
        let granted = fx
            .scheduler
            .prepare_upload(&request, &favorite, "t", 0)
            .unwrap();
        assert_eq!(granted.slot, SlotKind::Std);
    }

    #[test]
    fn reserved_slot_grants() {
        let config = UploadConfig {
            slots: 0,
            extra_slots: 0,
            minislot_size: 1,
            free_extensions: vec![],
            ..UploadConfig::default()
        };
        let fx = fixture(200_000, config);
        let request = file_request("/Share/payload.bin", 0, -1);

        fx.scheduler.reserve_slot(cid(4), 1000);
        let granted = fx
            .scheduler
            .prepare_upload(&request, &user(4), "t", 0)
            .unwrap();
        assert_eq!(granted.slot, SlotKind::Std);

        // Reservation expires on the minute tick.
        let lapsed = fx.scheduler.minute_tick(2000);
        assert_eq!(lapsed, vec![cid(4)]);
        assert!(!fx.scheduler.has_reserved_slot(&cid(4)));
    }

    #[test]
    fn minislot_extension_grants_extra() {
        let config = UploadConfig {
            slots: 0,
            extra_slots: 1,
            minislot_size: 1,
            free_extensions: vec!["bin".into()],
            ..UploadConfig::default()
        };
        let fx = fixture(200_000, config);
        let request = file_request("/Share/payload.bin", 0, -1);

        let mut peer = user(5);
        peer.supports_minislots = true;
        let granted = fx
            .scheduler
            .prepare_upload(&request, &peer, "t", 0)
            .unwrap();
        assert_eq!(granted.slot, SlotKind::Extra);

        // Extras exhausted: the next peer queues.
        let mut peer2 = user(6);
        peer2.supports_minislots = true;
        assert!(matches!(
            fx.scheduler.prepare_upload(&request, &peer2, "t", 0),
            Err(UploadError::SlotsFull { .. })
        ));
    }

    #[test]
    fn mcn_peer_opens_extra_connections_up_to_cap() {
        let config = UploadConfig {
            slots: 2,
            minislot_size: 1,
            free_extensions: vec![],
            slots_per_user: 2,
            ..UploadConfig::default()
        };
        let fx = fixture(200_000, config);
        let request = file_request("/Share/payload.bin", 0, -1);

        let mut peer = user(7);
        peer.mcn = true;
        let first = fx
            .scheduler
            .prepare_upload(&request, &peer, "t", 0)
            .unwrap();
        assert_eq!(first.slot, SlotKind::Mcn);

        let second = fx
            .scheduler
            .prepare_upload(&request, &peer, "t", 0)
            .unwrap();
        assert_eq!(second.slot, SlotKind::Mcn);

        // Per-user cap of two reached, and the peer is already uploading,
        // so the request is refused without queueing.
        let err = fx
            .scheduler
            .prepare_upload(&request, &peer, "t", 0)
            .unwrap_err();
        match err {
            UploadError::SlotsFull { queue_position } => assert!(queue_position.is_none()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn tthl_served_from_hash_store() {
        let fx = fixture(5000, UploadConfig::default());
        let request = UploadRequest {
            kind: "tthl".into(),
            path: format!("TTH/{}", fx.tth.to_base32()),
            start: 0,
            bytes: -1,
            recursive: false,
            tth_list: false,
            current_slot: SlotKind::None,
        };
        let prepared = fx
            .scheduler
            .prepare_upload(&request, &user(8), "t", 0)
            .unwrap();
        assert_eq!(prepared.slot, SlotKind::Small);
        // 5000 bytes at 1 KiB leaf granularity: five leaves of 24 bytes.
        assert_eq!(prepared.length, 5 * 24);
    }

    #[test]
    fn delay_pool_resume_reuses_stream() {
        let fx = fixture(200_000, UploadConfig { minislot_size: 1, free_extensions: vec![], ..UploadConfig::default() });

        // First chunk.
        let request = file_request("/Share/payload.bin", 0, 100_000);
        let peer = user(9);
        let first = fx
            .scheduler
            .prepare_upload(&request, &peer, "t", 0)
            .unwrap();
        assert!(first.upload.chunked);
        let stream = first.upload.take_stream().unwrap();
        first.upload.store_stream(stream);
        fx.scheduler.transmit_done(&first.upload);

        // Resume of the rest reuses the pooled stream.
        let resume = file_request("/Share/payload.bin", 100_000, -1);
        let second = fx
            .scheduler
            .prepare_upload(&resume, &peer, "t", 1)
            .unwrap();
        assert!(second.upload.resumed);
        assert_eq!(second.start, 100_000);
        assert_eq!(second.length, 100_000);
    }

    #[test]
    fn delay_pool_expires_after_ten_ticks() {
        let fx = fixture(200_000, UploadConfig { minislot_size: 1, free_extensions: vec![], ..UploadConfig::default() });
        let request = file_request("/Share/payload.bin", 0, 100_000);
        let prepared = fx
            .scheduler
            .prepare_upload(&request, &user(10), "t", 0)
            .unwrap();
        let stream = prepared.upload.take_stream().unwrap();
        prepared.upload.store_stream(stream);
        fx.scheduler.transmit_done(&prepared.upload);

        for tick in 0..=DELAY_POOL_SECS {
            fx.scheduler.second_tick(tick);
        }
        // Stream is gone now; a new request opens a fresh one.
        let resume = file_request("/Share/payload.bin", 100_000, -1);
        let second = fx
            .scheduler
            .prepare_upload(&resume, &user(10), "t", 20)
            .unwrap();
        assert!(!second.upload.resumed);
    }

    #[test]
    fn abort_upload_clears_delay_pool() {
        let fx = fixture(200_000, UploadConfig { minislot_size: 1, free_extensions: vec![], ..UploadConfig::default() });
        let request = file_request("/Share/payload.bin", 0, 100_000);
        let prepared = fx
            .scheduler
            .prepare_upload(&request, &user(11), "t", 0)
            .unwrap();
        let path = prepared.upload.path.clone();
        fx.scheduler.transmit_done(&prepared.upload);

        let ids = fx.scheduler.abort_upload(&path, false);
        assert_eq!(ids, vec![prepared.upload.id]);
        assert_eq!(fx.real_path.to_string_lossy(), path);
    }

    #[test]
    fn full_list_request_serves_xml() {
        let fx = fixture(100, UploadConfig::default());
        let request = UploadRequest {
            kind: "file".into(),
            path: USER_LIST_NAME.into(),
            start: 0,
            bytes: -1,
            recursive: false,
            tth_list: false,
            current_slot: SlotKind::None,
        };
        let prepared = fx
            .scheduler
            .prepare_upload(&request, &user(12), "t", 0)
            .unwrap();
        let mut stream = prepared.upload.take_stream().unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<FileListing"));
        assert!(text.contains("payload.bin"));
    }
}

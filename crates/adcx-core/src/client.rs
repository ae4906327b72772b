//! The per-hub ADC session.
//!
//! One [`HubClient`] drives one hub URL through the login state machine
//! (`PROTOCOL` → `IDENTIFY` → `VERIFY` → `NORMAL`), owns the SID → user
//! table, negotiates user connections (`CTM`/`RCM`/`NAT`/`RNT`), runs the
//! secondary-protocol validation worker, diffs its own `INF`, schedules
//! outgoing searches and reconnects after failures.

use crate::core::CoreContext;
use crate::error::CoreError;
use crate::events::{ChatMessage, ClientEvent, ConnectRequest, Severity, UserCommand};
use crate::hbri::{spawn_hbri, HbriRequest, HbriWorker};
use crate::search_queue::{construct_search, Search, SearchQueue};
use crate::user::{ConnectMode, Identity, OnlineUser, UserFlags};
use adcx_proto::command::FourCc;
use adcx_proto::features::{su, sup, CLIENT_PROTOCOL, SECURE_CLIENT_PROTOCOL};
use adcx_proto::{AdcCommand, AdcStatus, Cid, Code, CommandType, Severity as StatusSeverity, Sid};
use adcx_share::profile::ProfileToken;
use adcx_transport::{connect, BufferedConnection, ConnectOptions, TransportEvent};
use password::password_response;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Milliseconds of outbound silence before a keep-alive newline.
const KEEPALIVE_MS: u64 = 120_000;

/// Base reconnect delay in seconds.
const RECONNECT_DELAY_SECS: u64 = 120;

mod password {
    //! Password response assembly (`PAS`).

    use adcx_proto::Cid;
    use data_encoding::BASE32_NOPAD;
    use digest::Digest;
    use tiger::Tiger;

    /// `Tiger([CID ++] password ++ salt)` in base32, per the `GPA`
    /// exchange. The CID prefix is the compatibility form used when the
    /// hub negotiated the base protocol without tiger support.
    #[must_use]
    pub fn password_response(password: &str, salt_b32: &str, old_form: Option<&Cid>) -> String {
        let salt = BASE32_NOPAD
            .decode(salt_b32.as_bytes())
            .unwrap_or_default();
        let mut hasher = Tiger::new();
        if let Some(cid) = old_form {
            hasher.update(cid.as_bytes());
        }
        hasher.update(password.as_bytes());
        hasher.update(&salt);
        BASE32_NOPAD.encode(&hasher.finalize())
    }
}

/// Login progression of a hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    /// No socket
    #[default]
    Disconnected,
    /// Socket opening
    Connecting,
    /// `SUP` exchange
    Protocol,
    /// Waiting for our `SID` / sending `INF`
    Identify,
    /// Password round
    Verify,
    /// Logged in
    Normal,
}

/// Per-hub configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Nick to log in with.
    pub nick: String,
    /// Description field.
    pub description: String,
    /// Email field.
    pub email: String,
    /// Stored password; empty asks the UI via an event.
    pub password: String,
    /// Share profile served to this hub.
    pub share_profile: ProfileToken,
    /// Reconnect automatically after failures.
    pub auto_reconnect: bool,
    /// Accept untrusted hub certificates.
    pub allow_untrusted: bool,
    /// Require TLS for user connections.
    pub tls_forced: bool,
    /// Externally visible IPv4 address; empty for hub-discovered.
    pub user_ip4: String,
    /// Externally visible IPv6 address; empty for hub-discovered.
    pub user_ip6: String,
    /// UDP search port.
    pub udp_port: u16,
    /// TCP listen port for plain user connections.
    pub tcp_port: u16,
    /// TCP listen port for TLS user connections.
    pub tls_port: u16,
    /// IPv4 connectivity is active (listening reachable).
    pub active_v4: bool,
    /// IPv6 connectivity is active.
    pub active_v6: bool,
    /// Advertised download speed, bytes/s.
    pub download_speed: u64,
    /// Advertised upload speed, bytes/s.
    pub upload_speed: u64,
    /// Our TLS certificate keyprint (`KP` field), empty when plain.
    pub keyprint: String,
    /// Minimum milliseconds between outgoing searches on this hub.
    pub min_search_interval_ms: u64,
    /// Application version string (`VE`).
    pub version: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            nick: "adcx".into(),
            description: String::new(),
            email: String::new(),
            password: String::new(),
            share_profile: 0,
            auto_reconnect: true,
            allow_untrusted: false,
            tls_forced: false,
            user_ip4: String::new(),
            user_ip6: String::new(),
            udp_port: 0,
            tcp_port: 0,
            tls_port: 0,
            active_v4: false,
            active_v6: false,
            download_speed: 0,
            upload_speed: 0,
            keyprint: String::new(),
            min_search_interval_ms: 5000,
            version: concat!("adcx ", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// One hub session.
pub struct HubClient {
    url: String,
    address: String,
    port: u16,
    secure: bool,
    token: u32,

    ctx: Arc<CoreContext>,
    settings: RwLock<HubSettings>,
    events: mpsc::UnboundedSender<ClientEvent>,

    state: RwLock<ConnectState>,
    sid: RwLock<Sid>,
    users: RwLock<HashMap<Sid, Arc<OnlineUser>>>,
    my_identity: RwLock<Identity>,
    hub_identity: RwLock<Identity>,
    available_bytes: AtomicI64,

    conn: Mutex<Option<BufferedConnection>>,
    last_info: Mutex<HashMap<String, String>>,
    forbidden: Mutex<HashSet<FourCc>>,
    salt: Mutex<Option<String>>,
    old_password: AtomicBool,
    supports_hbri: AtomicBool,
    registered: AtomicBool,

    search_queue: Mutex<SearchQueue>,
    hbri: Mutex<Option<HbriWorker>>,

    auto_reconnect: AtomicBool,
    reconnect_delay: AtomicU64,
    shutting_down: AtomicBool,
    last_outbound: AtomicU64,
    local_port: AtomicU64,
    local_is_v6: AtomicBool,

    sent_log: Mutex<VecDeque<String>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Split `adc://host:port` / `adcs://host:port` into parts.
fn parse_url(url: &str) -> (String, u16, bool) {
    let (secure, rest) = match url.strip_prefix("adcs://") {
        Some(rest) => (true, rest),
        None => (false, url.strip_prefix("adc://").unwrap_or(url)),
    };
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(411), secure),
        None => (rest.to_string(), 411, secure),
    }
}

impl HubClient {
    /// Create a session (not yet connected) and register it.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        settings: HubSettings,
        ctx: Arc<CoreContext>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Arc<Self> {
        let url = url.into();
        let (address, port, secure) = parse_url(&url);
        let token = ctx.registry.allocate_token();
        let auto_reconnect = settings.auto_reconnect;
        let client = Arc::new(HubClient {
            url,
            address,
            port,
            secure,
            token,
            ctx,
            settings: RwLock::new(settings),
            events,
            state: RwLock::new(ConnectState::Disconnected),
            sid: RwLock::new(Sid::HUB),
            users: RwLock::new(HashMap::new()),
            my_identity: RwLock::new(Identity::new(Sid::HUB)),
            hub_identity: RwLock::new(Identity::new(Sid::HUB)),
            available_bytes: AtomicI64::new(0),
            conn: Mutex::new(None),
            last_info: Mutex::new(HashMap::new()),
            forbidden: Mutex::new(HashSet::new()),
            salt: Mutex::new(None),
            old_password: AtomicBool::new(false),
            supports_hbri: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            search_queue: Mutex::new(SearchQueue::new(5000)),
            hbri: Mutex::new(None),
            auto_reconnect: AtomicBool::new(auto_reconnect),
            reconnect_delay: AtomicU64::new(RECONNECT_DELAY_SECS),
            shutting_down: AtomicBool::new(false),
            last_outbound: AtomicU64::new(0),
            local_port: AtomicU64::new(0),
            local_is_v6: AtomicBool::new(false),
            sent_log: Mutex::new(VecDeque::new()),
        });
        client
            .search_queue
            .lock()
            .set_min_interval(client.settings.read().min_search_interval_ms);
        client.ctx.registry.register(Arc::clone(&client));
        client
    }

    /// Hub URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session token (numeric prefix of search tokens).
    #[must_use]
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Snapshot of the per-hub settings.
    #[must_use]
    pub fn settings(&self) -> HubSettings {
        self.settings.read().clone()
    }

    /// Current login state.
    #[must_use]
    pub fn state(&self) -> ConnectState {
        *self.state.read()
    }

    /// Logged in?
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectState::Normal
    }

    /// Counted in the `HN`/`HR`/`HO` hub totals (past the SUP exchange)?
    #[must_use]
    pub fn is_counted(&self) -> bool {
        matches!(
            self.state(),
            ConnectState::Identify | ConnectState::Verify | ConnectState::Normal
        )
    }

    /// Did this session authenticate with a password?
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Our SID on this hub.
    #[must_use]
    pub fn sid(&self) -> Sid {
        *self.sid.read()
    }

    /// Our identity as the hub last confirmed it.
    #[must_use]
    pub fn my_identity(&self) -> Identity {
        self.my_identity.read().clone()
    }

    /// The hub's own identity.
    #[must_use]
    pub fn hub_identity(&self) -> Identity {
        self.hub_identity.read().clone()
    }

    /// Total bytes shared by hub users, as reported in their `INF`s.
    #[must_use]
    pub fn available_bytes(&self) -> i64 {
        self.available_bytes.load(Ordering::Relaxed)
    }

    /// Visible user count.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users
            .read()
            .values()
            .filter(|u| !u.identity().is_hidden())
            .count()
    }

    /// All hub bindings, optionally including hidden users.
    #[must_use]
    pub fn user_list(&self, include_hidden: bool) -> Vec<Arc<OnlineUser>> {
        self.users
            .read()
            .values()
            .filter(|u| include_hidden || !u.identity().is_hidden())
            .cloned()
            .collect()
    }

    /// User by SID.
    #[must_use]
    pub fn find_user(&self, sid: Sid) -> Option<Arc<OnlineUser>> {
        self.users.read().get(&sid).cloned()
    }

    /// User by CID.
    #[must_use]
    pub fn find_user_by_cid(&self, cid: &Cid) -> Option<Arc<OnlineUser>> {
        self.users
            .read()
            .values()
            .find(|u| u.user.cid == *cid)
            .cloned()
    }

    /// User by nick.
    #[must_use]
    pub fn find_user_by_nick(&self, nick: &str) -> Option<Arc<OnlineUser>> {
        self.users
            .read()
            .values()
            .find(|u| u.identity().nick() == nick)
            .cloned()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn status_message(&self, severity: Severity, text: impl Into<String>) {
        self.emit(ClientEvent::StatusMessage {
            severity,
            text: text.into(),
            is_spam: false,
        });
    }

    fn spam_message(&self, text: impl Into<String>) {
        self.emit(ClientEvent::StatusMessage {
            severity: Severity::Info,
            text: text.into(),
            is_spam: true,
        });
    }

    fn set_state(&self, state: ConnectState) {
        *self.state.write() = state;
    }

    /// Open the hub connection and run the session until it fails or is
    /// shut down.
    pub fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.session().await });
    }

    async fn session(self: Arc<Self>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        self.set_state(ConnectState::Connecting);
        self.emit(ClientEvent::Connecting);

        let settings = self.settings();
        let (conn, mut events) = connect(
            self.address.clone(),
            self.port,
            ConnectOptions {
                tls: self.secure,
                allow_untrusted: settings.allow_untrusted || !self.secure,
                keyprint: None,
                timeout: Duration::from_secs(30),
                watch_zlib: true,
            },
        );
        *self.conn.lock() = Some(conn);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connecting => {}
                TransportEvent::Connected { local, .. } => {
                    self.local_port
                        .store(u64::from(local.port()), Ordering::Relaxed);
                    self.local_is_v6
                        .store(local.is_ipv6(), Ordering::Relaxed);
                    self.on_connected();
                }
                TransportEvent::Line(line) => self.handle_line(&line),
                TransportEvent::Data(_) => {}
                TransportEvent::Failed(reason) => {
                    self.on_failed(&reason).await;
                    return;
                }
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Tear the session down for good (no reconnect).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(worker) = self.hbri.lock().take() {
            worker.cancel_and_join().await;
        }
        if let Some(conn) = self.conn.lock().take() {
            conn.disconnect(true);
        }
        self.clear_users();
        self.set_state(ConnectState::Disconnected);
    }

    fn on_connected(&self) {
        self.set_state(ConnectState::Protocol);
        self.last_info.lock().clear();
        *self.sid.write() = Sid::HUB;
        self.forbidden.lock().clear();

        let cmd = AdcCommand::hub(Code::SUP)
            .add_param(sup::BAS0)
            .add_param(sup::BASE)
            .add_param(sup::TIGR)
            .add_param(sup::UCM0)
            .add_param(sup::BLO0)
            .add_param(sup::ZLIF)
            .add_param(sup::HBRI);
        let _ = self.send(cmd);
    }

    async fn on_failed(&self, reason: &str) {
        tracing::info!(url = %self.url, reason, "hub connection lost");
        *self.conn.lock() = None;
        self.clear_users();
        self.set_state(ConnectState::Disconnected);
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });

        if self.auto_reconnect.load(Ordering::Acquire) && !self.shutting_down.load(Ordering::Acquire)
        {
            let delay = self.reconnect_delay.load(Ordering::Relaxed)
                + u64::from(rand::thread_rng().gen_range(0..60u32));
            self.status_message(
                Severity::Info,
                format!("Reconnecting in {delay} seconds"),
            );
            if let Some(client) = self.ctx.registry.by_url(&self.url) {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    client.start();
                });
            }
        }
    }

    /// Send a command on the hub socket, respecting forbidden classes.
    ///
    /// # Errors
    ///
    /// [`CoreError::CommandForbidden`] when the hub denied the class,
    /// [`CoreError::NotConnected`] without a socket.
    pub fn send(&self, cmd: AdcCommand) -> Result<(), CoreError> {
        if self.forbidden.lock().contains(&cmd.four_cc()) {
            return Err(CoreError::CommandForbidden);
        }
        let line = cmd.to_line(self.sid());
        self.send_line(line)
    }

    fn send_line(&self, line: String) -> Result<(), CoreError> {
        {
            let mut log = self.sent_log.lock();
            log.push_back(line.clone());
            if log.len() > 128 {
                log.pop_front();
            }
        }
        self.last_outbound.store(now_ms(), Ordering::Relaxed);
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(CoreError::NotConnected)?;
        conn.write_line(line)?;
        Ok(())
    }

    /// Outgoing wire log (most recent last, capped).
    #[must_use]
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent_log.lock().iter().cloned().collect()
    }

    /// Feed one inbound line through the dispatcher.
    pub fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let cmd = match AdcCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::debug!(url = %self.url, %err, "undecodable line");
                return;
            }
        };
        self.dispatch(cmd);
    }

    fn dispatch(&self, c: AdcCommand) {
        match c.code() {
            Code::SUP => self.on_sup(&c),
            Code::SID => self.on_sid(&c),
            Code::INF => self.on_inf(&c),
            Code::MSG => self.on_msg(&c),
            Code::GPA => self.on_gpa(&c),
            Code::QUI => self.on_qui(&c),
            Code::CTM => self.on_ctm(&c),
            Code::RCM => self.on_rcm(&c),
            Code::NAT => self.on_nat(&c),
            Code::RNT => self.on_rnt(&c),
            Code::SCH => self.on_sch(&c),
            Code::RES => self.on_res(&c),
            Code::PSR => self.on_psr(&c),
            Code::STA => self.on_sta(&c),
            Code::TCP => self.on_tcp(&c),
            Code::ZON => self.on_zon(&c),
            Code::ZOF => self.on_zof(&c),
            Code::GET => self.on_get(&c),
            Code::CMD => self.on_cmd(&c),
            Code::PBD | Code::UBD => {
                // Bundle exchange belongs to the download queue; surface it.
                if let Some(user) = self.find_user(c.from()) {
                    self.emit(ClientEvent::PartialResult { command: c, user });
                }
            }
            other => {
                tracing::trace!(url = %self.url, code = %other, "unhandled command");
            }
        }
    }

    // ---- login ----------------------------------------------------------

    fn on_sup(&self, c: &AdcCommand) {
        if self.state() != ConnectState::Protocol {
            return;
        }
        let mut base_ok = false;
        let mut tigr_ok = false;
        for p in c.params() {
            match p.as_str() {
                x if x == sup::BAS0 => {
                    base_ok = true;
                    tigr_ok = true;
                }
                x if x == sup::BASE => base_ok = true,
                x if x == sup::TIGR => tigr_ok = true,
                x if x == sup::HBRI => self.supports_hbri.store(true, Ordering::Relaxed),
                _ => {}
            }
        }
        if !base_ok {
            self.status_message(Severity::Error, "Failed to negotiate base protocol");
            self.disconnect_socket(false);
            return;
        }
        if !tigr_ok {
            // Some hubs fake base support without the tiger extension.
            self.old_password.store(true, Ordering::Relaxed);
            self.status_message(
                Severity::Error,
                "Hub probably uses an old protocol revision, please encourage the owner to upgrade",
            );
        }
    }

    fn on_sid(&self, c: &AdcCommand) {
        if self.state() != ConnectState::Protocol {
            tracing::debug!(url = %self.url, "SID in wrong state");
            return;
        }
        let Some(token) = c.param(0) else { return };
        let Ok(sid) = Sid::parse(token) else { return };
        *self.sid.write() = sid;
        self.set_state(ConnectState::Identify);
        self.send_info();
    }

    fn on_gpa(&self, c: &AdcCommand) {
        if c.from() != Sid::HUB {
            return;
        }
        let Some(salt) = c.param(0) else { return };
        *self.salt.lock() = Some(salt.to_string());
        self.set_state(ConnectState::Verify);

        let password = self.settings.read().password.clone();
        if password.is_empty() {
            self.emit(ClientEvent::PasswordRequested);
        } else {
            self.password(&password);
        }
    }

    /// Answer a pending password request.
    pub fn password(&self, password: &str) {
        if self.state() != ConnectState::Verify {
            return;
        }
        let Some(salt) = self.salt.lock().take() else {
            return;
        };
        let old = self.old_password.load(Ordering::Relaxed);
        let cid = self.ctx.cid;
        let response =
            password_response(password, &salt, old.then_some(&cid));
        self.registered.store(true, Ordering::Relaxed);
        let _ = self.send(AdcCommand::hub(Code::PAS).add_param(response));
    }

    // ---- user table ------------------------------------------------------

    fn get_or_create_user(&self, sid: Sid, cid: Cid) -> (Arc<OnlineUser>, bool) {
        if let Some(existing) = self.find_user(sid) {
            return (existing, false);
        }
        let user = self.ctx.registry.user(cid);
        let online = OnlineUser::new(user, self.url.clone(), sid);
        self.users.write().insert(sid, Arc::clone(&online));
        self.ctx.registry.put_online(&online);
        (online, true)
    }

    fn put_user(&self, sid: Sid, disconnect_transfers: bool) {
        let removed = self.users.write().remove(&sid);
        if let Some(online) = removed {
            self.available_bytes
                .fetch_sub(online.identity().bytes_shared() as i64, Ordering::Relaxed);
            if sid != Sid::HUB {
                self.ctx.registry.put_offline(&online);
            }
            self.emit(ClientEvent::UserDisconnected {
                user: online,
                disconnect_transfers,
            });
        }
    }

    fn clear_users(&self) {
        let drained: Vec<_> = {
            let mut users = self.users.write();
            self.available_bytes.store(0, Ordering::Relaxed);
            users.drain().collect()
        };
        for (sid, online) in drained {
            if sid != Sid::HUB {
                self.ctx.registry.put_offline(&online);
            }
        }
    }

    fn on_inf(&self, c: &AdcCommand) {
        if c.params().is_empty() {
            return;
        }

        let mut new_user = false;
        let user = if let Some(cid_text) = c.named("ID", 0) {
            let Ok(cid) = Cid::from_base32(cid_text) else {
                return;
            };
            if let Some(existing) = self.find_user_by_cid(&cid) {
                if existing.sid() != c.from() {
                    // Same CID with a different SID: buggy hub, drop it.
                    let nick = c.named("NI", 0).unwrap_or("[nick unknown]");
                    self.spam_message(format!(
                        "{} ({}) has same CID {{{}}} as {} ({}), ignoring",
                        existing.nick(),
                        existing.sid(),
                        cid_text,
                        nick,
                        c.from()
                    ));
                    return;
                }
                existing
            } else {
                let (created, is_new) = self.get_or_create_user(c.from(), cid);
                new_user = is_new;
                created
            }
        } else if c.from() == Sid::HUB {
            let (created, is_new) = self.get_or_create_user(Sid::HUB, Cid::default());
            new_user = is_new;
            created
        } else {
            match self.find_user(c.from()) {
                Some(user) => user,
                None => {
                    tracing::debug!(url = %self.url, "INF for unknown user without ID");
                    return;
                }
            }
        };

        for p in c.params() {
            if p.len() < 2 {
                continue;
            }
            let (key, value) = p.split_at(2);
            if key == "SS" {
                let old = user.identity().bytes_shared() as i64;
                self.available_bytes
                    .fetch_add(value.parse::<i64>().unwrap_or(0) - old, Ordering::Relaxed);
            }
            user.with_identity_mut(|id| id.set(key, value));
        }

        {
            let identity = user.identity();
            if identity.is_bot() {
                user.user.set_flag(UserFlags::BOT);
            } else {
                user.user.unset_flag(UserFlags::BOT);
            }
            if identity.supports(su::ADCS) {
                user.user.set_flag(UserFlags::TLS);
                if identity.supports(su::CCPM) {
                    user.user.set_flag(UserFlags::CCPM);
                }
            }
            if identity.supports(su::ASCH) {
                user.user.set_flag(UserFlags::ASCH);
            }
        }

        if user.user.cid == self.ctx.cid {
            self.on_own_inf(&user, c);
        } else if self.is_connected() {
            let me = self.my_identity();
            user.with_identity_mut(|id| id.update_connect_modes(&me, false));
        }

        let identity = user.identity();
        if identity.is_hub() {
            *self.hub_identity.write() = identity;
            return;
        }

        if new_user {
            self.emit(ClientEvent::UserConnected(user));
        } else {
            self.emit(ClientEvent::UserUpdated(user));
        }
    }

    fn on_own_inf(&self, user: &Arc<OnlineUser>, c: &AdcCommand) {
        let was_normal = self.state() == ConnectState::Normal;
        if !was_normal {
            self.set_state(ConnectState::Normal);
            self.auto_reconnect.store(true, Ordering::Release);
            self.emit(ClientEvent::LoggedIn);
        }

        {
            let me_snapshot = user.identity();
            user.with_identity_mut(|id| {
                let snapshot = me_snapshot.clone();
                id.update_connect_modes(&snapshot, true);
            });
            *self.my_identity.write() = user.identity();
        }

        // Connectivity may have changed: re-derive everyone's modes.
        let connectivity_changed = !was_normal
            || c.params().iter().any(|p| {
                p.starts_with("SU") || p.starts_with("I4") || p.starts_with("I6")
            });
        if connectivity_changed {
            let me = self.my_identity();
            let updated: Vec<_> = self
                .users
                .read()
                .values()
                .filter(|other| {
                    other.identity().tcp_mode() != ConnectMode::Me
                        && other.with_identity_mut(|id| id.update_connect_modes(&me, false))
                })
                .cloned()
                .collect();
            if !updated.is_empty() {
                self.emit(ClientEvent::UsersUpdated(updated));
            }
        }
    }

    fn on_msg(&self, c: &AdcCommand) {
        let Some(text) = c.param(0) else { return };
        let Some(from) = self.find_user(c.from()) else {
            return;
        };

        let mut message = ChatMessage {
            from,
            to: None,
            reply_to: None,
            text: text.to_string(),
            third_person: c.flag("ME", 1),
            timestamp: c.named("TS", 1).and_then(|t| t.parse().ok()),
        };

        if let Some(pm_sid) = c.named("PM", 1) {
            let Some(to) = self.find_user(c.to()) else {
                return;
            };
            let Ok(reply_sid) = Sid::parse(pm_sid) else {
                return;
            };
            let Some(reply_to) = self.find_user(reply_sid) else {
                return;
            };
            message.to = Some(to);
            message.reply_to = Some(reply_to);
            self.emit(ClientEvent::PrivateMessage(message));
            return;
        }

        self.emit(ClientEvent::Chat(message));
    }

    fn on_qui(&self, c: &AdcCommand) {
        let Some(sid_token) = c.param(0) else { return };
        let Ok(sid) = Sid::parse(sid_token) else { return };

        let victim = self.find_user(sid);
        if let Some(victim) = &victim {
            if let Some(message) = c.named("MS", 1) {
                let kicker = c
                    .named("ID", 1)
                    .and_then(|t| Sid::parse(t).ok())
                    .and_then(|s| self.find_user(s));
                let text = match kicker {
                    Some(kicker) => format!(
                        "{} was kicked by {}: {}",
                        victim.nick(),
                        kicker.nick(),
                        message
                    ),
                    None => format!("{} was kicked: {}", victim.nick(), message),
                };
                self.spam_message(text);
            }
            self.put_user(sid, c.named("DI", 1).is_some());
        }

        if sid == self.sid() {
            // Directed at us.
            if let Some(tl) = c.named("TL", 1) {
                if tl == "-1" {
                    self.auto_reconnect.store(false, Ordering::Release);
                } else {
                    self.auto_reconnect.store(true, Ordering::Release);
                    self.reconnect_delay
                        .store(tl.parse().unwrap_or(RECONNECT_DELAY_SECS), Ordering::Relaxed);
                }
            }
            if victim.is_none() {
                if let Some(message) = c.named("MS", 1) {
                    self.status_message(Severity::Info, message);
                }
            }
            if let Some(redirect) = c.named("RD", 1) {
                self.emit(ClientEvent::Redirect {
                    url: redirect.to_string(),
                });
            }
        }
    }

    // ---- user connections ------------------------------------------------

    fn check_protocol(&self, user: &Arc<OnlineUser>, protocol: &str, token: &str) -> Option<bool> {
        let secure = if protocol == CLIENT_PROTOCOL {
            false
        } else if protocol == SECURE_CLIENT_PROTOCOL {
            true
        } else {
            let cmd = AdcCommand::direct(Code::STA, user.sid())
                .add_param(
                    AdcStatus::new(StatusSeverity::Recoverable, AdcStatus::PROTOCOL_UNSUPPORTED)
                        .to_string(),
                )
                .add_param(format!("{protocol} protocol not supported"))
                .add_named("PR", protocol)
                .add_named("TO", token);
            let _ = self.send(cmd);
            return None;
        };

        if let Some(code) = self.allow_connect(user, secure, true) {
            if code == AdcStatus::TLS_REQUIRED {
                let cmd = AdcCommand::direct(Code::STA, user.sid())
                    .add_param(AdcStatus::new(StatusSeverity::Recoverable, code).to_string())
                    .add_param("TLS encryption required");
                let _ = self.send(cmd);
            }
            return None;
        }
        Some(secure)
    }

    /// `None` when the connection may proceed, otherwise the error code.
    fn allow_connect(&self, user: &Arc<OnlineUser>, secure: bool, check_base: bool) -> Option<u8> {
        if !self.is_connected() {
            return Some(AdcStatus::BAD_STATE);
        }
        if check_base {
            if secure && user.user.is_set(UserFlags::NO_ADCS_0_10) {
                return Some(AdcStatus::PROTOCOL_UNSUPPORTED);
            }
            if !secure && user.user.is_set(UserFlags::NO_ADC_1_0) {
                return Some(AdcStatus::PROTOCOL_UNSUPPORTED);
            }
        }
        if !secure && self.settings.read().tls_forced {
            return Some(AdcStatus::TLS_REQUIRED);
        }
        let mode = user.identity().tcp_mode();
        if mode == ConnectMode::NoConnectPassive {
            return Some(AdcStatus::FEATURE_MISSING);
        }
        if mode == ConnectMode::NoConnectIp {
            return Some(AdcStatus::PROTOCOL_GENERIC);
        }
        None
    }

    fn on_ctm(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        if user.user.cid == self.ctx.cid || c.params().len() < 3 {
            return;
        }
        let (protocol, port, token) = (c.param(0), c.param(1), c.param(2));
        let (Some(protocol), Some(port), Some(token)) = (protocol, port, token) else {
            return;
        };
        let Some(secure) = self.check_protocol(&user, protocol, token) else {
            return;
        };
        let Ok(port) = port.parse() else { return };

        self.emit(ClientEvent::ConnectToMe(ConnectRequest {
            user,
            port,
            token: token.to_string(),
            secure,
            local_port: None,
            nat_server: false,
        }));
    }

    fn on_rcm(&self, c: &AdcCommand) {
        if c.params().len() < 2 {
            return;
        }
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        if user.user.cid == self.ctx.cid {
            return;
        }
        let (Some(protocol), Some(token)) = (c.param(0), c.param(1)) else {
            return;
        };
        let Some(secure) = self.check_protocol(&user, protocol, token) else {
            return;
        };

        let me = self.my_identity();
        if me.is_tcp4_active() || me.is_tcp6_active() {
            // We are active and they want us to connect to them.
            self.connect_user(&user, token, secure, true);
            return;
        }

        if !user.identity().supports(su::NAT0) {
            return;
        }

        // Both passive: attempt NAT traversal over TCP.
        let local_port = self.local_port.load(Ordering::Relaxed);
        let cmd = AdcCommand::direct(Code::NAT, user.sid())
            .add_param(protocol)
            .add_param(local_port.to_string())
            .add_param(token);
        let _ = self.send(cmd);
    }

    fn on_nat(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        if user.user.cid == self.ctx.cid || c.params().len() < 3 {
            return;
        }
        let (Some(protocol), Some(remote_port), Some(token)) =
            (c.param(0), c.param(1), c.param(2))
        else {
            return;
        };
        let Some(secure) = self.check_protocol(&user, protocol, token) else {
            return;
        };
        let Ok(port) = remote_port.parse() else { return };
        let local_port = self.local_port.load(Ordering::Relaxed) as u16;

        // Start our outbound attempt and tell the peer to do likewise.
        self.emit(ClientEvent::ConnectToMe(ConnectRequest {
            user: Arc::clone(&user),
            port,
            token: token.to_string(),
            secure,
            local_port: Some(local_port),
            nat_server: false,
        }));

        let cmd = AdcCommand::direct(Code::RNT, user.sid())
            .add_param(protocol)
            .add_param(local_port.to_string())
            .add_param(token);
        let _ = self.send(cmd);
    }

    fn on_rnt(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        if user.user.cid == self.ctx.cid || c.params().len() < 3 {
            return;
        }
        let (Some(protocol), Some(remote_port), Some(token)) =
            (c.param(0), c.param(1), c.param(2))
        else {
            return;
        };
        let Some(secure) = self.check_protocol(&user, protocol, token) else {
            return;
        };
        let Ok(port) = remote_port.parse() else { return };
        let local_port = self.local_port.load(Ordering::Relaxed) as u16;

        self.emit(ClientEvent::ConnectToMe(ConnectRequest {
            user,
            port,
            token: token.to_string(),
            secure,
            local_port: Some(local_port),
            nat_server: true,
        }));
    }

    /// Ask for (or offer) a connection to `user`.
    pub fn connect_user(
        &self,
        user: &Arc<OnlineUser>,
        token: &str,
        secure: bool,
        replying_rcm: bool,
    ) {
        let protocol = if secure {
            SECURE_CLIENT_PROTOCOL
        } else {
            CLIENT_PROTOCOL
        };
        let me = self.my_identity();
        let mode = user.identity().tcp_mode();
        let accept = (mode.allows_v4() && me.is_tcp4_active())
            || (mode.allows_v6() && me.is_tcp6_active());

        if replying_rcm || accept {
            let settings = self.settings.read();
            let own_port = if secure {
                settings.tls_port
            } else {
                settings.tcp_port
            };
            if own_port == 0 {
                self.status_message(Severity::Error, "Not listening for user connections");
                return;
            }
            let cmd = AdcCommand::direct(Code::CTM, user.sid())
                .add_param(protocol)
                .add_param(own_port.to_string())
                .add_param(token);
            let _ = self.send(cmd);
        } else {
            let cmd = AdcCommand::direct(Code::RCM, user.sid())
                .add_param(protocol)
                .add_param(token);
            let _ = self.send(cmd);
        }
    }

    // ---- searches --------------------------------------------------------

    fn on_sch(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            tracing::debug!(url = %self.url, "search from unknown user");
            return;
        };
        if user.user.cid == self.ctx.cid {
            return;
        }

        // No point responding when no connection could follow.
        let mode = user.identity().tcp_mode();
        if !mode.allows_connections() {
            return;
        }

        self.emit(ClientEvent::IncomingSearch {
            command: c.clone(),
            user,
            udp_reply: mode.is_active(),
        });
    }

    fn on_res(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        self.emit(ClientEvent::SearchResult {
            command: c.clone(),
            user,
        });
    }

    fn on_psr(&self, c: &AdcCommand) {
        let Some(user) = self.find_user(c.from()) else {
            return;
        };
        self.emit(ClientEvent::PartialResult {
            command: c.clone(),
            user,
        });
    }

    /// Queue a search for release on a later tick.
    pub fn queue_search(&self, search: Search) {
        self.search_queue.lock().add(search);
    }

    /// Emit one due search, if any. Called from the second ticker.
    fn release_search(&self, now: u64) {
        if !self.is_connected() {
            return;
        }
        let Some(search) = self.search_queue.lock().maybe_pop(now) else {
            return;
        };

        let (mut cmd, grouped) = construct_search(&search, self.token);

        if !search.key.is_empty() && self.secure {
            cmd = cmd.add_named("KY", &search.key);
        }
        if search.asch_only {
            cmd.set_feature_filter(format!("+{}", su::ASCH));
        }

        if let Some(grouped) = grouped {
            // Grouped variant reaches extension-group peers, the plain one
            // everyone else; no peer sees the search twice.
            let mut grouped = grouped;
            let base = grouped.features().to_string();
            grouped.set_feature_filter(format!("{}+{}", base, su::SEGA));
            self.send_search(grouped);
            let base = cmd.features().to_string();
            cmd.set_feature_filter(format!("{}-{}", base, su::SEGA));
        }
        self.send_search(cmd);
    }

    fn send_search(&self, mut cmd: AdcCommand) {
        if self.my_identity().is_tcp4_active() || self.my_identity().is_tcp6_active() {
            let _ = self.send(cmd);
        } else {
            // Passive: only peers that can reach us should reply.
            let base = cmd.features().to_string();
            cmd.set_feature_filter(format!("{}+{}-{}", base, su::TCP4, su::NAT0));
            let _ = self.send(cmd.clone());
            cmd.set_feature_filter(format!("{}+{}", base, su::NAT0));
            let _ = self.send(cmd);
        }
    }

    // ---- status / misc ---------------------------------------------------

    fn on_sta(&self, c: &AdcCommand) {
        if c.params().len() < 2 {
            return;
        }
        let Ok(status) = c.sta_status() else { return };
        let user = if c.from() == Sid::HUB {
            self.find_user(Sid::HUB)
        } else {
            self.find_user(c.from())
        };

        if status.is_success() {
            if c.named("FC", 1) == Some("DSCH") {
                let (Some(token), Some(count)) = (c.named("TO", 2), c.named("RC", 2)) else {
                    return;
                };
                if let Some((_, local_token)) = token.split_once('/') {
                    self.emit(ClientEvent::DirectSearchEnd {
                        token: local_token.to_string(),
                        result_count: count.parse().unwrap_or(0),
                    });
                }
            }
            return;
        }

        match status.code {
            AdcStatus::BAD_PASSWORD => {
                if c.from() == Sid::HUB {
                    self.settings.write().password.clear();
                    self.registered.store(false, Ordering::Relaxed);
                }
            }
            AdcStatus::COMMAND_ACCESS => {
                if c.from() == Sid::HUB {
                    if let Some(fc) = c.named("FC", 1).and_then(FourCc::parse) {
                        self.forbidden.lock().insert(fc);
                    }
                }
            }
            AdcStatus::PROTOCOL_UNSUPPORTED => {
                if let (Some(user), Some(protocol)) = (&user, c.named("PR", 1)) {
                    if protocol == CLIENT_PROTOCOL {
                        user.user.set_flag(UserFlags::NO_ADC_1_0);
                    } else if protocol == SECURE_CLIENT_PROTOCOL {
                        user.user.set_flag(UserFlags::NO_ADCS_0_10);
                        user.user.unset_flag(UserFlags::TLS);
                    }
                }
                return;
            }
            AdcStatus::HBRI_TIMEOUT => {
                if c.from() == Sid::HUB {
                    if let Some(worker) = self.hbri.lock().take() {
                        worker.cancel();
                    }
                    if let Some(message) = c.param(1) {
                        self.status_message(Severity::Error, message);
                    }
                }
                return;
            }
            AdcStatus::BAD_STATE => {
                if let Some(fc) = c.named("FC", 1) {
                    self.status_message(
                        Severity::Error,
                        format!(
                            "{} (command {fc}, client state {:?})",
                            c.param(1).unwrap_or(""),
                            self.state()
                        ),
                    );
                    return;
                }
            }
            _ => {}
        }

        if let (Some(user), Some(text)) = (user, c.param(1)) {
            self.emit(ClientEvent::Chat(ChatMessage {
                from: user,
                to: None,
                reply_to: None,
                text: text.to_string(),
                third_person: false,
                timestamp: None,
            }));
        }
    }

    fn on_tcp(&self, c: &AdcCommand) {
        if c.typ() != CommandType::Info || c.from() != Sid::HUB || c.params().len() < 3 {
            return;
        }
        // A fresh request preempts a running validation.
        if let Some(worker) = self.hbri.lock().take() {
            worker.cancel();
        }

        let Some(token) = c.named("TO", 0) else { return };

        // Validate over the family the main socket does not use.
        let settings = self.settings();
        let v6 = !self.local_is_v6.load(Ordering::Relaxed);
        let (ip_key, port_key) = if v6 { ("I6", "P6") } else { ("I4", "P4") };
        let (Some(address), Some(port)) = (c.named(ip_key, 0), c.named(port_key, 0)) else {
            return;
        };
        let Ok(port) = port.parse() else { return };

        self.status_message(
            Severity::Info,
            format!("Validating {} connectivity", if v6 { "IPv6" } else { "IPv4" }),
        );

        let connectivity = if v6 {
            vec![
                ("I6".to_string(), settings.user_ip6.clone()),
                ("U6".to_string(), settings.udp_port.to_string()),
            ]
        } else {
            vec![
                ("I4".to_string(), settings.user_ip4.clone()),
                ("U4".to_string(), settings.udp_port.to_string()),
            ]
        };

        let request = HbriRequest {
            address: address.to_string(),
            port,
            secure: self.secure,
            allow_untrusted: settings.allow_untrusted,
            token: token.to_string(),
            sid: self.sid(),
            connectivity,
        };

        let events = self.events.clone();
        let worker = spawn_hbri(request, move |result| {
            let (severity, text) = match result {
                Ok(()) => (Severity::Info, "Connectivity validation succeeded".to_string()),
                Err(err) => (Severity::Error, format!("Connectivity validation failed: {err}")),
            };
            let _ = events.send(ClientEvent::StatusMessage {
                severity,
                text,
                is_spam: false,
            });
        });
        *self.hbri.lock() = Some(worker);
    }

    fn on_zon(&self, c: &AdcCommand) {
        // The transport switches framing inline when it emits this line;
        // switching here again would race the bytes that follow it.
        if c.from() == Sid::HUB {
            tracing::debug!(url = %self.url, "hub enabled compressed frames");
        }
    }

    fn on_zof(&self, c: &AdcCommand) {
        // Line mode resumes at the compressed stream's end marker.
        if c.from() == Sid::HUB {
            tracing::debug!(url = %self.url, "hub disabled compressed frames");
        }
    }

    fn on_cmd(&self, c: &AdcCommand) {
        let Some(name) = c.param(0) else { return };
        let remove = c.flag("RM", 1);
        let separator = c.flag("SP", 1);
        let context = c.named("CT", 1).and_then(|v| v.parse().ok()).unwrap_or(0);
        if !remove && !separator && (context <= 0 || c.named("TT", 1).is_none()) {
            return;
        }
        self.emit(ClientEvent::HubUserCommand(UserCommand {
            name: name.to_string(),
            context,
            command: c.named("TT", 1).unwrap_or("").to_string(),
            remove,
            separator,
            once: c.flag("CO", 1),
        }));
    }

    // ---- hub GET (bloom) -------------------------------------------------

    fn on_get(&self, c: &AdcCommand) {
        if c.param(0) != Some("blom") {
            let _ = self.send(AdcCommand::status(
                CommandType::Hub,
                AdcStatus::new(StatusSeverity::Fatal, AdcStatus::TRANSFER_GENERIC),
                "Unknown transfer type",
            ));
            return;
        }
        if c.params().len() < 3 {
            let _ = self.send(AdcCommand::status(
                CommandType::Hub,
                AdcStatus::new(StatusSeverity::Fatal, AdcStatus::PROTOCOL_GENERIC),
                "Too few parameters for blom",
            ));
            return;
        }

        let size_bytes: u64 = c.param(2).and_then(|v| v.parse().ok()).unwrap_or(0);
        let k: u64 = c.named("BK", 3).and_then(|v| v.parse().ok()).unwrap_or(0);
        let h: u64 = c.named("BH", 3).and_then(|v| v.parse().ok()).unwrap_or(0);
        let m_bits = size_bytes * 8;

        let reject = |what: &str| {
            let _ = self.send(AdcCommand::status(
                CommandType::Hub,
                AdcStatus::new(StatusSeverity::Recoverable, AdcStatus::TRANSFER_GENERIC),
                &format!("Unsupported {what}"),
            ));
        };

        let profile = self.settings.read().share_profile;
        match self.ctx.tree.build_hash_bloom(k, m_bits, h, profile) {
            Ok(bits) => {
                let mut reply = AdcCommand::hub(Code::SND);
                for p in c.params() {
                    reply = reply.add_param(p.clone());
                }
                if self.send(reply).is_ok() {
                    if let Some(conn) = self.conn.lock().as_ref() {
                        let _ = conn.write_bytes(bits);
                    }
                }
            }
            Err(adcx_share::ShareError::UnsupportedBloom(what)) => reject(what),
            Err(err) => {
                tracing::warn!(url = %self.url, %err, "bloom generation failed");
                reject("request");
            }
        }
    }

    // ---- own INF ---------------------------------------------------------

    fn send_info(&self) {
        if !matches!(self.state(), ConnectState::Identify | ConnectState::Normal) {
            return;
        }

        let settings = self.settings();
        let mut cmd = AdcCommand::broadcast(Code::INF);
        let mut last = self.last_info.lock();

        fn add(
            last: &mut HashMap<String, String>,
            cmd: &mut AdcCommand,
            key: &str,
            value: String,
        ) {
            match last.get(key) {
                Some(existing) if *existing == value => {}
                Some(_) if value.is_empty() => {
                    last.remove(key);
                    *cmd = cmd.clone().add_named(key, "");
                }
                None if value.is_empty() => {}
                _ => {
                    last.insert(key.to_string(), value.clone());
                    *cmd = cmd.clone().add_named(key, value);
                }
            }
        }

        add(&mut last, &mut cmd, "ID", self.ctx.cid.to_base32());
        add(&mut last, &mut cmd, "PD", self.ctx.pid.to_base32());
        add(&mut last, &mut cmd, "NI", sanitize_nick(&settings.nick));
        add(&mut last, &mut cmd, "DE", settings.description.clone());
        add(&mut last, &mut cmd, "SL", self.ctx.scheduler.slots().to_string());
        add(&mut last, &mut cmd, "FS", self.ctx.scheduler.free_slots().to_string());

        let (share_bytes, share_files) = self.ctx.tree.profile_stats(settings.share_profile);
        add(&mut last, &mut cmd, "SS", share_bytes.to_string());
        add(&mut last, &mut cmd, "SF", share_files.to_string());
        add(&mut last, &mut cmd, "EM", settings.email.clone());

        let counts = self.ctx.registry.hub_counts();
        add(&mut last, &mut cmd, "HN", counts.normal.to_string());
        add(&mut last, &mut cmd, "HR", counts.registered.to_string());
        add(&mut last, &mut cmd, "HO", counts.op.to_string());
        add(&mut last, &mut cmd, "VE", settings.version.clone());
        add(&mut last, &mut cmd, "DS", settings.download_speed.to_string());
        add(&mut last, &mut cmd, "US", settings.upload_speed.to_string());

        if !settings.keyprint.is_empty() {
            add(&mut last, &mut cmd, "KP", settings.keyprint.clone());
        }

        let hbri = self.supports_hbri.load(Ordering::Relaxed);
        let add_v4 = settings.active_v4 || hbri;
        let add_v6 = settings.active_v6 || hbri;

        let mut supports = vec![su::SEGA.to_string()];
        if !settings.keyprint.is_empty() {
            supports.push(su::ADCS.to_string());
            supports.push(su::CCPM.to_string());
        }
        if add_v4 && settings.active_v4 {
            supports.push(su::TCP4.to_string());
            supports.push(su::UDP4.to_string());
        }
        if add_v6 && settings.active_v6 {
            supports.push(su::TCP6.to_string());
            supports.push(su::UDP6.to_string());
        }
        if (add_v4 && !settings.active_v4) || (add_v6 && !settings.active_v6) {
            supports.push(su::NAT0.to_string());
        }
        supports.push(su::ASCH.to_string());
        add(&mut last, &mut cmd, "SU", supports.join(","));

        // Connectivity fields.
        if settings.active_v4 || hbri {
            let ip = if settings.user_ip4.is_empty() {
                "0.0.0.0".to_string()
            } else {
                settings.user_ip4.clone()
            };
            add(&mut last, &mut cmd, "I4", ip);
            let udp = if settings.active_v4 {
                settings.udp_port.to_string()
            } else {
                String::new()
            };
            add(&mut last, &mut cmd, "U4", udp);
        } else {
            add(&mut last, &mut cmd, "I4", String::new());
            add(&mut last, &mut cmd, "U4", String::new());
        }
        if settings.active_v6 || hbri {
            let ip = if settings.user_ip6.is_empty() {
                "::".to_string()
            } else {
                settings.user_ip6.clone()
            };
            add(&mut last, &mut cmd, "I6", ip);
            let udp = if settings.active_v6 {
                settings.udp_port.to_string()
            } else {
                String::new()
            };
            add(&mut last, &mut cmd, "U6", udp);
        } else {
            add(&mut last, &mut cmd, "I6", String::new());
            add(&mut last, &mut cmd, "U6", String::new());
        }

        drop(last);
        if !cmd.params().is_empty() {
            let _ = self.send(cmd);
        }
    }

    /// Re-send our `INF` with only changed attributes.
    pub fn update_info(&self) {
        self.send_info();
    }

    // ---- messaging -------------------------------------------------------

    /// Send a main-chat message.
    ///
    /// # Errors
    ///
    /// Send failures, including hub-forbidden `MSG`.
    pub fn hub_message(&self, text: &str, third_person: bool) -> Result<(), CoreError> {
        let mut cmd = AdcCommand::broadcast(Code::MSG).add_param(text);
        if third_person {
            cmd = cmd.add_named("ME", "1");
        }
        self.send(cmd)
    }

    /// Send a private message.
    ///
    /// # Errors
    ///
    /// `BadProtocolState` before login; send failures after.
    pub fn private_message(
        &self,
        user: &Arc<OnlineUser>,
        text: &str,
        third_person: bool,
        echo: bool,
    ) -> Result<(), CoreError> {
        if !self.is_connected() {
            return Err(CoreError::BadProtocolState("not logged in"));
        }
        let code = Code::MSG;
        let mut cmd = if echo {
            AdcCommand::echo(code, user.sid())
        } else {
            AdcCommand::direct(code, user.sid())
        };
        cmd = cmd.add_param(text).add_named("PM", self.sid().to_string());
        if third_person {
            cmd = cmd.add_named("ME", "1");
        }
        self.send(cmd)
    }

    // ---- ticking ---------------------------------------------------------

    /// Once-per-second housekeeping: search release and keep-alive.
    pub fn on_second(&self, now: u64) {
        self.release_search(now);

        if self.is_connected() {
            let last = self.last_outbound.load(Ordering::Relaxed);
            if last > 0 && now > last + KEEPALIVE_MS {
                let _ = self.send_line("\n".to_string());
            }
        }
    }

    fn disconnect_socket(&self, graceful: bool) {
        if let Some(conn) = self.conn.lock().as_ref() {
            conn.disconnect(graceful);
        }
    }
}

/// Replace control characters and spaces in hub-supplied nicks.
fn sanitize_nick(nick: &str) -> String {
    nick.chars()
        .map(|c| if (c as u32) <= 32 { '_' } else { c })
        .collect()
}

//! The composition root.
//!
//! A [`Core`] is built once at startup and owns every subsystem in a fixed
//! order: identity, share tree, validator, hash store, refresh engine,
//! upload scheduler, client registry, peer server, tickers. Teardown runs
//! in reverse. Components receive the pieces they need through
//! [`CoreContext`]; nothing is process-global.

use crate::client::{HubClient, HubSettings};
use crate::events::ClientEvent;
use crate::peer::{ExpectedConnections, PeerServer};
use crate::registry::ClientRegistry;
use crate::search_queue::Priority;
use adcx_proto::{AdcCommand, Cid, Code, Pid, Sid};
use adcx_search::SearchQuery;
use adcx_share::tree::SearchItem;
use adcx_share::{
    HashStore, MemoryHashStore, RefreshEngine, RefreshKind, RefreshPriority, ShareTree,
    ShareValidator,
};
use adcx_transfer::{PartialSourceProvider, UploadConfig, UploadScheduler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared dependencies handed to hub sessions and the peer server.
pub struct CoreContext {
    /// Our content ID.
    pub cid: Cid,
    /// Our private ID (never leaves the process except in login `INF`).
    pub pid: Pid,
    /// The share index.
    pub tree: Arc<ShareTree>,
    /// The upload scheduler.
    pub scheduler: Arc<UploadScheduler>,
    /// Cross-hub registry.
    pub registry: Arc<ClientRegistry>,
}

/// Startup configuration.
pub struct CoreSettings {
    /// Private ID; a fresh one is generated when absent.
    pub pid: Option<Pid>,
    /// Upload scheduler tuning.
    pub upload: UploadConfig,
    /// Defaults applied to new hub sessions.
    pub hub_defaults: HubSettings,
    /// Partially downloaded files source (the download queue), if any.
    pub partial_sources: Option<Arc<dyn PartialSourceProvider>>,
    /// Hash store; an in-memory store is used when absent.
    pub hash_store: Option<Arc<dyn HashStore>>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        CoreSettings {
            pid: None,
            upload: UploadConfig::default(),
            hub_defaults: HubSettings::default(),
            partial_sources: None,
            hash_store: None,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The assembled peer core.
pub struct Core {
    ctx: Arc<CoreContext>,
    validator: Arc<ShareValidator>,
    refresh: Arc<RefreshEngine>,
    expected: Arc<ExpectedConnections>,
    peer_server: Mutex<Option<PeerServer>>,
    hub_defaults: HubSettings,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Core {
    /// Build the core. Startup order: identity → share → validator →
    /// store → refresh engine → scheduler → registry.
    #[must_use]
    pub fn new(settings: CoreSettings) -> Arc<Self> {
        let pid = settings.pid.unwrap_or_else(Pid::generate);
        let cid = pid.derive_cid();

        let tree = Arc::new(ShareTree::new());
        let validator = Arc::new(ShareValidator::new());
        let store: Arc<dyn HashStore> = settings
            .hash_store
            .unwrap_or_else(|| Arc::new(MemoryHashStore::new()));
        let refresh = RefreshEngine::new(
            Arc::clone(&tree),
            Arc::clone(&validator),
            Arc::clone(&store),
        );
        let scheduler = Arc::new(UploadScheduler::new(
            Arc::clone(&tree),
            store,
            settings.partial_sources,
            settings.upload,
            cid,
        ));
        let registry = ClientRegistry::new();

        let ctx = Arc::new(CoreContext {
            cid,
            pid,
            tree,
            scheduler,
            registry,
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new(Core {
            ctx,
            validator,
            refresh,
            expected: Arc::new(ExpectedConnections::default()),
            peer_server: Mutex::new(None),
            hub_defaults: settings.hub_defaults,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tickers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> Arc<CoreContext> {
        Arc::clone(&self.ctx)
    }

    /// Our content ID.
    #[must_use]
    pub fn cid(&self) -> Cid {
        self.ctx.cid
    }

    /// The share validator (skiplist / excludes).
    #[must_use]
    pub fn validator(&self) -> Arc<ShareValidator> {
        Arc::clone(&self.validator)
    }

    /// The refresh engine.
    #[must_use]
    pub fn refresh(&self) -> Arc<RefreshEngine> {
        Arc::clone(&self.refresh)
    }

    /// The map of expected peer-connection tokens.
    #[must_use]
    pub fn expected_connections(&self) -> Arc<ExpectedConnections> {
        Arc::clone(&self.expected)
    }

    /// Take the event stream (once).
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.lock().take()
    }

    /// Start background work: the refresh worker, the peer server (when a
    /// listen port is configured) and the second/minute tickers.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.refresh.start();

        if self.hub_defaults.tcp_port != 0 {
            let server = PeerServer::new(
                self.context(),
                Arc::clone(&self.expected),
                self.hub_defaults.tcp_port,
            );
            server.start();
            *self.peer_server.lock() = Some(server);
        }

        let mut tickers = self.tickers.lock();

        // Second ticker: searches, keep-alives, slot notifications.
        let core = Arc::clone(self);
        tickers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            while core.running.load(Ordering::Acquire) {
                interval.tick().await;
                core.on_second();
            }
        }));

        // Minute ticker: reservations, notify expiry, MCN reconciliation.
        let core = Arc::clone(self);
        tickers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            while core.running.load(Ordering::Acquire) {
                interval.tick().await;
                core.on_minute();
            }
        }));
    }

    fn on_second(&self) {
        let now_ms = unix_now() * 1000;
        for client in self.ctx.registry.clients() {
            client.on_second(now_ms);
        }

        // Users waiting for a slot get dialled when one frees up.
        for (cid, token) in self.ctx.scheduler.second_tick(unix_now()) {
            for online in self.ctx.registry.online_users(&cid) {
                if let Some(client) = self.ctx.registry.by_url(&online.hub_url) {
                    if client.is_connected() {
                        let secure = online.user.is_set(crate::user::UserFlags::TLS);
                        self.expected.expect(&token, cid, &online.hub_url);
                        client.connect_user(&online, &token, secure, false);
                        break;
                    }
                }
            }
        }
    }

    fn on_minute(&self) {
        let lapsed = self.ctx.scheduler.minute_tick(unix_now());
        for cid in lapsed {
            tracing::debug!(user = %cid, "slot reservation expired");
        }
    }

    /// Open (or return) a hub session for `url` and start connecting.
    #[must_use]
    pub fn connect_hub(&self, url: &str, settings: Option<HubSettings>) -> Arc<HubClient> {
        if let Some(existing) = self.ctx.registry.by_url(url) {
            return existing;
        }
        let client = HubClient::new(
            url,
            settings.unwrap_or_else(|| self.hub_defaults.clone()),
            self.context(),
            self.events_tx.clone(),
        );
        client.start();
        client
    }

    /// Close and forget a hub session.
    pub async fn remove_hub(&self, url: &str) {
        if let Some(client) = self.ctx.registry.unregister(url) {
            client.shutdown().await;
        }
    }

    /// Queue a search on every connected hub.
    pub fn search_all(&self, search: crate::search_queue::Search) {
        for client in self.ctx.registry.clients() {
            if client.is_connected() {
                client.queue_search(search.clone());
            }
        }
    }

    /// Queue a background (auto) search.
    pub fn auto_search(&self, query: &str, token: &str) {
        let mut search = crate::search_queue::Search::new(query, token, Priority::Low);
        search.recent = true;
        self.search_all(search);
    }

    /// Answer an incoming `SCH` against the share, sending `RES` replies
    /// through the hub the search arrived on.
    pub fn respond_to_search(
        &self,
        client: &Arc<HubClient>,
        command: &AdcCommand,
        from: Sid,
        udp_active: bool,
    ) {
        let max_results = if udp_active { 10 } else { 5 };
        let mut query = SearchQuery::from_adc(command.params(), max_results);
        let profile = client.settings().share_profile;
        let results = self.ctx.tree.search(&mut query, profile);
        if results.is_empty() {
            return;
        }

        let token = command.named("TO", 0).map(str::to_string);
        let free_slots = self.ctx.scheduler.free_slots();

        for result in results {
            let mut res = AdcCommand::direct(Code::RES, from);
            if let Some(token) = &token {
                res = res.add_named("TO", token);
            }
            match &result.item {
                SearchItem::File(file) => {
                    res = res
                        .add_named("FN", file.adc_path())
                        .add_named("SI", file.size.to_string())
                        .add_named("TR", file.tth.to_base32());
                }
                SearchItem::Directory(dir) => {
                    let (size, _, _) = dir.totals();
                    res = res
                        .add_named("FN", dir.adc_path())
                        .add_named("SI", size.to_string());
                }
            }
            res = res.add_named("SL", free_slots.to_string());
            let _ = client.send(res);
        }
    }

    /// Queue a refresh of every share root.
    ///
    /// # Errors
    ///
    /// Queue-merge rejections from the engine.
    pub fn refresh_all(&self) -> Result<(), adcx_share::ShareError> {
        self.refresh.enqueue(RefreshKind::All, RefreshPriority::Manual)
    }

    /// Stop everything, reverse of startup: hubs first, then the peer
    /// server, tickers and the refresh worker.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);

        for client in self.ctx.registry.clients() {
            client.shutdown().await;
            self.ctx.registry.unregister(client.url());
        }

        if let Some(server) = self.peer_server.lock().take() {
            server.stop();
        }

        for ticker in self.tickers.lock().drain(..) {
            ticker.abort();
        }

        self.refresh.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_builds_and_shuts_down() {
        let core = Core::new(CoreSettings::default());
        core.start();
        assert!(core.take_events().is_some());
        assert!(core.take_events().is_none());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn connect_hub_is_idempotent_per_url() {
        let core = Core::new(CoreSettings::default());
        let a = core.connect_hub("adc://one.example:411", None);
        let b = core.connect_hub("adc://one.example:411", None);
        assert!(Arc::ptr_eq(&a, &b));
        core.shutdown().await;
    }

    #[tokio::test]
    async fn cid_is_derived_from_pid() {
        let pid = Pid::from_bytes([5u8; 24]);
        let expected = pid.derive_cid();
        let core = Core::new(CoreSettings {
            pid: Some(pid),
            ..Default::default()
        });
        assert_eq!(core.cid(), expected);
        core.shutdown().await;
    }
}

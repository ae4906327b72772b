//! The refresh engine: a priority task queue drained by one worker thread,
//! and the disk walker that rebuilds subtrees.
//!
//! Walks happen outside the tree lock; the finished subtree is spliced in
//! under a short write section. Files without a cached hash are hashed
//! after the splice, on the same worker, and inserted as they complete.
//! The bloom filter is extended by partial refreshes and rebuilt from
//! scratch only by a full refresh.

use crate::dual_string::DualString;
use crate::error::ShareError;
use crate::hash_store::{hash_file, FileIdentity, HashStore};
use crate::profile::{RefreshState, ShareRoot};
use crate::tree::{DirPtr, Directory, ShareTree};
use crate::validator::ShareValidator;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a queued refresh covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshKind {
    /// Initial load of every configured root.
    Startup,
    /// Every root, with a bloom rebuild.
    All,
    /// Roots flagged as incoming only.
    Incoming,
    /// Specific real paths.
    Dirs(Vec<PathBuf>),
    /// A newly added root path.
    AddDir(PathBuf),
    /// A finished download directory.
    Bundle(PathBuf),
}

/// Queue priority of a refresh task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshPriority {
    /// Background schedule
    Scheduled = 0,
    /// Ordinary request
    Normal = 1,
    /// User-initiated
    Manual = 2,
    /// Caller blocks on completion
    Blocking = 3,
}

/// Counters produced by one refresh task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    /// Bytes added to the share.
    pub added_size: u64,
    /// Bytes queued for hashing.
    pub hash_size: u64,
    /// Files reused from the previous tree or the hash store.
    pub existing_files: u64,
    /// Files hashed during this task.
    pub new_files: u64,
    /// Entries rejected by the validator.
    pub skipped: u64,
    /// Directories carried over unchanged.
    pub existing_dirs: u64,
    /// Directories seen for the first time.
    pub new_dirs: u64,
}

impl RefreshStats {
    fn merge(&mut self, other: &RefreshStats) {
        self.added_size += other.added_size;
        self.hash_size += other.hash_size;
        self.existing_files += other.existing_files;
        self.new_files += other.new_files;
        self.skipped += other.skipped;
        self.existing_dirs += other.existing_dirs;
        self.new_dirs += other.new_dirs;
    }
}

struct QueuedTask {
    kind: RefreshKind,
    priority: RefreshPriority,
    canceled: Arc<AtomicBool>,
    done: Option<Sender<Result<RefreshStats, String>>>,
}

enum WorkerMessage {
    Wake,
    Quit,
}

/// The refresh engine. One worker thread drains the queue.
pub struct RefreshEngine {
    tree: Arc<ShareTree>,
    validator: Arc<ShareValidator>,
    store: Arc<dyn HashStore>,
    roots: RwLock<Vec<Arc<ShareRoot>>>,
    queue: Arc<Mutex<Vec<QueuedTask>>>,
    pending_paths: Arc<Mutex<BTreeSet<String>>>,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn mtime_of(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RefreshEngine {
    /// Create an engine over a tree, validator and hash store.
    #[must_use]
    pub fn new(
        tree: Arc<ShareTree>,
        validator: Arc<ShareValidator>,
        store: Arc<dyn HashStore>,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(RefreshEngine {
            tree,
            validator,
            store,
            roots: RwLock::new(Vec::new()),
            queue: Arc::new(Mutex::new(Vec::new())),
            pending_paths: Arc::new(Mutex::new(BTreeSet::new())),
            tx,
            rx,
            worker: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a configured root. It is mounted on its first refresh.
    pub fn register_root(&self, root: Arc<ShareRoot>) {
        self.roots.write().push(root);
    }

    /// Unregister and unmount a root.
    pub fn unregister_root(&self, path: &Path) -> Result<(), ShareError> {
        let lower = path.to_string_lossy().to_lowercase();
        self.roots.write().retain(|r| r.path_lower != lower);
        // May not be mounted yet; that is fine.
        let _ = self.tree.remove_root(path);
        Ok(())
    }

    /// Snapshot of configured roots.
    #[must_use]
    pub fn configured_roots(&self) -> Vec<Arc<ShareRoot>> {
        self.roots.read().clone()
    }

    /// Start the worker thread.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.worker.lock();
        if guard.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *guard = Some(std::thread::spawn(move || engine.worker_loop()));
    }

    /// Stop the worker, canceling the running task.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        {
            let queue = self.queue.lock();
            for task in queue.iter() {
                task.canceled.store(true, Ordering::Release);
            }
        }
        let _ = self.tx.send(WorkerMessage::Quit);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Queue a refresh. Paths already pending are merged away; a queued
    /// full refresh supersedes path-level tasks.
    ///
    /// # Errors
    ///
    /// `RefreshRejected` when nothing remains to do after merging.
    pub fn enqueue(&self, kind: RefreshKind, priority: RefreshPriority) -> Result<(), ShareError> {
        self.enqueue_inner(kind, priority, None)
    }

    /// Queue a refresh and block until it completes.
    ///
    /// # Errors
    ///
    /// Merge rejections from [`enqueue`](Self::enqueue) plus any failure of
    /// the task itself.
    pub fn refresh_blocking(&self, kind: RefreshKind) -> Result<RefreshStats, ShareError> {
        let (done_tx, done_rx) = unbounded();
        self.enqueue_inner(kind, RefreshPriority::Blocking, Some(done_tx))?;
        match done_rx.recv() {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(message)) => Err(ShareError::RefreshRejected(message)),
            Err(_) => Err(ShareError::RefreshRejected("engine stopped".into())),
        }
    }

    fn enqueue_inner(
        &self,
        kind: RefreshKind,
        priority: RefreshPriority,
        done: Option<Sender<Result<RefreshStats, String>>>,
    ) -> Result<(), ShareError> {
        let kind = {
            let mut pending = self.pending_paths.lock();
            match kind {
                RefreshKind::Dirs(paths) => {
                    let fresh: Vec<PathBuf> = paths
                        .into_iter()
                        .filter(|p| pending.insert(p.to_string_lossy().to_lowercase()))
                        .collect();
                    if fresh.is_empty() {
                        return Err(ShareError::RefreshRejected(
                            "all paths already queued for refresh".into(),
                        ));
                    }
                    RefreshKind::Dirs(fresh)
                }
                RefreshKind::AddDir(path) => {
                    if !pending.insert(path.to_string_lossy().to_lowercase()) {
                        return Err(ShareError::RefreshRejected(
                            "path already queued for refresh".into(),
                        ));
                    }
                    RefreshKind::AddDir(path)
                }
                RefreshKind::Bundle(path) => {
                    if !pending.insert(path.to_string_lossy().to_lowercase()) {
                        return Err(ShareError::RefreshRejected(
                            "path already queued for refresh".into(),
                        ));
                    }
                    RefreshKind::Bundle(path)
                }
                other => other,
            }
        };

        {
            let mut queue = self.queue.lock();
            if matches!(kind, RefreshKind::All | RefreshKind::Startup) {
                // A full refresh covers everything below it; superseded
                // tasks give their paths back.
                let mut pending = self.pending_paths.lock();
                queue.retain(|t| {
                    let smaller = matches!(
                        t.kind,
                        RefreshKind::Dirs(_) | RefreshKind::AddDir(_) | RefreshKind::Bundle(_)
                    );
                    if smaller && t.done.is_none() {
                        match &t.kind {
                            RefreshKind::Dirs(paths) => {
                                for p in paths {
                                    pending.remove(&p.to_string_lossy().to_lowercase());
                                }
                            }
                            RefreshKind::AddDir(p) | RefreshKind::Bundle(p) => {
                                pending.remove(&p.to_string_lossy().to_lowercase());
                            }
                            _ => {}
                        }
                        false
                    } else {
                        true
                    }
                });
            }
            for root in self.roots.read().iter() {
                if Self::kind_covers(&kind, root) {
                    root.set_refresh_state(RefreshState::Pending);
                }
            }
            queue.push(QueuedTask {
                kind,
                priority,
                canceled: Arc::new(AtomicBool::new(false)),
                done,
            });
            // Highest priority last, so the worker pops it first.
            queue.sort_by_key(|t| t.priority);
        }

        let _ = self.tx.send(WorkerMessage::Wake);
        Ok(())
    }

    fn kind_covers(kind: &RefreshKind, root: &ShareRoot) -> bool {
        match kind {
            RefreshKind::Startup | RefreshKind::All => true,
            RefreshKind::Incoming => root.incoming,
            RefreshKind::Dirs(paths) => paths
                .iter()
                .any(|p| p.to_string_lossy().to_lowercase() == root.path_lower),
            RefreshKind::AddDir(p) | RefreshKind::Bundle(p) => {
                p.to_string_lossy().to_lowercase() == root.path_lower
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        while let Ok(message) = self.rx.recv() {
            match message {
                WorkerMessage::Quit => break,
                WorkerMessage::Wake => {}
            }
            loop {
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                let Some(task) = self.queue.lock().pop() else {
                    break;
                };
                let result = self.run_task(&task.kind, &task.canceled);
                if let Err(err) = &result {
                    tracing::warn!(?task.kind, error = %err, "share refresh failed");
                }
                if let Some(done) = &task.done {
                    let _ = done.send(result.map_err(|e| e.to_string()));
                }
            }
        }
    }

    /// Execute a refresh synchronously on the calling thread. The queue
    /// worker goes through here as well.
    ///
    /// # Errors
    ///
    /// I/O failures on the walked paths; hash failures are logged and
    /// skipped per file.
    pub fn run_task(
        &self,
        kind: &RefreshKind,
        canceled: &AtomicBool,
    ) -> Result<RefreshStats, ShareError> {
        let mut total = RefreshStats::default();
        let targets: Vec<Arc<ShareRoot>> = self
            .roots
            .read()
            .iter()
            .filter(|r| Self::kind_covers(kind, r))
            .cloned()
            .collect();

        let full = matches!(kind, RefreshKind::All);
        let mut path_targets: Vec<PathBuf> = Vec::new();
        if let RefreshKind::Dirs(paths) = kind {
            // Paths under (but not equal to) a root refresh just that subtree.
            for p in paths {
                let lower = p.to_string_lossy().to_lowercase();
                if !targets.iter().any(|r| r.path_lower == lower) {
                    path_targets.push(p.clone());
                }
            }
        }
        if let RefreshKind::Bundle(path) = kind {
            let lower = path.to_string_lossy().to_lowercase();
            if !targets.iter().any(|r| r.path_lower == lower) {
                path_targets.push(path.clone());
            }
        }

        for root in targets {
            if canceled.load(Ordering::Acquire) {
                break;
            }
            root.set_refresh_state(RefreshState::Running);
            let result = self.refresh_root(&root, canceled);
            root.set_refresh_state(RefreshState::Normal);
            self.pending_paths
                .lock()
                .remove(&root.path_lower);
            match result {
                Ok(stats) => {
                    root.set_last_refresh(unix_now());
                    total.merge(&stats);
                }
                Err(err) => {
                    tracing::warn!(root = %root.path.display(), error = %err, "root refresh failed");
                }
            }
        }

        for path in path_targets {
            if canceled.load(Ordering::Acquire) {
                break;
            }
            let result = self.refresh_subdirectory(&path, canceled);
            self.pending_paths
                .lock()
                .remove(&path.to_string_lossy().to_lowercase());
            match result {
                Ok(stats) => total.merge(&stats),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "subtree refresh failed");
                }
            }
        }

        if full && !canceled.load(Ordering::Acquire) {
            self.tree.rebuild_bloom();
        }

        tracing::info!(
            added = total.added_size,
            hashed = total.hash_size,
            new_files = total.new_files,
            existing = total.existing_files,
            skipped = total.skipped,
            "share refresh finished"
        );
        Ok(total)
    }

    fn refresh_root(
        &self,
        root: &Arc<ShareRoot>,
        canceled: &AtomicBool,
    ) -> Result<RefreshStats, ShareError> {
        let meta = std::fs::metadata(&root.path)?;
        let old = self.tree.find_directory(&root.path);
        let fresh = Directory::new_root(Arc::clone(root), mtime_of(&meta));

        let mut builder = ShareBuilder {
            validator: &self.validator,
            store: self.store.as_ref(),
            canceled,
            stats: RefreshStats::default(),
            pending_hash: Vec::new(),
        };
        builder.walk(&root.path, &fresh, old.as_ref())?;

        if canceled.load(Ordering::Acquire) {
            return Err(ShareError::RefreshRejected("refresh canceled".into()));
        }

        self.tree.replace_root_subtree(fresh)?;
        let stats = self.hash_pending(builder.stats, builder.pending_hash, canceled);
        Ok(stats)
    }

    fn refresh_subdirectory(
        &self,
        path: &Path,
        canceled: &AtomicBool,
    ) -> Result<RefreshStats, ShareError> {
        let parent_path = path
            .parent()
            .ok_or_else(|| ShareError::RefreshRejected(format!("{} has no parent", path.display())))?;
        let Some(parent) = self.tree.find_directory(parent_path) else {
            // Parent not shared: fall back to the owning root, if any.
            let lower = path.to_string_lossy().to_lowercase();
            let owner = self
                .roots
                .read()
                .iter()
                .find(|r| lower.starts_with(&format!("{}/", r.path_lower)))
                .cloned();
            return match owner {
                Some(root) => self.refresh_root(&root, canceled),
                None => Err(ShareError::RefreshRejected(format!(
                    "{} is not inside any share root",
                    path.display()
                ))),
            };
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ShareError::RefreshRejected(format!("{} has no name", path.display())))?;
        let meta = std::fs::metadata(path)?;
        let old = parent.child_lower(&name.to_lowercase());
        let fresh = Directory::new_detached(&parent, DualString::new(name), mtime_of(&meta));

        let mut builder = ShareBuilder {
            validator: &self.validator,
            store: self.store.as_ref(),
            canceled,
            stats: RefreshStats::default(),
            pending_hash: Vec::new(),
        };
        builder.walk(path, &fresh, old.as_ref())?;

        if canceled.load(Ordering::Acquire) {
            return Err(ShareError::RefreshRejected("refresh canceled".into()));
        }

        self.tree.replace_subdirectory(fresh)?;
        let stats = self.hash_pending(builder.stats, builder.pending_hash, canceled);
        Ok(stats)
    }

    fn hash_pending(
        &self,
        mut stats: RefreshStats,
        pending: Vec<PendingHash>,
        canceled: &AtomicBool,
    ) -> RefreshStats {
        for item in pending {
            if canceled.load(Ordering::Acquire) {
                break;
            }
            match hash_file(&item.path) {
                Ok(tree) => {
                    let path_lower = item.path.to_string_lossy().to_lowercase();
                    self.store.add_file(&path_lower, item.identity, tree.clone());
                    self.tree.add_hashed_file(
                        &item.parent,
                        item.name,
                        item.identity.size,
                        item.identity.mtime,
                        tree.root,
                    );
                    stats.new_files += 1;
                    stats.added_size += item.identity.size;
                }
                Err(err) => {
                    // Skip the file, keep the task going.
                    tracing::warn!(path = %item.path.display(), error = %err, "hashing failed");
                }
            }
        }
        stats
    }
}

struct PendingHash {
    parent: DirPtr,
    path: PathBuf,
    name: DualString,
    identity: FileIdentity,
}

/// Walks one directory tree on disk, producing a fresh share subtree plus
/// delta counters against the previous subtree.
struct ShareBuilder<'a> {
    validator: &'a ShareValidator,
    store: &'a dyn HashStore,
    canceled: &'a AtomicBool,
    stats: RefreshStats,
    pending_hash: Vec<PendingHash>,
}

impl ShareBuilder<'_> {
    fn walk(
        &mut self,
        real_path: &Path,
        node: &DirPtr,
        old: Option<&DirPtr>,
    ) -> Result<(), ShareError> {
        let mut rejected_here = 0u64;

        for entry in std::fs::read_dir(real_path)? {
            if self.canceled.load(Ordering::Acquire) {
                return Ok(());
            }
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = entry.path();

            if let Err(err) = self.validator.validate(&entry_path, &name, meta.is_dir()) {
                rejected_here += 1;
                self.stats.skipped += 1;
                tracing::trace!(error = %err, "entry rejected");
                continue;
            }

            if meta.is_dir() {
                let name_lower = name.to_lowercase();
                let old_child = old.and_then(|o| o.child_lower(&name_lower));
                if old_child.is_some() {
                    self.stats.existing_dirs += 1;
                } else {
                    self.stats.new_dirs += 1;
                }
                let child = Directory::new_child(node, DualString::new(name), mtime_of(&meta));
                self.walk(&entry_path, &child, old_child.as_ref())?;
            } else if meta.is_file() {
                self.add_file(node, old, &entry_path, name, &meta);
            }
        }

        if rejected_here > 0 {
            tracing::debug!(
                path = %real_path.display(),
                rejected = rejected_here,
                "entries rejected during refresh"
            );
        }
        Ok(())
    }

    fn add_file(
        &mut self,
        node: &DirPtr,
        old: Option<&DirPtr>,
        path: &Path,
        name: String,
        meta: &std::fs::Metadata,
    ) {
        let identity = FileIdentity {
            size: meta.len(),
            mtime: mtime_of(meta),
        };
        let name_lower = name.to_lowercase();

        // Unchanged file in the previous subtree: reuse its hash.
        if let Some(old_file) = old.and_then(|o| o.file_lower(&name_lower)) {
            if old_file.size == identity.size && old_file.last_write == identity.mtime {
                let _ = Directory::add_file(
                    node,
                    DualString::new(name),
                    identity.size,
                    identity.mtime,
                    old_file.tth,
                );
                self.stats.existing_files += 1;
                return;
            }
        }

        // Otherwise consult the hash store cache.
        let path_lower = path.to_string_lossy().to_lowercase();
        if let Some(tth) = self.store.check_tth(&path_lower, identity) {
            let _ = Directory::add_file(
                node,
                DualString::new(name),
                identity.size,
                identity.mtime,
                tth,
            );
            self.stats.existing_files += 1;
            self.stats.added_size += identity.size;
            return;
        }

        // Unknown content: hash after the splice.
        self.stats.hash_size += identity.size;
        self.pending_hash.push(PendingHash {
            parent: Arc::clone(node),
            path: path.to_path_buf(),
            name: DualString::new(name),
            identity,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_store::MemoryHashStore;
    use std::fs;

    fn engine_with_root(dir: &Path) -> (Arc<RefreshEngine>, Arc<ShareTree>) {
        let tree = Arc::new(ShareTree::new());
        let validator = Arc::new(ShareValidator::new());
        let store: Arc<dyn HashStore> = Arc::new(MemoryHashStore::new());
        let engine = RefreshEngine::new(Arc::clone(&tree), validator, store);
        engine.register_root(Arc::new(ShareRoot::new(
            dir.to_path_buf(),
            "Share",
            [0].into_iter().collect(),
            false,
        )));
        (engine, tree)
    }

    #[test]
    fn startup_refresh_builds_and_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("Sub")).unwrap();
        fs::write(tmp.path().join("a.bin"), vec![1u8; 2000]).unwrap();
        fs::write(tmp.path().join("Sub/b.bin"), vec![2u8; 300]).unwrap();

        let (engine, tree) = engine_with_root(tmp.path());
        let stats = engine
            .run_task(&RefreshKind::Startup, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(stats.new_files, 2);
        assert_eq!(stats.hash_size, 2300);
        assert_eq!(tree.total_stats(), (2300, 2));

        let ok: BTreeSet<u32> = [0].into_iter().collect();
        assert!(tree.resolve_file("/Share/a.bin", &ok).is_ok());
        assert!(tree.resolve_file("/Share/Sub/b.bin", &ok).is_ok());
    }

    #[test]
    fn second_refresh_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![1u8; 500]).unwrap();

        let (engine, tree) = engine_with_root(tmp.path());
        let first = engine
            .run_task(&RefreshKind::Startup, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(first.new_files, 1);

        let second = engine
            .run_task(&RefreshKind::Dirs(vec![tmp.path().to_path_buf()]), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(second.hash_size, 0);
        assert_eq!(second.new_files, 0);
        assert_eq!(second.existing_files, 1);
        assert_eq!(tree.total_stats(), (500, 1));
    }

    #[test]
    fn validator_skips_entries() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("keep.iso"), vec![0u8; 100]).unwrap();
        fs::write(tmp.path().join("drop.tmp"), vec![0u8; 100]).unwrap();

        let tree = Arc::new(ShareTree::new());
        let validator = Arc::new(ShareValidator::new());
        validator
            .set_skiplist("*.tmp", crate::validator::SkiplistMode::Glob)
            .unwrap();
        let store: Arc<dyn HashStore> = Arc::new(MemoryHashStore::new());
        let engine = RefreshEngine::new(Arc::clone(&tree), validator, store);
        engine.register_root(Arc::new(ShareRoot::new(
            tmp.path().to_path_buf(),
            "Share",
            [0].into_iter().collect(),
            false,
        )));

        let stats = engine
            .run_task(&RefreshKind::Startup, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(tree.total_stats().1, 1);
    }

    #[test]
    fn blocking_refresh_through_worker() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("x.bin"), vec![9u8; 64]).unwrap();

        let (engine, tree) = engine_with_root(tmp.path());
        engine.start();
        let stats = engine.refresh_blocking(RefreshKind::All).unwrap();
        assert_eq!(stats.new_files, 1);
        assert_eq!(tree.total_stats(), (64, 1));
        engine.shutdown();
    }

    #[test]
    fn duplicate_path_enqueue_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _tree) = engine_with_root(tmp.path());
        // Worker not started: the first enqueue stays pending.
        engine
            .enqueue(
                RefreshKind::Dirs(vec![tmp.path().to_path_buf()]),
                RefreshPriority::Normal,
            )
            .unwrap();
        let second = engine.enqueue(
            RefreshKind::Dirs(vec![tmp.path().to_path_buf()]),
            RefreshPriority::Normal,
        );
        assert!(second.is_err());
    }

    #[test]
    fn incoming_only_touches_incoming_roots() {
        let tmp1 = tempfile::tempdir().unwrap();
        let tmp2 = tempfile::tempdir().unwrap();
        fs::write(tmp1.path().join("a.bin"), vec![1u8; 10]).unwrap();
        fs::write(tmp2.path().join("b.bin"), vec![2u8; 20]).unwrap();

        let tree = Arc::new(ShareTree::new());
        let validator = Arc::new(ShareValidator::new());
        let store: Arc<dyn HashStore> = Arc::new(MemoryHashStore::new());
        let engine = RefreshEngine::new(Arc::clone(&tree), validator, store);
        engine.register_root(Arc::new(ShareRoot::new(
            tmp1.path().to_path_buf(),
            "Normal",
            [0].into_iter().collect(),
            false,
        )));
        engine.register_root(Arc::new(ShareRoot::new(
            tmp2.path().to_path_buf(),
            "Incoming",
            [0].into_iter().collect(),
            true,
        )));

        engine
            .run_task(&RefreshKind::Incoming, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(tree.total_stats(), (20, 1));
    }
}

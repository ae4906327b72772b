//! The share forest and its lookup indices.
//!
//! One [`ShareTree`] owns every mounted root. Three indices hang off it:
//! real path → root directory, lower directory name → directories, and
//! TTH → files. A single shared/exclusive lock covers the forest, the
//! indices and the bloom filter; node-level locks exist only to satisfy
//! shared ownership and are always taken under the tree lock.

use crate::bloom::{HashBloom, ShareBloom, SHARE_BLOOM_BITS};
use crate::dual_string::DualString;
use crate::error::ShareError;
use crate::profile::{ProfileToken, ShareRoot};
use adcx_proto::{TthValue, ADC_SEPARATOR};
use adcx_search::query::ItemType;
use adcx_search::relevance::relevance_score;
use adcx_search::SearchQuery;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to a directory node.
pub type DirPtr = Arc<Directory>;

/// Shared handle to a file node.
pub type FilePtr = Arc<FileNode>;

/// A shared file.
pub struct FileNode {
    /// File name, dual-cased.
    pub name: DualString,
    /// Size in bytes.
    pub size: u64,
    /// Last-modified time, unix seconds.
    pub last_write: u64,
    /// Tiger tree root.
    pub tth: TthValue,
    parent: Weak<Directory>,
}

impl FileNode {
    /// Owning directory. `None` only while the subtree is being torn down.
    #[must_use]
    pub fn parent(&self) -> Option<DirPtr> {
        self.parent.upgrade()
    }

    /// Real filesystem path: parent path plus name.
    #[must_use]
    pub fn real_path(&self) -> PathBuf {
        match self.parent() {
            Some(p) => p.real_path().join(self.name.original()),
            None => PathBuf::from(self.name.original()),
        }
    }

    /// Virtual ADC path of the file.
    #[must_use]
    pub fn adc_path(&self) -> String {
        match self.parent() {
            Some(p) => format!("{}{}", p.adc_path(), self.name.original()),
            None => self.name.original().to_string(),
        }
    }
}

/// A shared directory. Roots carry their [`ShareRoot`] descriptor and use
/// its virtual name; child nodes use the on-disk name.
pub struct Directory {
    /// Directory name (virtual name at roots), dual-cased.
    pub name: DualString,
    parent: Weak<Directory>,
    root: Option<Arc<ShareRoot>>,
    children: RwLock<BTreeMap<String, DirPtr>>,
    files: RwLock<BTreeMap<String, FilePtr>>,
    last_write: AtomicU64,
}

impl Directory {
    /// Create a root-level node from its descriptor.
    #[must_use]
    pub fn new_root(root: Arc<ShareRoot>, last_write: u64) -> DirPtr {
        Arc::new(Directory {
            name: root.virtual_name.clone(),
            parent: Weak::new(),
            root: Some(root),
            children: RwLock::new(BTreeMap::new()),
            files: RwLock::new(BTreeMap::new()),
            last_write: AtomicU64::new(last_write),
        })
    }

    /// Create a child node attached under `parent`.
    #[must_use]
    pub fn new_child(parent: &DirPtr, name: DualString, last_write: u64) -> DirPtr {
        let dir = Self::new_detached(parent, name, last_write);
        parent
            .children
            .write()
            .insert(dir.name.lower().to_string(), Arc::clone(&dir));
        dir
    }

    /// Create a node pointing at `parent` without inserting it into the
    /// parent's child map. Refresh builds replacement subtrees this way;
    /// [`ShareTree::replace_subdirectory`] performs the actual splice.
    #[must_use]
    pub fn new_detached(parent: &DirPtr, name: DualString, last_write: u64) -> DirPtr {
        Arc::new(Directory {
            name,
            parent: Arc::downgrade(parent),
            root: None,
            children: RwLock::new(BTreeMap::new()),
            files: RwLock::new(BTreeMap::new()),
            last_write: AtomicU64::new(last_write),
        })
    }

    /// Attach a file under `parent`.
    #[must_use]
    pub fn add_file(
        parent: &DirPtr,
        name: DualString,
        size: u64,
        last_write: u64,
        tth: TthValue,
    ) -> FilePtr {
        let file = Arc::new(FileNode {
            name,
            size,
            last_write,
            tth,
            parent: Arc::downgrade(parent),
        });
        parent
            .files
            .write()
            .insert(file.name.lower().to_string(), Arc::clone(&file));
        file
    }

    /// Root descriptor, present only at root nodes.
    #[must_use]
    pub fn root(&self) -> Option<&Arc<ShareRoot>> {
        self.root.as_ref()
    }

    /// Parent node; `None` at roots.
    #[must_use]
    pub fn parent(&self) -> Option<DirPtr> {
        self.parent.upgrade()
    }

    /// Walk up to the owning root descriptor.
    #[must_use]
    pub fn find_root(self: &Arc<Self>) -> Option<Arc<ShareRoot>> {
        let mut current = Arc::clone(self);
        loop {
            if let Some(root) = &current.root {
                return Some(Arc::clone(root));
            }
            current = current.parent.upgrade()?;
        }
    }

    /// Is this directory visible to `profile`?
    #[must_use]
    pub fn has_profile(self: &Arc<Self>, profile: ProfileToken) -> bool {
        self.find_root().is_some_and(|r| r.has_profile(profile))
    }

    /// Last-modified time, unix seconds.
    #[must_use]
    pub fn last_write(&self) -> u64 {
        self.last_write.load(Ordering::Relaxed)
    }

    /// Update the last-modified time.
    pub fn set_last_write(&self, value: u64) {
        self.last_write.store(value, Ordering::Relaxed);
    }

    /// Real filesystem path of this node.
    #[must_use]
    pub fn real_path(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.path.clone();
        }
        match self.parent() {
            Some(p) => p.real_path().join(self.name.original()),
            None => PathBuf::from(self.name.original()),
        }
    }

    /// Virtual ADC path, with leading and trailing separators.
    #[must_use]
    pub fn adc_path(&self) -> String {
        let mut segments = vec![self.name.original().to_string()];
        let mut current = self.parent();
        while let Some(dir) = current {
            segments.push(dir.name.original().to_string());
            current = dir.parent();
        }
        let mut out = String::new();
        for segment in segments.iter().rev() {
            out.push(ADC_SEPARATOR);
            out.push_str(segment);
        }
        out.push(ADC_SEPARATOR);
        out
    }

    /// Snapshot of child directories, ordered by lower name.
    #[must_use]
    pub fn directories(&self) -> Vec<DirPtr> {
        self.children.read().values().cloned().collect()
    }

    /// Snapshot of files, ordered by lower name.
    #[must_use]
    pub fn file_list(&self) -> Vec<FilePtr> {
        self.files.read().values().cloned().collect()
    }

    /// Child directory by lower name.
    #[must_use]
    pub fn child_lower(&self, name_lower: &str) -> Option<DirPtr> {
        self.children.read().get(name_lower).cloned()
    }

    /// File by lower name.
    #[must_use]
    pub fn file_lower(&self, name_lower: &str) -> Option<FilePtr> {
        self.files.read().get(name_lower).cloned()
    }

    /// Sum of file sizes in this directory only.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.files.read().values().map(|f| f.size).sum()
    }

    /// Recursive totals: `(bytes, file count, directory count)`.
    #[must_use]
    pub fn totals(&self) -> (u64, u64, u64) {
        let mut bytes = self.size();
        let mut files = self.files.read().len() as u64;
        let mut dirs = 0u64;
        for child in self.directories() {
            let (b, f, d) = child.totals();
            bytes += b;
            files += f;
            dirs += d + 1;
        }
        (bytes, files, dirs)
    }
}

/// One search hit.
pub enum SearchItem {
    /// A matched directory
    Directory(DirPtr),
    /// A matched file
    File(FilePtr),
}

/// A scored search hit.
pub struct SearchResult {
    /// What matched.
    pub item: SearchItem,
    /// Normalized relevance in `0..=1`.
    pub score: f64,
}

impl SearchResult {
    /// Virtual path of the hit.
    #[must_use]
    pub fn adc_path(&self) -> String {
        match &self.item {
            SearchItem::Directory(d) => d.adc_path(),
            SearchItem::File(f) => f.adc_path(),
        }
    }
}

struct TreeInner {
    /// Lower real path → root node.
    roots: BTreeMap<String, DirPtr>,
    /// Lower directory name → nodes carrying it.
    dir_names: HashMap<String, Vec<DirPtr>>,
    /// TTH → files.
    tth_index: HashMap<TthValue, Vec<FilePtr>>,
    bloom: ShareBloom,
    shared_bytes: u64,
    total_files: u64,
}

/// The share forest.
pub struct ShareTree {
    inner: RwLock<TreeInner>,
    revision: AtomicU64,
}

impl Default for ShareTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareTree {
    /// Empty forest.
    #[must_use]
    pub fn new() -> Self {
        ShareTree {
            inner: RwLock::new(TreeInner {
                roots: BTreeMap::new(),
                dir_names: HashMap::new(),
                tth_index: HashMap::new(),
                bloom: ShareBloom::new(SHARE_BLOOM_BITS),
                shared_bytes: 0,
                total_files: 0,
            }),
            revision: AtomicU64::new(0),
        }
    }

    /// Monotonic revision, bumped on every mutation. List caches key on it.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Mount a new root with an empty directory node.
    ///
    /// # Errors
    ///
    /// Rejects duplicate paths and roots nested inside (or wrapping) an
    /// existing root.
    pub fn add_root(&self, root: Arc<ShareRoot>, last_write: u64) -> Result<DirPtr, ShareError> {
        let mut inner = self.inner.write();
        let key = root.path_lower.clone();
        for existing in inner.roots.keys() {
            if existing == &key || key.starts_with(existing.as_str()) || existing.starts_with(&key)
            {
                return Err(ShareError::InvalidRoot {
                    path: root.path.clone(),
                    message: format!("conflicts with mounted root {existing}"),
                });
            }
        }
        let dir = Directory::new_root(root, last_write);
        Self::index_subtree(&mut inner, &dir);
        inner.roots.insert(key, Arc::clone(&dir));
        drop(inner);
        self.bump();
        Ok(dir)
    }

    /// Unmount a root, dropping its whole subtree from the indices.
    pub fn remove_root(&self, real_path: &Path) -> Result<(), ShareError> {
        let key = real_path.to_string_lossy().to_lowercase();
        let mut inner = self.inner.write();
        let dir = inner
            .roots
            .remove(&key)
            .ok_or_else(|| ShareError::InvalidRoot {
                path: real_path.to_path_buf(),
                message: "not mounted".into(),
            })?;
        Self::unindex_subtree(&mut inner, &dir);
        drop(inner);
        self.bump();
        Ok(())
    }

    /// Snapshot of all root nodes.
    #[must_use]
    pub fn roots(&self) -> Vec<DirPtr> {
        self.inner.read().roots.values().cloned().collect()
    }

    /// Root nodes visible to `profile`.
    #[must_use]
    pub fn roots_for_profile(&self, profile: ProfileToken) -> Vec<DirPtr> {
        self.inner
            .read()
            .roots
            .values()
            .filter(|d| d.root().is_some_and(|r| r.has_profile(profile)))
            .cloned()
            .collect()
    }

    /// Replace a whole root subtree (full-root refresh splice). The new
    /// node must carry the same root path as the old one.
    pub fn replace_root_subtree(&self, fresh: DirPtr) -> Result<(), ShareError> {
        let root = fresh.root().ok_or_else(|| ShareError::InvalidRoot {
            path: fresh.real_path(),
            message: "subtree has no root descriptor".into(),
        })?;
        let key = root.path_lower.clone();

        let mut inner = self.inner.write();
        if let Some(old) = inner.roots.remove(&key) {
            Self::unindex_subtree(&mut inner, &old);
        }
        Self::index_subtree(&mut inner, &fresh);
        inner.roots.insert(key, fresh);
        drop(inner);
        self.bump();
        Ok(())
    }

    /// Replace one subdirectory of an existing tree (partial refresh
    /// splice). `fresh` must already have its parent pointer set to the
    /// node currently in the tree.
    pub fn replace_subdirectory(&self, fresh: DirPtr) -> Result<(), ShareError> {
        let parent = fresh.parent().ok_or_else(|| ShareError::InvalidRoot {
            path: fresh.real_path(),
            message: "subtree parent is gone".into(),
        })?;

        let mut inner = self.inner.write();
        let old = parent.children.read().get(fresh.name.lower()).cloned();
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, &fresh) {
                Self::unindex_subtree(&mut inner, &old);
            }
        }
        parent
            .children
            .write()
            .insert(fresh.name.lower().to_string(), Arc::clone(&fresh));
        Self::index_subtree(&mut inner, &fresh);
        drop(inner);
        self.bump();
        Ok(())
    }

    /// Insert one freshly hashed file into an already-indexed directory.
    pub fn add_hashed_file(
        &self,
        parent: &DirPtr,
        name: DualString,
        size: u64,
        last_write: u64,
        tth: TthValue,
    ) -> FilePtr {
        let mut inner = self.inner.write();
        if let Some(old) = parent.files.read().get(name.lower()).cloned() {
            Self::unindex_file(&mut inner, &old);
        }
        let file = Directory::add_file(parent, name, size, last_write, tth);
        Self::index_file(&mut inner, &file);
        drop(inner);
        self.bump();
        file
    }

    fn index_file(inner: &mut TreeInner, file: &FilePtr) {
        inner
            .tth_index
            .entry(file.tth)
            .or_default()
            .push(Arc::clone(file));
        inner.bloom.add_name(file.name.lower());
        inner.shared_bytes += file.size;
        inner.total_files += 1;
    }

    fn unindex_file(inner: &mut TreeInner, file: &FilePtr) {
        if let Some(list) = inner.tth_index.get_mut(&file.tth) {
            list.retain(|f| !Arc::ptr_eq(f, file));
            if list.is_empty() {
                inner.tth_index.remove(&file.tth);
            }
        }
        inner.shared_bytes = inner.shared_bytes.saturating_sub(file.size);
        inner.total_files = inner.total_files.saturating_sub(1);
        // Bloom bits are left set; only a full rebuild clears them.
    }

    fn index_subtree(inner: &mut TreeInner, dir: &DirPtr) {
        inner
            .dir_names
            .entry(dir.name.lower().to_string())
            .or_default()
            .push(Arc::clone(dir));
        inner.bloom.add_name(dir.name.lower());
        for file in dir.file_list() {
            Self::index_file(inner, &file);
        }
        for child in dir.directories() {
            Self::index_subtree(inner, &child);
        }
    }

    fn unindex_subtree(inner: &mut TreeInner, dir: &DirPtr) {
        if let Some(list) = inner.dir_names.get_mut(dir.name.lower()) {
            list.retain(|d| !Arc::ptr_eq(d, dir));
            if list.is_empty() {
                inner.dir_names.remove(dir.name.lower());
            }
        }
        for file in dir.file_list() {
            Self::unindex_file(inner, &file);
        }
        for child in dir.directories() {
            Self::unindex_subtree(inner, &child);
        }
    }

    /// Rebuild the bloom filter from every indexed name. Used by full
    /// refreshes, which are the only operation allowed to clear bits.
    pub fn rebuild_bloom(&self) {
        let mut inner = self.inner.write();
        inner.bloom.reset();
        let roots: Vec<DirPtr> = inner.roots.values().cloned().collect();
        for root in roots {
            Self::bloom_subtree(&mut inner.bloom, &root);
        }
    }

    fn bloom_subtree(bloom: &mut ShareBloom, dir: &DirPtr) {
        bloom.add_name(dir.name.lower());
        for file in dir.file_list() {
            bloom.add_name(file.name.lower());
        }
        for child in dir.directories() {
            Self::bloom_subtree(bloom, &child);
        }
    }

    /// Extend the bloom filter with extra names (queued bundle files).
    pub fn extend_bloom(&self, names_lower: &[String]) {
        let mut inner = self.inner.write();
        for name in names_lower {
            inner.bloom.add_name(name);
        }
    }

    /// Bloom membership for a lower-cased token.
    #[must_use]
    pub fn bloom_contains(&self, token_lower: &str) -> bool {
        self.inner.read().bloom.contains(token_lower)
    }

    /// Total shared bytes and files across all roots.
    #[must_use]
    pub fn total_stats(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (inner.shared_bytes, inner.total_files)
    }

    /// Shared bytes and files visible to one profile, computed on demand.
    #[must_use]
    pub fn profile_stats(&self, profile: ProfileToken) -> (u64, u64) {
        let mut bytes = 0;
        let mut files = 0;
        for root in self.roots_for_profile(profile) {
            let (b, f, _) = root.totals();
            bytes += b;
            files += f;
        }
        (bytes, files)
    }

    /// Find the tree node owning a real filesystem path.
    #[must_use]
    pub fn find_directory(&self, real_path: &Path) -> Option<DirPtr> {
        let lookup = real_path.to_string_lossy().to_lowercase();
        let inner = self.inner.read();
        let (root_key, root_dir) = inner
            .roots
            .iter()
            .find(|(key, _)| lookup == **key || lookup.starts_with(&format!("{key}/")))?;

        let mut current = Arc::clone(root_dir);
        if lookup == *root_key {
            return Some(current);
        }
        let remainder = lookup[root_key.len()..].trim_matches('/');
        for segment in remainder.split('/') {
            current = current.child_lower(segment)?;
        }
        Some(current)
    }

    /// Resolve a virtual ADC directory path for one profile.
    ///
    /// # Errors
    ///
    /// `FileNotAvailable` when no visible directory matches.
    pub fn resolve_virtual(
        &self,
        adc_path: &str,
        profile: ProfileToken,
    ) -> Result<DirPtr, ShareError> {
        let segments: Vec<&str> = adc_path.split(ADC_SEPARATOR).filter(|s| !s.is_empty()).collect();
        let not_found = || ShareError::FileNotAvailable(adc_path.to_string());
        let first = segments.first().ok_or_else(not_found)?;
        let first_lower = first.to_lowercase();

        for root in self.roots_for_profile(profile) {
            if root.name.lower() != first_lower {
                continue;
            }
            let mut current = root;
            let mut ok = true;
            for segment in &segments[1..] {
                match current.child_lower(&segment.to_lowercase()) {
                    Some(next) => current = next,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                return Ok(current);
            }
        }
        Err(not_found())
    }

    /// Resolve a virtual file path against a set of profiles, returning
    /// the file and its size.
    ///
    /// # Errors
    ///
    /// `FileAccessDenied` when the path exists but only under roots none
    /// of `profiles` may see; `FileNotAvailable` otherwise.
    pub fn resolve_file(
        &self,
        virtual_file: &str,
        profiles: &BTreeSet<ProfileToken>,
    ) -> Result<FilePtr, ShareError> {
        let (dir_part, file_part) = match virtual_file.rfind(ADC_SEPARATOR) {
            Some(idx) => (&virtual_file[..=idx], &virtual_file[idx + 1..]),
            None => return Err(ShareError::FileNotAvailable(virtual_file.to_string())),
        };
        if file_part.is_empty() {
            return Err(ShareError::FileNotAvailable(virtual_file.to_string()));
        }
        let file_lower = file_part.to_lowercase();

        let mut denied = false;
        let segments: Vec<String> = dir_part
            .split(ADC_SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect();
        let first = match segments.first() {
            Some(f) => f.clone(),
            None => return Err(ShareError::FileNotAvailable(virtual_file.to_string())),
        };

        for root in self.roots() {
            if root.name.lower() != first {
                continue;
            }
            let mut current = Arc::clone(&root);
            let mut ok = true;
            for segment in &segments[1..] {
                match current.child_lower(segment) {
                    Some(next) => current = next,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }
            if let Some(file) = current.file_lower(&file_lower) {
                let visible = root
                    .root()
                    .is_some_and(|r| profiles.iter().any(|p| r.has_profile(*p)));
                if visible {
                    return Ok(file);
                }
                denied = true;
            }
        }

        if denied {
            Err(ShareError::FileAccessDenied(virtual_file.to_string()))
        } else {
            Err(ShareError::FileNotAvailable(virtual_file.to_string()))
        }
    }

    /// Files sharing a TTH, optionally restricted to a profile set.
    #[must_use]
    pub fn files_by_tth(
        &self,
        tth: &TthValue,
        profiles: Option<&BTreeSet<ProfileToken>>,
    ) -> Vec<FilePtr> {
        let inner = self.inner.read();
        let Some(files) = inner.tth_index.get(tth) else {
            return Vec::new();
        };
        files
            .iter()
            .filter(|f| match profiles {
                None => true,
                Some(set) => f
                    .parent()
                    .and_then(|d| d.find_root())
                    .is_some_and(|r| set.iter().any(|p| r.has_profile(*p))),
            })
            .cloned()
            .collect()
    }

    /// Directories carrying a lower-cased name (the ADC partial-path
    /// resolution index).
    #[must_use]
    pub fn directories_by_name(&self, name_lower: &str) -> Vec<DirPtr> {
        self.inner
            .read()
            .dir_names
            .get(name_lower)
            .cloned()
            .unwrap_or_default()
    }

    /// Build a `GET blom` response: a [`HashBloom`] with the requested
    /// geometry filled with every TTH visible to `profile`.
    ///
    /// # Errors
    ///
    /// Propagates geometry rejections from [`HashBloom::new`].
    pub fn build_hash_bloom(
        &self,
        k: u64,
        m_bits: u64,
        h: u64,
        profile: ProfileToken,
    ) -> Result<Vec<u8>, ShareError> {
        let (_, file_count) = self.profile_stats(profile);
        let mut bloom = HashBloom::new(k, m_bits, h, file_count)?;
        let inner = self.inner.read();
        for (tth, files) in &inner.tth_index {
            let visible = files.iter().any(|f| {
                f.parent()
                    .and_then(|d| d.find_root())
                    .is_some_and(|r| r.has_profile(profile))
            });
            if visible {
                bloom.add(tth);
            }
        }
        Ok(bloom.into_bytes())
    }

    /// Search the tree for `query` within one profile.
    ///
    /// Results are scored, sorted best-first and capped at the query's
    /// `max_results` (when non-zero).
    #[must_use]
    pub fn search(&self, query: &mut SearchQuery, profile: ProfileToken) -> Vec<SearchResult> {
        let mut results = Vec::new();

        if let Some(root) = query.root {
            for file in self.files_by_tth(&root, None) {
                let visible = file
                    .parent()
                    .and_then(|d| d.find_root())
                    .is_some_and(|r| r.has_profile(profile));
                if visible {
                    results.push(SearchResult {
                        item: SearchItem::File(file),
                        score: 1.0,
                    });
                }
            }
            return results;
        }

        let limit = query.max_results;
        for root in self.roots_for_profile(profile) {
            Self::search_dir(&root, query, 0, limit, &mut results);
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if limit > 0 {
            results.truncate(limit);
        }
        results
    }

    fn search_dir(
        dir: &DirPtr,
        query: &mut SearchQuery,
        level: u32,
        limit: usize,
        results: &mut Vec<SearchResult>,
    ) {
        if limit > 0 && results.len() >= limit {
            return;
        }
        if query.is_excluded_lower(dir.name.lower()) {
            return;
        }

        let mut saved = None;
        let mut opened = false;
        if query.matches_any_directory_lower(dir.name.lower()) {
            let complete_here = query.last_positions().iter().all(Option::is_some);
            if query.positions_complete()
                && query.item_type != ItemType::File
                && query.gt == 0
                && query.matches_date(dir.last_write())
            {
                let score = relevance_score(query, level, true, dir.name.lower());
                results.push(SearchResult {
                    item: SearchItem::Directory(Arc::clone(dir)),
                    score,
                });
            }
            if !complete_here {
                saved = query.open_recursion(dir.name.lower());
                opened = true;
            }
        }

        let descending = query.recursion.is_some();
        if descending {
            query.enter_level(dir.name.len());
        }

        if query.item_type != ItemType::Directory {
            for file in dir.file_list() {
                if limit > 0 && results.len() >= limit {
                    break;
                }
                if query.matches_file_lower(file.name.lower(), file.size as i64, file.last_write)
                {
                    let score = relevance_score(query, level + 1, false, file.name.lower());
                    results.push(SearchResult {
                        item: SearchItem::File(file),
                        score,
                    });
                }
            }
        }

        for child in dir.directories() {
            Self::search_dir(&child, query, level + 1, limit, results);
        }

        if descending {
            query.leave_level(dir.name.len());
        }
        if opened {
            query.restore_recursion(saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::tth::hash_buffer;
    use adcx_search::query::MatchType;

    fn tth(seed: u8) -> TthValue {
        hash_buffer(&[seed; 64]).root
    }

    fn build_tree() -> (ShareTree, DirPtr) {
        let tree = ShareTree::new();
        let root = Arc::new(ShareRoot::new(
            PathBuf::from("/mnt/media"),
            "Media",
            [0].into_iter().collect(),
            false,
        ));
        let dir = Directory::new_root(root, 1000);
        let linux = Directory::new_child(&dir, DualString::new("Linux ISOs"), 1100);
        let _ = Directory::add_file(
            &linux,
            DualString::new("ubuntu-22.04.iso"),
            700,
            1200,
            tth(1),
        );
        let music = Directory::new_child(&dir, DualString::new("Music"), 1300);
        let _ = Directory::add_file(&music, DualString::new("track01.flac"), 50, 1400, tth(2));
        tree.replace_root_subtree(Arc::clone(&dir)).unwrap();
        (tree, dir)
    }

    #[test]
    fn real_and_virtual_paths() {
        let (_tree, root) = build_tree();
        let linux = root.child_lower("linux isos").unwrap();
        let file = linux.file_lower("ubuntu-22.04.iso").unwrap();
        assert_eq!(file.real_path(), PathBuf::from("/mnt/media/Linux ISOs/ubuntu-22.04.iso"));
        assert_eq!(file.adc_path(), "/Media/Linux ISOs/ubuntu-22.04.iso");
        assert_eq!(linux.adc_path(), "/Media/Linux ISOs/");
    }

    #[test]
    fn tth_index_and_profiles() {
        let (tree, _root) = build_tree();
        let all: BTreeSet<ProfileToken> = [0].into_iter().collect();
        let wrong: BTreeSet<ProfileToken> = [9].into_iter().collect();

        assert_eq!(tree.files_by_tth(&tth(1), Some(&all)).len(), 1);
        assert_eq!(tree.files_by_tth(&tth(1), Some(&wrong)).len(), 0);
        assert_eq!(tree.files_by_tth(&tth(9), None).len(), 0);
    }

    #[test]
    fn resolve_file_distinguishes_denied() {
        let (tree, _root) = build_tree();
        let ok: BTreeSet<ProfileToken> = [0].into_iter().collect();
        let wrong: BTreeSet<ProfileToken> = [9].into_iter().collect();

        let file = tree.resolve_file("/Media/Linux ISOs/ubuntu-22.04.iso", &ok).unwrap();
        assert_eq!(file.size, 700);

        let denied = tree.resolve_file("/Media/Linux ISOs/ubuntu-22.04.iso", &wrong);
        assert!(matches!(denied, Err(ShareError::FileAccessDenied(_))));

        let missing = tree.resolve_file("/Media/nope/file.bin", &ok);
        assert!(matches!(missing, Err(ShareError::FileNotAvailable(_))));
    }

    #[test]
    fn find_directory_by_real_path() {
        let (tree, _root) = build_tree();
        let dir = tree.find_directory(Path::new("/mnt/media/Linux ISOs")).unwrap();
        assert_eq!(dir.name.original(), "Linux ISOs");
        assert!(tree.find_directory(Path::new("/mnt/other")).is_none());
    }

    #[test]
    fn bloom_superset_of_names() {
        let (tree, _root) = build_tree();
        for token in ["media", "linux isos", "ubuntu-22.04.iso", "music", "track01.flac"] {
            assert!(tree.bloom_contains(token), "missing {token}");
        }
    }

    #[test]
    fn totals_and_profile_stats() {
        let (tree, root) = build_tree();
        let (bytes, files, dirs) = root.totals();
        assert_eq!((bytes, files, dirs), (750, 2, 2));
        assert_eq!(tree.profile_stats(0), (750, 2));
        assert_eq!(tree.profile_stats(7), (0, 0));
    }

    #[test]
    fn search_finds_files_with_ancestor_terms() {
        let (tree, _root) = build_tree();
        let mut q = SearchQuery::from_text("linux ubuntu", &[], &[], MatchType::PathPartial);
        q.max_results = 10;
        let results = tree.search(&mut q, 0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].adc_path(), "/Media/Linux ISOs/ubuntu-22.04.iso");
    }

    #[test]
    fn search_respects_profile() {
        let (tree, _root) = build_tree();
        let mut q = SearchQuery::from_text("ubuntu", &[], &[], MatchType::PathPartial);
        q.max_results = 10;
        assert!(tree.search(&mut q, 4).is_empty());
    }

    #[test]
    fn search_monotonicity() {
        let (tree, _root) = build_tree();
        let mut narrow = SearchQuery::from_text("ubuntu missing-term", &[], &[], MatchType::PathPartial);
        narrow.max_results = 10;
        let mut broad = SearchQuery::from_text("ubuntu", &[], &[], MatchType::PathPartial);
        broad.max_results = 10;
        assert!(tree.search(&mut narrow, 0).len() <= tree.search(&mut broad, 0).len());
    }

    #[test]
    fn replace_subtree_updates_indices() {
        let (tree, root) = build_tree();
        assert_eq!(tree.total_stats(), (750, 2));

        // Rebuild the Linux subtree with a different file.
        let fresh = Directory::new_detached(&root, DualString::new("Linux ISOs"), 2000);
        let _ = Directory::add_file(
            &fresh,
            DualString::new("debian-12.iso"),
            300,
            2100,
            tth(3),
        );
        tree.replace_subdirectory(Arc::clone(&fresh)).unwrap();

        assert_eq!(tree.total_stats(), (350, 2));
        assert!(tree.files_by_tth(&tth(1), None).is_empty());
        assert_eq!(tree.files_by_tth(&tth(3), None).len(), 1);
    }

    #[test]
    fn overlapping_roots_rejected() {
        let (tree, _root) = build_tree();
        let nested = Arc::new(ShareRoot::new(
            PathBuf::from("/mnt/media/Linux ISOs"),
            "Nested",
            [0].into_iter().collect(),
            false,
        ));
        assert!(matches!(
            tree.add_root(nested, 0),
            Err(ShareError::InvalidRoot { .. })
        ));
    }
}

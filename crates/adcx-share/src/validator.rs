//! Admission control for the refresh walk.
//!
//! Each filesystem entry passes through the validator before it may enter
//! the tree: skiplist matches (glob or regex), user-configured excluded
//! paths, names sitting in an unhashed download queue, and external hook
//! vetoes all reject the entry.

use crate::error::ShareError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;

/// How the skiplist string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkiplistMode {
    /// `;`-separated glob patterns
    #[default]
    Glob,
    /// One regular expression
    Regex,
}

enum Skiplist {
    Globs(GlobSet),
    Pattern(Regex),
    Empty,
}

/// External veto callback consulted for every new path.
pub type ValidationHook = Box<dyn Fn(&Path, bool) -> bool + Send + Sync>;

/// Validates paths offered to the share.
pub struct ShareValidator {
    skiplist: RwLock<Skiplist>,
    excluded: RwLock<BTreeSet<String>>,
    unhashed_queue: RwLock<BTreeSet<String>>,
    hooks: RwLock<Vec<ValidationHook>>,
}

impl Default for ShareValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareValidator {
    /// Validator with an empty skiplist and no excludes.
    #[must_use]
    pub fn new() -> Self {
        ShareValidator {
            skiplist: RwLock::new(Skiplist::Empty),
            excluded: RwLock::new(BTreeSet::new()),
            unhashed_queue: RwLock::new(BTreeSet::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Install the skiplist from settings.
    ///
    /// # Errors
    ///
    /// `RefreshRejected` when a glob or the regex fails to compile.
    pub fn set_skiplist(&self, pattern: &str, mode: SkiplistMode) -> Result<(), ShareError> {
        let compiled = if pattern.is_empty() {
            Skiplist::Empty
        } else {
            match mode {
                SkiplistMode::Glob => {
                    let mut builder = GlobSetBuilder::new();
                    for part in pattern.split(';').filter(|p| !p.is_empty()) {
                        let glob = Glob::new(part).map_err(|e| {
                            ShareError::RefreshRejected(format!("bad skiplist glob {part:?}: {e}"))
                        })?;
                        builder.add(glob);
                    }
                    Skiplist::Globs(builder.build().map_err(|e| {
                        ShareError::RefreshRejected(format!("skiplist build failed: {e}"))
                    })?)
                }
                SkiplistMode::Regex => Skiplist::Pattern(Regex::new(pattern).map_err(|e| {
                    ShareError::RefreshRejected(format!("bad skiplist regex: {e}"))
                })?),
            }
        };
        *self.skiplist.write() = compiled;
        Ok(())
    }

    /// Add a path no refresh may descend into.
    pub fn add_excluded(&self, path: &Path) {
        self.excluded
            .write()
            .insert(path.to_string_lossy().to_lowercase());
    }

    /// Remove an excluded path.
    pub fn remove_excluded(&self, path: &Path) {
        self.excluded
            .write()
            .remove(&path.to_string_lossy().to_lowercase());
    }

    /// Snapshot of excluded paths.
    #[must_use]
    pub fn excluded_paths(&self) -> BTreeSet<String> {
        self.excluded.read().clone()
    }

    /// Track a queued download that has not been hashed yet; its name is
    /// rejected until [`clear_unhashed`](Self::clear_unhashed).
    pub fn add_unhashed(&self, path_lower: &str) {
        self.unhashed_queue.write().insert(path_lower.to_string());
    }

    /// The queued file finished hashing (or left the queue).
    pub fn clear_unhashed(&self, path_lower: &str) {
        self.unhashed_queue.write().remove(path_lower);
    }

    /// Register an external veto hook. The hook receives the real path and
    /// whether it is a directory; returning false rejects the entry.
    pub fn add_hook(&self, hook: ValidationHook) {
        self.hooks.write().push(hook);
    }

    fn skiplist_matches(&self, name: &str) -> bool {
        match &*self.skiplist.read() {
            Skiplist::Globs(set) => set.is_match(name),
            Skiplist::Pattern(re) => re.is_match(name),
            Skiplist::Empty => false,
        }
    }

    /// Validate one directory entry.
    ///
    /// # Errors
    ///
    /// `RefreshRejected` naming the failed check.
    pub fn validate(&self, path: &Path, name: &str, is_directory: bool) -> Result<(), ShareError> {
        if self.skiplist_matches(name) {
            return Err(ShareError::RefreshRejected(format!(
                "{name:?} matches the skiplist"
            )));
        }

        let path_lower = path.to_string_lossy().to_lowercase();
        {
            let excluded = self.excluded.read();
            if excluded
                .iter()
                .any(|e| path_lower == *e || path_lower.starts_with(&format!("{e}/")))
            {
                return Err(ShareError::RefreshRejected(format!(
                    "{} is excluded from share",
                    path.display()
                )));
            }
        }

        if !is_directory && self.unhashed_queue.read().contains(&path_lower) {
            return Err(ShareError::RefreshRejected(format!(
                "{} is queued and not hashed yet",
                path.display()
            )));
        }

        for hook in self.hooks.read().iter() {
            if !hook(path, is_directory) {
                return Err(ShareError::RefreshRejected(format!(
                    "{} vetoed by hook",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn skiplist_glob() {
        let v = ShareValidator::new();
        v.set_skiplist("*.tmp;Thumbs.db", SkiplistMode::Glob).unwrap();
        assert!(v.validate(Path::new("/s/x.tmp"), "x.tmp", false).is_err());
        assert!(v.validate(Path::new("/s/Thumbs.db"), "Thumbs.db", false).is_err());
        assert!(v.validate(Path::new("/s/x.iso"), "x.iso", false).is_ok());
    }

    #[test]
    fn skiplist_regex() {
        let v = ShareValidator::new();
        v.set_skiplist(r"^~.*", SkiplistMode::Regex).unwrap();
        assert!(v.validate(Path::new("/s/~lock"), "~lock", false).is_err());
        assert!(v.validate(Path::new("/s/data"), "data", false).is_ok());
        assert!(v.set_skiplist("(unclosed", SkiplistMode::Regex).is_err());
    }

    #[test]
    fn excluded_paths_cover_subtrees() {
        let v = ShareValidator::new();
        v.add_excluded(&PathBuf::from("/s/Private"));
        assert!(v.validate(Path::new("/s/private"), "private", true).is_err());
        assert!(v.validate(Path::new("/s/Private/inner.txt"), "inner.txt", false).is_err());
        assert!(v.validate(Path::new("/s/Public"), "Public", true).is_ok());

        v.remove_excluded(&PathBuf::from("/s/Private"));
        assert!(v.validate(Path::new("/s/private"), "private", true).is_ok());
    }

    #[test]
    fn unhashed_queue_blocks_files_only() {
        let v = ShareValidator::new();
        v.add_unhashed("/s/partial.bin");
        assert!(v.validate(Path::new("/s/partial.bin"), "partial.bin", false).is_err());
        v.clear_unhashed("/s/partial.bin");
        assert!(v.validate(Path::new("/s/partial.bin"), "partial.bin", false).is_ok());
    }

    #[test]
    fn hooks_can_veto() {
        let v = ShareValidator::new();
        v.add_hook(Box::new(|path, _| {
            !path.to_string_lossy().contains("secret")
        }));
        assert!(v.validate(Path::new("/s/secret/f"), "f", false).is_err());
        assert!(v.validate(Path::new("/s/open/f"), "f", false).is_ok());
    }
}

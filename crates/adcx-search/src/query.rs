//! Parsed search queries and per-name matching state.
//!
//! A query is either a bare TTH lookup or a textual search: ordered include
//! terms, exclude terms, extension sets, size/date ranges, an item-type
//! filter and a name-match mode. Matching is stateful: the most recent
//! name's term positions are kept so that scoring and ancestor-directory
//! recursion can read them.

use crate::string_search::StringSearch;
use crate::{is_separator, parse_search_terms};
use adcx_proto::extensions::expand_groups;
use adcx_proto::TthValue;

/// How include terms bind to candidate names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MatchType {
    /// Terms may match anywhere along the virtual path.
    #[default]
    PathPartial = 0,
    /// Terms must all match the item name itself.
    NamePartial = 1,
    /// The (single) term must equal the item name.
    NameExact = 2,
}

impl MatchType {
    /// Decode the `MT` parameter value.
    #[must_use]
    pub fn from_param(value: &str) -> Self {
        match value {
            "1" => MatchType::NamePartial,
            "2" => MatchType::NameExact,
            _ => MatchType::PathPartial,
        }
    }
}

/// What kind of item the query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemType {
    /// Files and directories
    #[default]
    Any,
    /// Files only
    File,
    /// Directories only
    Directory,
}

/// Size predicate of a textual search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeMode {
    /// No size restriction
    #[default]
    DontCare,
    /// `size >= n`
    AtLeast,
    /// `size <= n`
    AtMost,
    /// `size == n`
    Exact,
}

/// Positions of ancestor-directory matches carried down a tree walk.
///
/// When include terms match partially in a directory name, the walk opens a
/// recursion frame so the remaining terms may complete in descendant names.
/// Point values (boundary bonuses) ride along for scoring.
#[derive(Debug, Clone, Default)]
pub struct Recursion {
    /// Total name length of the levels between the first matching ancestor
    /// and the current item.
    pub depth_len: usize,
    /// Number of levels between the first matching ancestor and the item.
    pub level: u32,
    /// Per-term `(position, points)`; `None` where unmatched so far.
    pub positions: Vec<(Option<usize>, i32)>,
}

impl Recursion {
    /// Do the stored positions fill every hole in `positions`?
    #[must_use]
    pub fn completes(&self, positions: &[Option<usize>]) -> bool {
        self.positions
            .iter()
            .zip(positions)
            .all(|((stored, _), current)| stored.is_some() || current.is_some())
    }

    /// Are all stored positions filled?
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.positions.iter().all(|(p, _)| p.is_some())
    }

    /// Merge parent positions into `merge_to` where it has holes.
    /// Returns true when anything from the parent was needed.
    pub fn merge(merge_to: &mut [(Option<usize>, i32)], parent: &Recursion) -> bool {
        let mut used = false;
        for (target, source) in merge_to.iter_mut().zip(&parent.positions) {
            if target.0.is_none() && source.0.is_some() {
                *target = *source;
                used = true;
            }
        }
        used
    }
}

/// A parsed search query plus the matching state of the last scanned name.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Terms that must all occur.
    pub include: StringSearch,
    /// Terms that must not occur.
    pub exclude: StringSearch,
    /// Accepted extensions (lower-cased); empty accepts everything.
    pub ext: Vec<String>,
    /// Extensions subtracted from `ext` on first use (`RX` parameters).
    pub no_ext: Vec<String>,
    /// Minimum size (inclusive).
    pub gt: i64,
    /// Maximum size (inclusive).
    pub lt: i64,
    /// Minimum last-modified time (unix).
    pub min_date: u64,
    /// Maximum last-modified time (unix).
    pub max_date: u64,
    /// TTH lookup; when set, all textual predicates are ignored.
    pub root: Option<TthValue>,
    /// Stop after this many results (0 = unlimited).
    pub max_results: usize,
    /// Name binding mode.
    pub match_type: MatchType,
    /// Include parent directories of matched files in responses.
    pub add_parents: bool,
    /// Item-type filter.
    pub item_type: ItemType,
    /// Active ancestor-match frame during a tree walk.
    pub recursion: Option<Recursion>,

    last_positions: Vec<Option<usize>>,
    last_matches: usize,
}

impl SearchQuery {
    /// Build from a plain text query plus explicit predicates.
    #[must_use]
    pub fn from_text(
        query: &str,
        excluded: &[String],
        extensions: &[String],
        match_type: MatchType,
    ) -> Self {
        let mut q = SearchQuery {
            match_type,
            ..Default::default()
        };
        for term in parse_search_terms(query) {
            q.include.add(&term);
        }
        for term in excluded {
            q.exclude.add(term);
        }
        q.ext = extensions.iter().map(|e| e.to_lowercase()).collect();
        q.prepare();
        q
    }

    /// Build a TTH lookup.
    #[must_use]
    pub fn from_tth(root: TthValue) -> Self {
        SearchQuery {
            root: Some(root),
            ..Default::default()
        }
    }

    /// Build from the legacy `$`-separated text form.
    #[must_use]
    pub fn from_delimited(
        text: &str,
        size_mode: SizeMode,
        size: i64,
        group_mask: u8,
        max_results: usize,
    ) -> Self {
        if let Some(tth) = text.strip_prefix("TTH:") {
            if let Ok(root) = tth.parse::<TthValue>() {
                return SearchQuery {
                    root: Some(root),
                    max_results,
                    ..Default::default()
                };
            }
        }

        let mut q = SearchQuery {
            max_results,
            ..Default::default()
        };
        for term in text.split('$').filter(|t| !t.is_empty()) {
            q.include.add(term);
        }
        match size_mode {
            SizeMode::AtLeast => q.gt = size,
            SizeMode::AtMost => q.lt = size,
            SizeMode::Exact => {
                q.gt = size;
                q.lt = size;
            }
            SizeMode::DontCare => {}
        }
        q.ext = expand_groups(group_mask);
        q.prepare();
        q
    }

    /// Build from ADC `SCH` parameters.
    #[must_use]
    pub fn from_adc(params: &[String], max_results: usize) -> Self {
        let mut q = SearchQuery {
            max_results,
            ..Default::default()
        };

        for p in params {
            if p.len() < 2 {
                continue;
            }
            let (key, value) = p.split_at(2);
            match key {
                "TR" => {
                    if let Ok(root) = value.parse::<TthValue>() {
                        q.root = Some(root);
                        return q;
                    }
                }
                "AN" => q.include.add(value),
                "NO" => q.exclude.add(value),
                "EX" => q.ext.push(value.to_lowercase()),
                "GR" => {
                    let mask = value.parse::<u8>().unwrap_or(0);
                    q.ext.extend(expand_groups(mask));
                }
                "RX" => q.no_ext.push(value.to_lowercase()),
                "GE" => q.gt = value.parse().unwrap_or(0),
                "LE" => q.lt = value.parse().unwrap_or(i64::MAX),
                "EQ" => {
                    let v = value.parse().unwrap_or(0);
                    q.gt = v;
                    q.lt = v;
                }
                "TY" => {
                    q.item_type = match value {
                        "1" => ItemType::File,
                        "2" => ItemType::Directory,
                        _ => ItemType::Any,
                    }
                }
                "MT" => q.match_type = MatchType::from_param(value),
                "OT" => q.max_date = value.parse().unwrap_or(u64::MAX),
                "NT" => q.min_date = value.parse().unwrap_or(0),
                "PP" => q.add_parents = value == "1",
                _ => {}
            }
        }

        q.prepare();
        q
    }

    fn prepare(&mut self) {
        if self.lt == 0 {
            self.lt = i64::MAX;
        }
        if self.max_date == 0 {
            self.max_date = u64::MAX;
        }
        self.last_positions = vec![None; self.include.count()];
        self.last_matches = 0;
        if !self.ext.is_empty() {
            self.item_type = ItemType::File;
        }
    }

    /// Term positions from the most recent match.
    #[must_use]
    pub fn last_positions(&self) -> &[Option<usize>] {
        &self.last_positions
    }

    /// Number of terms matched by the most recent scan.
    #[must_use]
    pub fn last_matches(&self) -> usize {
        self.last_matches
    }

    /// `size` within `[gt, lt]`.
    #[must_use]
    pub fn matches_size(&self, size: i64) -> bool {
        size >= self.gt && size <= self.lt
    }

    /// `date` within the configured range (zero dates always pass).
    #[must_use]
    pub fn matches_date(&self, date: u64) -> bool {
        date == 0 || (date >= self.min_date && date <= self.max_date)
    }

    /// True when any exclude term occurs in the lower-cased name.
    #[must_use]
    pub fn is_excluded_lower(&self, name_lower: &str) -> bool {
        self.exclude.match_any_lower(name_lower)
    }

    /// Extension filter. Subtracts `no_ext` from `ext` on first use, then
    /// accepts names ending in any remaining extension.
    pub fn has_ext(&mut self, name_lower: &str) -> bool {
        if self.ext.is_empty() {
            return true;
        }
        if !self.no_ext.is_empty() {
            let no_ext = std::mem::take(&mut self.no_ext);
            self.ext.retain(|e| !no_ext.contains(e));
        }
        self.ext.iter().any(|e| name_lower.ends_with(e.as_str()))
    }

    fn reset_positions(&mut self) {
        if self.last_matches > 0 {
            self.last_positions.iter_mut().for_each(|p| *p = None);
            self.last_matches = 0;
        }
    }

    /// Are all include terms placed, counting active recursion positions?
    #[must_use]
    pub fn positions_complete(&self) -> bool {
        if self.last_positions.iter().all(Option::is_some) {
            return true;
        }
        self.recursion
            .as_ref()
            .is_some_and(|r| r.completes(&self.last_positions))
    }

    /// Match a file by lower-cased name, size and date.
    pub fn matches_file_lower(&mut self, name_lower: &str, size: i64, date: u64) -> bool {
        if !self.matches_date(date) || !self.matches_size(size) {
            return false;
        }

        if self.match_type == MatchType::NameExact
            && self.include.patterns().first().map(String::as_str) != Some(name_lower)
        {
            return false;
        }

        self.reset_positions();
        let partial = self.recursion.is_some();
        self.last_matches =
            self.include
                .match_lower(name_lower, partial, &mut self.last_positions);
        if !self.positions_complete() {
            return false;
        }

        if !self.has_ext(name_lower) {
            return false;
        }

        !self.is_excluded_lower(name_lower)
    }

    /// Match a file including its TTH (used on the response path).
    pub fn matches_file(&mut self, name: &str, size: i64, date: u64, tth: &TthValue) -> bool {
        if self.item_type == ItemType::Directory {
            return false;
        }
        if let Some(root) = &self.root {
            return root == tth;
        }
        self.matches_file_lower(&name.to_lowercase(), size, date)
    }

    /// Partial-match a directory name during a tree walk. Records term
    /// positions; returns true when at least one term matched.
    pub fn matches_any_directory_lower(&mut self, name_lower: &str) -> bool {
        if self.match_type != MatchType::PathPartial && self.item_type == ItemType::File {
            return false;
        }
        self.reset_positions();
        self.last_matches = self
            .include
            .match_lower(name_lower, true, &mut self.last_positions);
        self.last_matches > 0
    }

    /// Strict directory match: every include term occurs in the name.
    #[must_use]
    pub fn matches_directory(&self, name: &str) -> bool {
        if self.item_type == ItemType::File {
            return false;
        }
        self.include.match_all(name)
    }

    /// Match all include terms along an ADC path, letting terms complete
    /// across path levels. Leaves the final recursion frame in place so the
    /// caller can score with it.
    pub fn matches_adc_path(&mut self, path: &str) -> bool {
        let levels: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if levels.is_empty() {
            return false;
        }

        self.recursion = None;
        for (i, level) in levels.iter().enumerate() {
            let lower = level.to_lowercase();
            self.reset_positions();
            self.last_matches = self
                .include
                .match_lower(&lower, true, &mut self.last_positions);

            let last = i + 1 == levels.len();
            if self.last_matches > 0 && !last {
                self.open_recursion(&lower);
            }
            if !last {
                if let Some(r) = self.recursion.as_mut() {
                    r.level += 1;
                    r.depth_len += lower.len();
                }
            }
        }

        self.positions_complete()
    }

    /// Open (or deepen) a recursion frame from the current positions,
    /// merging any existing frame. Returns the frame that was replaced so
    /// the caller can restore it when leaving the directory.
    pub fn open_recursion(&mut self, name_lower: &str) -> Option<Recursion> {
        let mut positions = self.to_point_list(name_lower);
        let mut frame = Recursion {
            depth_len: 0,
            level: 0,
            positions: Vec::new(),
        };
        if let Some(parent) = &self.recursion {
            if Recursion::merge(&mut positions, parent) {
                frame.depth_len = parent.depth_len;
                frame.level = parent.level;
            }
        }
        frame.positions = positions;
        self.recursion.replace(frame)
    }

    /// Restore a frame previously returned by [`open_recursion`].
    pub fn restore_recursion(&mut self, saved: Option<Recursion>) {
        self.recursion = saved;
    }

    /// Note descent into a subdirectory while a frame is active.
    pub fn enter_level(&mut self, name_len: usize) {
        if let Some(r) = self.recursion.as_mut() {
            r.level += 1;
            r.depth_len += name_len;
        }
    }

    /// Reverse of [`enter_level`].
    pub fn leave_level(&mut self, name_len: usize) {
        if let Some(r) = self.recursion.as_mut() {
            r.level = r.level.saturating_sub(1);
            r.depth_len = r.depth_len.saturating_sub(name_len);
        }
    }

    /// Per-term `(position, boundary points)` for the last matched name.
    #[must_use]
    pub fn to_point_list(&self, name: &str) -> Vec<(Option<usize>, i32)> {
        let name_bytes = name.as_bytes();
        self.last_positions
            .iter()
            .enumerate()
            .map(|(i, pos)| {
                let mut points = 0;
                if let Some(pos) = pos {
                    let pattern = &self.include.patterns()[i];
                    if *pos == 0 {
                        points += 20;
                    } else if !pattern.starts_with(is_separator)
                        && name_bytes
                            .get(pos - 1)
                            .is_some_and(|b| is_separator(*b as char))
                    {
                        points += 10;
                    }

                    let end = pos + pattern.len();
                    if end == name.len() {
                        points += 20;
                    } else if !pattern.ends_with(is_separator)
                        && name_bytes.get(end).is_some_and(|b| is_separator(*b as char))
                    {
                        points += 10;
                    }
                }
                (*pos, points)
            })
            .collect()
    }

    /// Positions merged with the active recursion frame where this name
    /// left holes.
    #[must_use]
    pub fn result_positions(&self, name: &str) -> Vec<(Option<usize>, i32)> {
        let mut positions = self.to_point_list(name);
        if let Some(recursion) = &self.recursion {
            if self.last_positions.iter().any(Option::is_none) {
                Recursion::merge(&mut positions, recursion);
            }
        }
        positions
    }
}

//! Outgoing searches and their per-hub priority queue.
//!
//! Each hub holds one queue. Once per scheduler tick a search may be
//! released: the priority band is drawn from a discrete distribution
//! whose weights are `(priority rank - 1) x items in that band`, so high
//! priority dominates without starving lower bands. Recently added items
//! sit on a separate queue drained every `30 / n` seconds. A per-hub
//! minimum interval gates both.

use adcx_proto::extensions;
use adcx_proto::{AdcCommand, Code};
use adcx_search::parse_search_terms;
use rand::distributions::{Distribution, WeightedIndex};
use std::collections::VecDeque;

/// Search priority bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Never released automatically, even by force-resume.
    PausedForce,
    /// Not released until resumed.
    Paused,
    /// Background band.
    Low,
    /// Default band.
    Normal,
    /// Foreground band.
    High,
    /// Urgent band.
    Highest,
}

impl Priority {
    fn rank(self) -> usize {
        match self {
            Priority::PausedForce => 0,
            Priority::Paused => 1,
            Priority::Low => 2,
            Priority::Normal => 3,
            Priority::High => 4,
            Priority::Highest => 5,
        }
    }

    const ACTIVE_BANDS: [Priority; 4] =
        [Priority::Low, Priority::Normal, Priority::High, Priority::Highest];
}

/// Size predicate of an outgoing search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeType {
    /// No size filter
    #[default]
    DontCare,
    /// `GE`
    AtLeast,
    /// `LE`
    AtMost,
    /// `GE` + `LE`
    Exact,
}

/// What kind of items the search asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchType {
    /// Anything
    #[default]
    Any,
    /// Directories only
    Directory,
    /// Files only
    File,
    /// A TTH lookup
    Tth,
}

/// One outgoing search.
#[derive(Debug, Clone)]
pub struct Search {
    /// Caller token echoed in responses.
    pub token: String,
    /// Query text (or a TTH in base32 for [`SearchType::Tth`]).
    pub query: String,
    /// Excluded terms.
    pub excluded: Vec<String>,
    /// Extension filter.
    pub extensions: Vec<String>,
    /// Size predicate.
    pub size_type: SizeType,
    /// Size operand.
    pub size: u64,
    /// Item-type filter.
    pub file_type: SearchType,
    /// Oldest acceptable modification time.
    pub min_date: Option<u64>,
    /// Newest acceptable modification time.
    pub max_date: Option<u64>,
    /// Queue band.
    pub priority: Priority,
    /// Encryption key for UDP results (TLS hubs only).
    pub key: String,
    /// Only peers with directed-search support should see it.
    pub asch_only: bool,
    /// Newly added item: scheduled from the recent queue first.
    pub recent: bool,
}

impl Search {
    /// A search with defaults for everything but query and priority.
    #[must_use]
    pub fn new(query: impl Into<String>, token: impl Into<String>, priority: Priority) -> Self {
        Search {
            token: token.into(),
            query: query.into(),
            excluded: Vec::new(),
            extensions: Vec::new(),
            size_type: SizeType::DontCare,
            size: 0,
            file_type: SearchType::Any,
            min_date: None,
            max_date: None,
            priority,
            key: String::new(),
            asch_only: false,
            recent: false,
        }
    }
}

/// Build the `SCH` parameter set for a search.
///
/// Returns the primary command and, when extension grouping applies to a
/// broadcast search, a grouped variant that must go to `+SEGA` peers
/// while the primary goes to `-SEGA` peers.
#[must_use]
pub fn construct_search(search: &Search, client_id: u32) -> (AdcCommand, Option<AdcCommand>) {
    let mut c = AdcCommand::broadcast(Code::SCH);

    if !search.token.is_empty() {
        c = c.add_named("TO", format!("{}/{}", client_id, search.token));
    }

    if search.file_type == SearchType::Tth {
        c = c.add_named("TR", &search.query);
        return (c, None);
    }

    match search.size_type {
        SizeType::AtLeast => c = c.add_named("GE", search.size.to_string()),
        SizeType::AtMost => c = c.add_named("LE", search.size.to_string()),
        SizeType::Exact => {
            c = c
                .add_named("GE", search.size.to_string())
                .add_named("LE", search.size.to_string());
        }
        SizeType::DontCare => {}
    }

    for term in parse_search_terms(&search.query) {
        c = c.add_named("AN", term);
    }
    for term in &search.excluded {
        c = c.add_named("NO", term);
    }

    match search.file_type {
        SearchType::Directory => c = c.add_named("TY", "2"),
        SearchType::File => c = c.add_named("TY", "1"),
        _ => {}
    }

    if let Some(date) = search.min_date {
        c = c.add_named("NT", date.to_string());
    }
    if let Some(date) = search.max_date {
        c = c.add_named("OT", date.to_string());
    }

    // Extension grouping: compress long lists into a GR mask.
    if search.extensions.len() > 2 {
        let lower: Vec<String> = search
            .extensions
            .iter()
            .map(|e| e.to_lowercase())
            .collect();
        if let Some(grouped) = extensions::compact(&lower) {
            let mut grouped_cmd = c.clone();
            for ext in &grouped.extra {
                grouped_cmd = grouped_cmd.add_named("EX", ext);
            }
            grouped_cmd = grouped_cmd.add_named("GR", grouped.mask.to_string());
            for ext in &grouped.excluded {
                grouped_cmd = grouped_cmd.add_named("RX", ext);
            }

            for ext in &lower {
                c = c.add_named("EX", ext);
            }
            return (c, Some(grouped_cmd));
        }
    }

    for ext in &search.extensions {
        c = c.add_named("EX", ext.to_lowercase());
    }
    (c, None)
}

/// Per-hub search queue.
pub struct SearchQueue {
    bands: [VecDeque<Search>; 4],
    recent: VecDeque<Search>,
    held: Vec<Search>,
    /// Minimum milliseconds between releases.
    min_interval_ms: u64,
    last_release: u64,
    last_recent_release: u64,
}

impl SearchQueue {
    /// Queue with a minimum release interval in milliseconds.
    #[must_use]
    pub fn new(min_interval_ms: u64) -> Self {
        SearchQueue {
            bands: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            recent: VecDeque::new(),
            held: Vec::new(),
            min_interval_ms,
            last_release: 0,
            last_recent_release: 0,
        }
    }

    /// Adjust the minimum release interval.
    pub fn set_min_interval(&mut self, ms: u64) {
        self.min_interval_ms = ms;
    }

    /// Number of queued searches across all bands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum::<usize>() + self.recent.len() + self.held.len()
    }

    /// Is the queue empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a search. Paused bands are held but never released;
    /// recent-flagged items go to the recent queue.
    pub fn add(&mut self, search: Search) {
        match search.priority {
            Priority::PausedForce | Priority::Paused => self.held.push(search),
            _ if search.recent => self.recent.push_back(search),
            _ => {
                let band = search.priority.rank() - 2;
                self.bands[band].push_back(search);
            }
        }
    }

    /// Move a held search back into its band with a new priority.
    pub fn resume(&mut self, token: &str, priority: Priority) {
        let mut resumed: Vec<Search> = Vec::new();
        self.held.retain_mut(|s| {
            if s.token == token {
                s.priority = priority;
                resumed.push(s.clone());
                false
            } else {
                true
            }
        });
        for search in resumed {
            self.add(search);
        }
    }

    /// Drop all searches with a given token.
    pub fn cancel(&mut self, token: &str) {
        for band in &mut self.bands {
            band.retain(|s| s.token != token);
        }
        self.recent.retain(|s| s.token != token);
        self.held.retain(|s| s.token != token);
    }

    /// Release at most one search for `now_ms`. Call once per tick.
    pub fn maybe_pop(&mut self, now_ms: u64) -> Option<Search> {
        if now_ms < self.last_release + self.min_interval_ms {
            return None;
        }

        if let Some(search) = self.pop_weighted() {
            self.last_release = now_ms;
            return Some(search);
        }

        // Recent queue: drains every 30s / n.
        if !self.recent.is_empty() {
            let interval_ms = 30_000 / self.recent.len() as u64;
            if now_ms >= self.last_recent_release + interval_ms {
                let search = self.recent.pop_front();
                if search.is_some() {
                    self.last_recent_release = now_ms;
                    self.last_release = now_ms;
                }
                return search;
            }
        }
        None
    }

    fn pop_weighted(&mut self) -> Option<Search> {
        let weights: Vec<usize> = Priority::ACTIVE_BANDS
            .iter()
            .enumerate()
            .map(|(i, band)| (band.rank() - 1) * self.bands[i].len())
            .collect();
        if weights.iter().all(|w| *w == 0) {
            return None;
        }

        let dist = WeightedIndex::new(&weights).ok()?;
        let band = dist.sample(&mut rand::thread_rng());
        self.bands[band].pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcx_proto::Sid;

    #[test]
    fn scenario_search_wire_form() {
        let mut search = Search::new("ubuntu 22.04 iso", "abc", Priority::Normal);
        search.size_type = SizeType::AtLeast;
        search.size = 734_003_200;
        search.extensions = vec!["iso".into()];

        let (cmd, grouped) = construct_search(&search, 7);
        assert!(grouped.is_none());
        let line = cmd.to_line(Sid::parse("AAAB").unwrap());
        assert_eq!(
            line,
            "BSCH AAAB TO7/abc GE734003200 ANubuntu AN22.04 ANiso EXiso\n"
        );
    }

    #[test]
    fn tth_search_short_circuits() {
        let mut search = Search::new(
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
            "t1",
            Priority::Normal,
        );
        search.file_type = SearchType::Tth;
        let (cmd, grouped) = construct_search(&search, 1);
        assert!(grouped.is_none());
        assert!(cmd
            .to_line(Sid::parse("AAAB").unwrap())
            .contains("TRAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"));
    }

    #[test]
    fn grouped_extensions_produce_two_variants() {
        let mut search = Search::new("music", "t2", Priority::Normal);
        search.extensions = vec![
            "ape".into(), "flac".into(), "m4a".into(), "mid".into(), "mp3".into(),
            "mpc".into(), "ogg".into(), "ra".into(), "wav".into(), "wma".into(),
        ];
        let (plain, grouped) = construct_search(&search, 1);
        let grouped = grouped.expect("full audio group should compact");

        let plain_line = plain.to_line(Sid::HUB);
        let grouped_line = grouped.to_line(Sid::HUB);
        assert!(plain_line.contains("EXape"));
        assert!(grouped_line.contains("GR1"));
        assert!(!grouped_line.contains("EXape"));
    }

    #[test]
    fn min_interval_gates_releases() {
        let mut queue = SearchQueue::new(5000);
        queue.add(Search::new("one", "t1", Priority::Normal));
        queue.add(Search::new("two", "t2", Priority::Normal));

        assert!(queue.maybe_pop(5000).is_some());
        assert!(queue.maybe_pop(6000).is_none());
        assert!(queue.maybe_pop(10_000).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn paused_searches_never_release() {
        let mut queue = SearchQueue::new(0);
        queue.add(Search::new("held", "t", Priority::Paused));
        assert!(queue.maybe_pop(1_000_000).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_by_token() {
        let mut queue = SearchQueue::new(0);
        queue.add(Search::new("a", "t1", Priority::Normal));
        queue.add(Search::new("b", "t2", Priority::High));
        queue.cancel("t1");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn higher_priority_dominates_over_many_draws() {
        let mut high_wins = 0;
        for _ in 0..200 {
            let mut queue = SearchQueue::new(0);
            queue.add(Search::new("low", "l", Priority::Low));
            queue.add(Search::new("high", "h", Priority::Highest));
            if let Some(s) = queue.maybe_pop(1000) {
                if s.token == "h" {
                    high_wins += 1;
                }
            }
        }
        // Weights are 1 vs 4: expect roughly 80% high, allow wide slack.
        assert!(high_wins > 120, "high won only {high_wins}/200");
    }
}

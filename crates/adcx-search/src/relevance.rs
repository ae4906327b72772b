//! Relevance scoring for matched names.
//!
//! Produces a 0..1 score for an item that has already fully matched a
//! query. Sequential term order, tight term spacing, early first match,
//! boundary-aligned terms and shallow tree depth all raise the score; a
//! match completed only by ancestor directories is penalized by its
//! recursion depth.

use crate::query::SearchQuery;

/// Score a fully-matched item.
///
/// `level` is the item's depth in the tree (0 for a root child);
/// `name` is the item name the final terms matched against.
#[must_use]
pub fn relevance_score(query: &SearchQuery, level: u32, is_directory: bool, name: &str) -> f64 {
    // Depth score first: shallower items win.
    let mut scores: f64 = if level > 0 { 9.0 / f64::from(level) } else { 10.0 };
    let mut max_points: f64 = 10.0;

    let positions = query.result_positions(name);
    if positions.is_empty() {
        // Termless queries (e.g. plain TTH or type-only) still prefer
        // shallow items.
        return scores / max_points;
    }

    // Ignore the recursion depth when the final name matched every term.
    let recursion_level = match &query.recursion {
        Some(r) if query.last_matches() != query.include.count() => r.level,
        _ => 0,
    };

    let sorted = positions.windows(2).all(|w| w[0].0 <= w[1].0);
    if sorted {
        scores += 120.0;
    }
    max_points += 120.0;

    // Boundary points, scaled down for out-of-order matches.
    let max_pos_points =
        (query.include.count() as f64 * 20.0) + (20.0 * f64::from(recursion_level + 1));
    let cur_pos_points: f64 = positions.iter().map(|(_, p)| f64::from(*p)).sum();
    if sorted {
        scores += cur_pos_points;
    } else {
        scores += (cur_pos_points / max_pos_points) * 10.0;
    }
    max_points += max_pos_points;

    // Distance between the outermost matches, against the tightest packing.
    if sorted {
        let patterns = query.include.patterns();
        let total_len: usize = patterns.iter().map(String::len).sum();
        let last_len = patterns.last().map_or(0, String::len);
        let min_distance =
            (total_len + patterns.len()).saturating_sub(last_len + 1) as i64;

        let first = positions.first().and_then(|(p, _)| *p).unwrap_or(0) as i64;
        let last = positions.last().and_then(|(p, _)| *p).unwrap_or(0) as i64;
        let extra_distance = (last - first) - min_distance;
        scores += if extra_distance > 0 {
            ((1.0 / extra_distance as f64) * 20.0).max(0.0)
        } else {
            30.0
        };
    }
    max_points += 30.0;

    // Position of the first match: the earlier the better.
    if sorted {
        let start = positions.first().and_then(|(p, _)| *p).unwrap_or(0);
        scores += if start > 0 {
            (1.0 / start as f64) * 20.0
        } else {
            30.0
        };
    }
    max_points += 30.0;

    if is_directory {
        scores += 5.0;
    }
    max_points += 5.0;

    let mut score = scores / max_points;

    // The final name contributed nothing: everything matched upstream.
    if recursion_level > 0 && query.last_positions().iter().all(Option::is_none) {
        score /= f64::from(recursion_level + 1);
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MatchType;

    fn matched_query(terms: &str, name: &str) -> SearchQuery {
        let mut q = SearchQuery::from_text(terms, &[], &[], MatchType::PathPartial);
        assert!(q.matches_file_lower(&name.to_lowercase(), 1, 0), "{name} must match {terms}");
        q
    }

    #[test]
    fn scores_are_normalized() {
        let q = matched_query("ubuntu iso", "ubuntu-22.04.iso");
        let score = relevance_score(&q, 1, false, "ubuntu-22.04.iso");
        assert!(score > 0.0 && score <= 1.0);
    }

    #[test]
    fn shallower_wins() {
        let q = matched_query("ubuntu", "ubuntu.iso");
        let shallow = relevance_score(&q, 0, false, "ubuntu.iso");
        let deep = relevance_score(&q, 5, false, "ubuntu.iso");
        assert!(shallow > deep);
    }

    #[test]
    fn sequential_beats_scattered() {
        let ordered = matched_query("alpha beta", "alpha beta.txt");
        let a = relevance_score(&ordered, 0, false, "alpha beta.txt");

        let scattered = matched_query("alpha beta", "beta alpha.txt");
        let b = relevance_score(&scattered, 0, false, "beta alpha.txt");
        assert!(a > b);
    }

    #[test]
    fn early_match_beats_late() {
        let early = matched_query("ubuntu", "ubuntu and more words.iso");
        let a = relevance_score(&early, 0, false, "ubuntu and more words.iso");

        let late = matched_query("ubuntu", "several words then ubuntu.iso");
        let b = relevance_score(&late, 0, false, "several words then ubuntu.iso");
        assert!(a > b);
    }

    #[test]
    fn directory_bonus() {
        let q = matched_query("media", "media");
        let dir = relevance_score(&q, 0, true, "media");
        let file = relevance_score(&q, 0, false, "media");
        assert!(dir > file);
    }

    #[test]
    fn ancestor_only_match_is_penalized() {
        let mut q = SearchQuery::from_text("linux iso", &[], &[], MatchType::PathPartial);
        assert!(q.matches_any_directory_lower("linux isos"));
        assert!(q.positions_complete());
        let direct = relevance_score(&q, 0, true, "linux isos");

        // Same query completing only via a parent directory.
        let mut q2 = SearchQuery::from_text("linux iso", &[], &[], MatchType::PathPartial);
        assert!(q2.matches_any_directory_lower("linux iso collection"));
        let saved = q2.open_recursion("linux iso collection");
        q2.enter_level("linux iso collection".len());
        assert!(q2.matches_file_lower("unrelated-name.bin", 1, 0));
        let inherited = relevance_score(&q2, 1, false, "unrelated-name.bin");
        q2.restore_recursion(saved);

        assert!(direct > inherited);
    }
}

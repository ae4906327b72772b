//! # adcx-search
//!
//! Query model and matching engine for share searches:
//!
//! - [`SearchQuery`]: a parsed search (include/exclude terms, extension
//!   sets, size/date/type predicates, or a bare TTH root)
//! - [`StringSearch`]: simultaneous multi-pattern scanning with match
//!   positions
//! - [`relevance`]: scoring of matched names against a query
//!
//! The matcher itself walks no trees; the share index drives it and feeds
//! it lower-cased names, using [`Recursion`] to let terms matched in an
//! ancestor directory complete in a descendant.

#![warn(clippy::all)]

pub mod query;
pub mod relevance;
pub mod string_search;

pub use query::{ItemType, MatchType, Recursion, SearchQuery};
pub use string_search::StringSearch;

/// Characters treated as token boundaries when scoring matches.
#[must_use]
pub fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '.' | '-' | '_' | '(' | ')' | '[' | ']' | '/')
}

/// Split a raw search string into terms, honoring double quotes.
#[must_use]
pub fn parse_search_terms(input: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                if quoted && !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
                quoted = !quoted;
            }
            ' ' if !quoted => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_terms() {
        assert_eq!(parse_search_terms("ubuntu 22.04 iso"), ["ubuntu", "22.04", "iso"]);
    }

    #[test]
    fn honors_quotes() {
        assert_eq!(
            parse_search_terms(r#"linux "ubuntu server" iso"#),
            ["linux", "ubuntu server", "iso"]
        );
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(parse_search_terms("  a   b "), ["a", "b"]);
        assert!(parse_search_terms("   ").is_empty());
    }
}

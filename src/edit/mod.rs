//! Three-strategy fuzzy text matcher.
//!
//! Each strategy is a function that takes `(haystack, needle, mode)` and
//! returns an `Option<Match>`. The orchestrator runs the chain in order
//! and short-circuits on the first success:
//!
//! 1. `exact` — plain substring search
//! 2. `quote_normalized` — curly quotes folded to ASCII on both sides;
//!    the returned range covers the original haystack text
//! 3. `fuzzy_regex` — a generated pattern tolerating whitespace runs,
//!    underscore runs and quote variance; in [`MatchMode::MarkupAware`]
//!    it also tolerates bold/italic/heading marker noise between tokens
//!
//! Matching is case-sensitive and leftmost-first. Callers decide whether
//! a miss warrants retrying against an alternate view of the text.

pub mod diff;
pub mod fuzzy;
pub mod trim;
pub mod word_diff;

use tracing::debug;

/// Whether the fuzzy pattern should tolerate markdown-style formatting
/// noise between literal tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Plain,
    MarkupAware,
}

/// A located target: byte offsets into the haystack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub start: usize,
    pub len: usize,
}

impl Match {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

type Strategy = fn(&str, &str, MatchMode) -> Option<Match>;

/// The ordered strategy chain. First success wins; later strategies are
/// never consulted after a hit.
const STRATEGY_CHAIN: &[(&str, Strategy)] = &[
    ("exact", exact),
    ("quote_normalized", quote_normalized),
    ("fuzzy_regex", fuzzy_regex),
];

/// Locate `needle` in `haystack` using the escalating strategy chain.
pub fn find_match(haystack: &str, needle: &str, mode: MatchMode) -> Option<Match> {
    if needle.is_empty() {
        return None;
    }
    for &(name, strategy) in STRATEGY_CHAIN {
        if let Some(found) = strategy(haystack, needle, mode) {
            debug!(strategy = name, start = found.start, len = found.len, "match found");
            return Some(found);
        }
    }
    debug!(needle_len = needle.len(), "no match under any strategy");
    None
}

fn exact(haystack: &str, needle: &str, _mode: MatchMode) -> Option<Match> {
    haystack.find(needle).map(|start| Match {
        start,
        len: needle.len(),
    })
}

/// Fold curly quotes to their ASCII equivalents. One char maps to one
/// char, so character offsets are preserved (byte offsets are not).
pub fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

fn quote_normalized(haystack: &str, needle: &str, _mode: MatchMode) -> Option<Match> {
    let norm_haystack = normalize_quotes(haystack);
    let norm_needle = normalize_quotes(needle);
    let byte_idx = norm_haystack.find(&norm_needle)?;

    // Quote folding is 1:1 per character, so recover the original range
    // by character count rather than normalized byte offsets.
    let char_start = norm_haystack[..byte_idx].chars().count();
    let char_len = norm_needle.chars().count();

    let start = byte_offset_at_char(haystack, char_start)?;
    let end = byte_offset_at_char(haystack, char_start + char_len)?;
    Some(Match {
        start,
        len: end - start,
    })
}

fn byte_offset_at_char(text: &str, char_index: usize) -> Option<usize> {
    if char_index == 0 {
        return Some(0);
    }
    text.char_indices()
        .nth(char_index - 1)
        .map(|(offset, c)| offset + c.len_utf8())
}

fn fuzzy_regex(haystack: &str, needle: &str, mode: MatchMode) -> Option<Match> {
    let pattern = fuzzy::build_pattern(needle, mode);
    let re = regex::Regex::new(&pattern).ok()?;
    re.find(haystack).map(|m| Match {
        start: m.start(),
        len: m.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_wins_with_needle_length() {
        let found = find_match("a word here", "word", MatchMode::Plain).unwrap();
        assert_eq!(found.start, 2);
        assert_eq!(found.len, 4);
    }

    #[test]
    fn test_quote_normalized_reports_original_range() {
        let haystack = "said \u{201C}hello\u{201D} there";
        let found = find_match(haystack, "said \"hello\"", MatchMode::Plain).unwrap();
        assert_eq!(found.start, 0);
        // Curly quotes are three bytes each in the original text.
        assert_eq!(
            &haystack[found.start..found.end()],
            "said \u{201C}hello\u{201D}"
        );
    }

    #[test]
    fn test_fuzzy_whitespace_runs() {
        let found = find_match("the  quick \t fox", "the quick fox", MatchMode::Plain).unwrap();
        assert_eq!(found.start, 0);
        assert_eq!(found.len, "the  quick \t fox".len());
    }

    #[test]
    fn test_markup_noise_needs_markup_mode() {
        let haystack = "## Limitation of **Liability**";
        let needle = "Limitation of Liability";
        assert!(find_match(haystack, needle, MatchMode::Plain).is_none());
        let found = find_match(haystack, needle, MatchMode::MarkupAware).unwrap();
        assert!(found.len >= needle.len());
    }

    #[test]
    fn test_leftmost_first() {
        let found = find_match("fee ... fee", "fee", MatchMode::Plain).unwrap();
        assert_eq!(found.start, 0);
    }

    #[test]
    fn test_no_match() {
        assert!(find_match("lorem ipsum", "missing", MatchMode::Plain).is_none());
    }

    #[test]
    fn test_empty_needle_never_matches() {
        assert!(find_match("anything", "", MatchMode::Plain).is_none());
    }
}

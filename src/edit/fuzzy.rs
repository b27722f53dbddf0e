//! Tolerant-pattern generation for the last-resort matcher strategy.
//!
//! The needle is tokenized into literal text, underscore runs, whitespace
//! runs and quote characters. Literals are regex-escaped; separators are
//! widened (`_+`, `\s+`, a curly/straight quote class). In markup-aware
//! mode, optional formatting noise (`**`, `_`, `#`, backticks, plus any
//! trailing spaces attached to them) is permitted at the start, around
//! every separator, and at the end, so a plain-text needle can land on
//! its marked-up rendering.

use std::sync::OnceLock;

use regex::Regex;

use super::MatchMode;
use super::normalize_quotes;

/// Formatting chars that may intervene between tokens in markup-aware
/// mode. Whitespace is only eaten when attached to a formatting run
/// ("## " matches, an isolated space does not).
const MARKUP_NOISE: &str = r"(?:[\*_#`]+[ \t]*)*";

fn separator_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(_+)|(\s+)|(['"])"#).unwrap())
}

/// Build the tolerant pattern for `needle`.
pub fn build_pattern(needle: &str, mode: MatchMode) -> String {
    let needle = normalize_quotes(needle);
    let noise = matches!(mode, MatchMode::MarkupAware);

    let mut pattern = String::with_capacity(needle.len() * 2);
    if noise {
        pattern.push_str(MARKUP_NOISE);
    }

    let mut last = 0;
    for caps in separator_token_re().captures_iter(&needle) {
        let whole = caps.get(0).unwrap();
        let literal = &needle[last..whole.start()];
        if !literal.is_empty() {
            pattern.push_str(&regex::escape(literal));
        }
        if noise {
            pattern.push_str(MARKUP_NOISE);
        }

        if caps.get(1).is_some() {
            pattern.push_str("_+");
        } else if caps.get(2).is_some() {
            pattern.push_str(r"\s+");
        } else if whole.as_str() == "'" {
            pattern.push_str("['\u{2018}\u{2019}]");
        } else {
            pattern.push_str("[\"\u{201C}\u{201D}]");
        }

        if noise {
            pattern.push_str(MARKUP_NOISE);
        }
        last = whole.end();
    }

    let remaining = &needle[last..];
    if !remaining.is_empty() {
        pattern.push_str(&regex::escape(remaining));
        if noise {
            pattern.push_str(MARKUP_NOISE);
        }
    }

    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(haystack: &str, needle: &str, mode: MatchMode) -> bool {
        Regex::new(&build_pattern(needle, mode))
            .unwrap()
            .is_match(haystack)
    }

    #[test]
    fn test_literals_are_escaped() {
        assert!(matches("Section 3.1(a)", "Section 3.1(a)", MatchMode::Plain));
        assert!(!matches("Section 3X1(a)", "Section 3.1(a)", MatchMode::Plain));
    }

    #[test]
    fn test_whitespace_widened() {
        assert!(matches("one \t\n two", "one two", MatchMode::Plain));
    }

    #[test]
    fn test_underscore_runs_widened() {
        assert!(matches("name___here", "name_here", MatchMode::Plain));
    }

    #[test]
    fn test_quote_class_covers_curly() {
        assert!(matches("it\u{2019}s fine", "it's fine", MatchMode::Plain));
        assert!(matches("a \u{201C}term\u{201D}", "a \"term\"", MatchMode::Plain));
    }

    #[test]
    fn test_markup_noise_brackets_separators() {
        // Bold markers land adjacent to the space separator.
        assert!(matches("a **bold** word", "a bold word", MatchMode::MarkupAware));
        // Heading run plus its attached space at the start.
        assert!(matches("## Header text", "Header text", MatchMode::MarkupAware));
        // Trailing markers after the final literal.
        assert!(matches("trailing**", "trailing", MatchMode::MarkupAware));
    }

    #[test]
    fn test_plain_mode_rejects_markup_noise() {
        assert!(!matches("a **bold** word", "a bold word", MatchMode::Plain));
    }
}

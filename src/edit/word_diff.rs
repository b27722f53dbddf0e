//! Word-level diff between two plain-text strings.
//!
//! Text is tokenized into alternating word (`\S+`) and whitespace (`\s+`)
//! tokens, so changes never split inside a word and inter-word spacing
//! survives as its own token. The token slices are diffed directly and
//! the result is flattened into a run of [`Change`] segments with
//! adjacent same-kind segments merged.

use std::sync::OnceLock;

use regex::Regex;
use similar::{capture_diff_slices, Algorithm, DiffOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Equal,
    Delete,
    Insert,
}

/// One contiguous segment of the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub text: String,
}

fn word_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\S+|\s+").unwrap())
}

/// Split text into word and whitespace tokens. Lossless: concatenating
/// the tokens reproduces the input.
pub fn tokenize(text: &str) -> Vec<&str> {
    word_token_re().find_iter(text).map(|m| m.as_str()).collect()
}

/// Diff `old` against `new` at word granularity.
pub fn diff_words(old: &str, new: &str) -> Vec<Change> {
    let old_tokens = tokenize(old);
    let new_tokens = tokenize(new);
    let ops = capture_diff_slices(Algorithm::Myers, &old_tokens, &new_tokens);

    let mut changes: Vec<Change> = Vec::new();
    let mut push = |kind: ChangeKind, tokens: &[&str]| {
        if tokens.is_empty() {
            return;
        }
        let text: String = tokens.concat();
        if let Some(last) = changes.last_mut() {
            if last.kind == kind {
                last.text.push_str(&text);
                return;
            }
        }
        changes.push(Change { kind, text });
    };

    for op in ops {
        match op {
            DiffOp::Equal {
                old_index, len, ..
            } => push(ChangeKind::Equal, &old_tokens[old_index..old_index + len]),
            DiffOp::Delete {
                old_index, old_len, ..
            } => push(
                ChangeKind::Delete,
                &old_tokens[old_index..old_index + old_len],
            ),
            DiffOp::Insert {
                new_index, new_len, ..
            } => push(
                ChangeKind::Insert,
                &new_tokens[new_index..new_index + new_len],
            ),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                push(
                    ChangeKind::Delete,
                    &old_tokens[old_index..old_index + old_len],
                );
                push(
                    ChangeKind::Insert,
                    &new_tokens[new_index..new_index + new_len],
                );
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(changes: &[Change], kind: ChangeKind) -> String {
        changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.text.as_str())
            .collect()
    }

    #[test]
    fn test_tokenize_lossless() {
        let text = "one  two\t three\n";
        assert_eq!(tokenize(text).concat(), text);
    }

    #[test]
    fn test_single_word_swap() {
        let changes = diff_words("shall deliver the goods", "shall ship the goods");
        assert_eq!(render(&changes, ChangeKind::Delete), "deliver");
        assert_eq!(render(&changes, ChangeKind::Insert), "ship");
    }

    #[test]
    fn test_reconstruction_both_sides() {
        let old = "a b c d";
        let new = "a x c d e";
        let changes = diff_words(old, new);
        let rebuilt_old: String = changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Insert)
            .map(|c| c.text.as_str())
            .collect();
        let rebuilt_new: String = changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Delete)
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(rebuilt_old, old);
        assert_eq!(rebuilt_new, new);
    }

    #[test]
    fn test_words_never_split() {
        let changes = diff_words("deliverable", "delivery");
        // Whole-token replacement, not a char-level splice.
        assert_eq!(render(&changes, ChangeKind::Delete), "deliverable");
        assert_eq!(render(&changes, ChangeKind::Insert), "delivery");
    }

    #[test]
    fn test_identical_is_all_equal() {
        let changes = diff_words("same text", "same text");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Equal);
    }
}

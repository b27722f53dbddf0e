//! Edit generation from a full-text rewrite.
//!
//! Diffs the original logical text against a modified version and emits
//! indexed [`DocumentEdit`]s, so a caller holding only "before" and
//! "after" strings gets the same tracked-change treatment as a caller
//! supplying targeted edits. Word-level tokenization (whitespace runs,
//! word runs, single punctuation) keeps the redlines readable.
//!
//! A delete immediately followed by an insert merges into one
//! modification. A pure insertion carries an empty target and an
//! absolute offset; insertion at offset 0 covers new text before the
//! first existing character.

use std::sync::OnceLock;

use regex::Regex;
use similar::{capture_diff_slices, Algorithm, DiffOp};
use tracing::debug;

use crate::models::DocumentEdit;

fn diff_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+|\w+|[^\w\s]").unwrap())
}

fn tokenize(text: &str) -> Vec<&str> {
    diff_token_re().find_iter(text).map(|m| m.as_str()).collect()
}

/// Compare two plain-text renditions and emit indexed edits.
///
/// Offsets in the returned edits are byte offsets into `original_text`.
pub fn generate_edits_from_text(original_text: &str, modified_text: &str) -> Vec<DocumentEdit> {
    let old_tokens = tokenize(original_text);
    let new_tokens = tokenize(modified_text);
    let ops = capture_diff_slices(Algorithm::Myers, &old_tokens, &new_tokens);

    let mut edits = Vec::new();
    let mut original_index = 0usize;
    // Deferred deletion waiting to pair with a following insertion.
    let mut pending_delete: Option<(usize, String)> = None;

    let mut flush_delete = |pending: &mut Option<(usize, String)>, edits: &mut Vec<DocumentEdit>| {
        if let Some((idx, text)) = pending.take() {
            edits.push(
                DocumentEdit::new(text, "")
                    .with_comment("Diff: Text deleted")
                    .at_offset(idx),
            );
        }
    };

    for op in ops {
        match op {
            DiffOp::Equal { old_index, len, .. } => {
                flush_delete(&mut pending_delete, &mut edits);
                original_index += byte_len(&old_tokens[old_index..old_index + len]);
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                let text: String = old_tokens[old_index..old_index + old_len].concat();
                pending_delete = Some((original_index, text.clone()));
                original_index += text.len();
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                let text: String = new_tokens[new_index..new_index + new_len].concat();
                emit_insert(&mut pending_delete, &mut edits, original_index, text);
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                let deleted: String = old_tokens[old_index..old_index + old_len].concat();
                pending_delete = Some((original_index, deleted.clone()));
                original_index += deleted.len();
                let inserted: String = new_tokens[new_index..new_index + new_len].concat();
                emit_insert(&mut pending_delete, &mut edits, original_index, inserted);
            }
        }
    }

    flush_delete(&mut pending_delete, &mut edits);

    debug!(edits = edits.len(), "generated edits from text pair");
    edits
}

fn emit_insert(
    pending_delete: &mut Option<(usize, String)>,
    edits: &mut Vec<DocumentEdit>,
    original_index: usize,
    text: String,
) {
    if let Some((idx, deleted)) = pending_delete.take() {
        edits.push(
            DocumentEdit::new(deleted, text)
                .with_comment("Diff: Replacement")
                .at_offset(idx),
        );
    } else {
        edits.push(
            DocumentEdit::new("", text)
                .with_comment("Diff: Text inserted")
                .at_offset(original_index),
        );
    }
}

fn byte_len(tokens: &[&str]) -> usize {
    tokens.iter().map(|t| t.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpKind;

    fn kind_of(edit: &DocumentEdit) -> OpKind {
        match (edit.target_text.is_empty(), edit.new_text.is_empty()) {
            (false, true) => OpKind::Deletion,
            (true, false) => OpKind::Insertion,
            _ => OpKind::Modification,
        }
    }

    #[test]
    fn test_word_swap_is_one_modification() {
        let edits = generate_edits_from_text("shall deliver the goods", "shall ship the goods");
        assert_eq!(edits.len(), 1);
        assert_eq!(kind_of(&edits[0]), OpKind::Modification);
        assert_eq!(edits[0].target_text, "deliver");
        assert_eq!(edits[0].new_text, "ship");
        assert_eq!(edits[0].match_start, Some("shall ".len()));
    }

    #[test]
    fn test_pure_deletion_flushed() {
        let edits = generate_edits_from_text("keep drop keep2", "keep keep2");
        assert_eq!(edits.len(), 1);
        assert_eq!(kind_of(&edits[0]), OpKind::Deletion);
        assert!(edits[0].target_text.contains("drop"));
    }

    #[test]
    fn test_trailing_deletion_flushed() {
        let edits = generate_edits_from_text("keep tail", "keep");
        assert_eq!(edits.len(), 1);
        assert_eq!(kind_of(&edits[0]), OpKind::Deletion);
    }

    #[test]
    fn test_leading_insertion_is_indexed_at_zero() {
        let edits = generate_edits_from_text("Contract terms", "Big Contract terms");
        assert_eq!(edits.len(), 1);
        assert_eq!(kind_of(&edits[0]), OpKind::Insertion);
        assert_eq!(edits[0].match_start, Some(0));
        assert_eq!(edits[0].new_text, "Big ");
    }

    #[test]
    fn test_mid_text_insertion_offset() {
        let edits = generate_edits_from_text("alpha gamma", "alpha beta gamma");
        assert_eq!(edits.len(), 1);
        assert_eq!(kind_of(&edits[0]), OpKind::Insertion);
        assert!(edits[0].new_text.contains("beta"));
        // Alignment may attach either surrounding space to the insert.
        let offset = edits[0].match_start.unwrap();
        assert!((5..=6).contains(&offset), "offset {offset}");
    }

    #[test]
    fn test_identical_texts_produce_no_edits() {
        assert!(generate_edits_from_text("same", "same").is_empty());
    }

    #[test]
    fn test_offsets_are_byte_offsets() {
        let edits = generate_edits_from_text("caf\u{e9} old end", "caf\u{e9} new end");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].match_start, Some("caf\u{e9} ".len()));
    }
}

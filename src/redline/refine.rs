//! Word-diff refinement of replacement edits.
//!
//! A plain modification deletes the whole matched range and inserts the
//! whole replacement, which reads poorly in review when only a few
//! words changed. The refined path diffs the matched text against the
//! replacement at word level and emits interleaved equal / `w:del` /
//! `w:ins` elements, preserving per-character formatting of the kept
//! text. Anything the word-diff path cannot handle safely (empty or
//! missing targets, pure deletions, targets inside an existing
//! insertion, multi-paragraph spans, reconstruction mismatches) is
//! delegated to the plain engine path.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::docx::{self, NodeRef};
use crate::edit::word_diff::{diff_words, Change, ChangeKind};
use crate::models::{BatchOutcome, DocumentEdit, EditStatus, SkipReason, ViewKind};
use crate::redline::engine::Engine;
use crate::xml::{NodeId, XmlTree};

impl Engine {
    /// Apply a batch with word-diff refinement for replacements.
    pub fn apply_edits_refined(&mut self, edits: Vec<DocumentEdit>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for edit in edits {
            let sub = self.apply_edit_word_diff(edit);
            outcome.merge(sub);
        }
        outcome
    }

    fn apply_edit_word_diff(&mut self, edit: DocumentEdit) -> BatchOutcome {
        if edit.target_text.is_empty() {
            return self.apply_edits(vec![edit]);
        }

        let raw_match = self.mapper.find_match_index(&edit.target_text);
        let (view, m) = match raw_match {
            Some(m) => (ViewKind::Raw, m),
            None => {
                self.ensure_clean_mapper();
                let clean_match = self
                    .clean_mapper
                    .as_ref()
                    .and_then(|cm| cm.find_match_index(&edit.target_text));
                match clean_match {
                    Some(m) => (ViewKind::Clean, m),
                    None => {
                        let mut outcome = BatchOutcome::default();
                        outcome.record(EditStatus::skipped(
                            &edit.target_text,
                            SkipReason::MatchNotFound,
                        ));
                        return outcome;
                    }
                }
            }
        };

        // Inside an existing insertion the whole-insertion replacement
        // logic applies; word-level splicing would corrupt the markup.
        let in_insertion = self
            .view_mapper(view)
            .context_at_range(m.start, m.end())
            .is_some_and(|s| s.ins_id.is_some());
        if in_insertion {
            debug!("refined edit falls inside an insertion; delegating");
            return self.apply_edits(vec![edit]);
        }

        if edit.new_text.is_empty() {
            return self.apply_edits(vec![edit]);
        }

        let runs = self.resolve_runs_for_refinement(view, m.start, m.end());
        if runs.is_empty() {
            let mut outcome = BatchOutcome::default();
            outcome.record(EditStatus::skipped(
                &edit.target_text,
                SkipReason::Unresolvable,
            ));
            return outcome;
        }
        let part = runs[0].part;

        let (runs_plain, char_map, parent, insert_idx, spans_paragraphs) = {
            let tree = self.doc.tree(part);
            let mut parents: HashSet<NodeId> = HashSet::new();
            for run in &runs {
                if let Some(p) = tree.parent(run.node) {
                    parents.insert(p);
                }
            }
            let runs_plain: String = runs
                .iter()
                .map(|r| docx::run_text(tree, r.node))
                .collect();
            let char_map = build_char_format_map(tree, &runs);
            let parent = tree.parent(runs[0].node);
            let insert_idx = tree.position(runs[0].node);
            (runs_plain, char_map, parent, insert_idx, parents.len() > 1)
        };

        if spans_paragraphs {
            debug!("refined edit spans paragraphs; delegating");
            return self.apply_edits(vec![edit]);
        }
        let (Some(parent), Some(insert_idx)) = (parent, insert_idx) else {
            let mut outcome = BatchOutcome::default();
            outcome.record(EditStatus::skipped(
                &edit.target_text,
                SkipReason::Unresolvable,
            ));
            return outcome;
        };

        if runs_plain == edit.new_text {
            let mut outcome = BatchOutcome::default();
            outcome.record(EditStatus::skipped(&edit.target_text, SkipReason::NoChange));
            return outcome;
        }

        let diffs = diff_words(&runs_plain, &edit.new_text);

        // Accepting every change must reproduce the replacement exactly.
        let reconstructed: String = diffs
            .iter()
            .filter(|c| c.kind != ChangeKind::Delete)
            .map(|c| c.text.as_str())
            .collect();
        if reconstructed != edit.new_text {
            warn!("word-diff reconstruction mismatch; delegating");
            return self.apply_edits(vec![edit]);
        }

        let elements = self.build_diff_elements(part, &diffs, &char_map);
        if elements.is_empty() {
            let mut outcome = BatchOutcome::default();
            outcome.record(EditStatus::skipped(&edit.target_text, SkipReason::NoChange));
            return outcome;
        }

        let tree = self.doc.tree_mut(part);
        for (i, &element) in elements.iter().enumerate() {
            tree.insert(parent, insert_idx + i, element);
        }
        for run in &runs {
            tree.detach(run.node);
        }
        self.invalidate_maps();

        let mut outcome = BatchOutcome::default();
        outcome.record(EditStatus::applied(&edit.target_text));
        outcome
    }

    fn resolve_runs_for_refinement(
        &mut self,
        view: ViewKind,
        start: usize,
        end: usize,
    ) -> Vec<NodeRef> {
        match view {
            ViewKind::Raw => self.mapper.resolve_runs(&mut self.doc, start, end),
            ViewKind::Clean => match self.clean_mapper.as_mut() {
                Some(m) => m.resolve_runs(&mut self.doc, start, end),
                None => Vec::new(),
            },
        }
    }

    /// Interleaved equal / deletion / insertion elements for a diff.
    ///
    /// `old_pos` is a character position into the original text; it
    /// advances on equal and delete but not on insert, so inserted text
    /// inherits the formatting of what it replaces.
    fn build_diff_elements(
        &mut self,
        part: usize,
        diffs: &[Change],
        char_map: &[Option<NodeId>],
    ) -> Vec<NodeId> {
        let mut elements = Vec::new();
        let mut old_pos = 0usize;

        for change in diffs {
            if change.text.is_empty() {
                continue;
            }
            match change.kind {
                ChangeKind::Equal => {
                    let segments =
                        split_by_formatting(self.doc.tree(part), &change.text, char_map, old_pos);
                    let tree = self.doc.tree_mut(part);
                    for (seg_text, rpr) in segments {
                        elements.push(text_run(tree, "w:t", &seg_text, rpr));
                    }
                    old_pos += change.text.chars().count();
                }
                ChangeKind::Delete => {
                    let del = self.create_change_marker(part, "w:del");
                    let segments =
                        split_by_formatting(self.doc.tree(part), &change.text, char_map, old_pos);
                    let tree = self.doc.tree_mut(part);
                    for (seg_text, rpr) in segments {
                        let run = text_run(tree, "w:delText", &seg_text, rpr);
                        tree.append(del, run);
                    }
                    elements.push(del);
                    old_pos += change.text.chars().count();
                }
                ChangeKind::Insert => {
                    let ins = self.create_change_marker(part, "w:ins");
                    let rpr = rpr_at(char_map, old_pos);
                    let tree = self.doc.tree_mut(part);
                    let run = text_run(tree, "w:t", &change.text, rpr);
                    tree.append(ins, run);
                    elements.push(ins);
                }
            }
        }
        elements
    }
}

fn text_run(tree: &mut XmlTree, leaf_tag: &str, text: &str, rpr: Option<NodeId>) -> NodeId {
    let run = tree.create("w:r");
    if let Some(rpr) = rpr {
        let copy = tree.deep_clone(rpr);
        tree.append(run, copy);
    }
    let leaf = tree.create(leaf_tag);
    tree.set_text(leaf, text);
    tree.set_attr(leaf, "xml:space", "preserve");
    tree.append(run, leaf);
    run
}

/// One `Option<w:rPr>` entry per character of the concatenated run text.
fn build_char_format_map(tree: &XmlTree, runs: &[NodeRef]) -> Vec<Option<NodeId>> {
    let mut map = Vec::new();
    for run in runs {
        let rpr = tree.child_by_tag(run.node, "w:rPr");
        for _ in docx::run_text(tree, run.node).chars() {
            map.push(rpr);
        }
    }
    map
}

/// Formatting at `pos`, falling back to the nearest formatted position.
fn rpr_at(char_map: &[Option<NodeId>], pos: usize) -> Option<NodeId> {
    if char_map.is_empty() {
        return None;
    }
    let pos = pos.min(char_map.len() - 1);
    if char_map[pos].is_some() {
        return char_map[pos];
    }
    char_map[..pos]
        .iter()
        .rev()
        .chain(char_map[pos + 1..].iter())
        .find_map(|&r| r)
}

/// Visible-format equality: presence of bold, italic, underline.
fn rpr_equal(tree: &XmlTree, a: Option<NodeId>, b: Option<NodeId>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a == b
                || ["w:b", "w:i", "w:u"].iter().all(|tag| {
                    tree.child_by_tag(a, tag).is_some() == tree.child_by_tag(b, tag).is_some()
                })
        }
        _ => false,
    }
}

/// Split `text` into segments wherever the underlying formatting
/// changes, carrying the original `w:rPr` node of each segment.
fn split_by_formatting(
    tree: &XmlTree,
    text: &str,
    char_map: &[Option<NodeId>],
    start_pos: usize,
) -> Vec<(String, Option<NodeId>)> {
    let mut segments: Vec<(String, Option<NodeId>)> = Vec::new();
    for (i, ch) in text.chars().enumerate() {
        let rpr = if char_map.is_empty() {
            None
        } else {
            char_map[(start_pos + i).min(char_map.len() - 1)]
        };
        match segments.last_mut() {
            Some((seg, seg_rpr)) if rpr_equal(tree, *seg_rpr, rpr) => seg.push(ch),
            _ => segments.push((ch.to_string(), rpr)),
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ViewKind;

    fn docx_bytes(body: &str) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("[Content_Types].xml", options).unwrap();
        writer
            .write_all(
                br#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#,
            )
            .unwrap();
        writer.start_file("word/document.xml", options).unwrap();
        let xml = format!(
            r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        writer.write_all(xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn engine(body: &str) -> Engine {
        Engine::new(&docx_bytes(body), "Reviewer").unwrap()
    }

    #[test]
    fn test_refined_edit_keeps_unchanged_words_unmarked() {
        let mut e = engine("<w:p><w:r><w:t>The quick brown fox jumps</w:t></w:r></w:p>");
        let outcome = e.apply_edits_refined(vec![DocumentEdit::new(
            "quick brown fox",
            "quick red fox",
        )]);
        assert_eq!(outcome.applied, 1);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{--brown--}{++red++}"), "{text}");
        // Kept words stay outside any marker.
        assert!(text.contains("The quick "), "{text}");
        assert_eq!(e.text(ViewKind::Clean), "The quick red fox jumps");
    }

    #[test]
    fn test_refined_edit_splits_at_formatting_boundary() {
        // Underline formats the run without adding logical-text markers.
        let mut e = engine(
            r#"<w:p><w:r><w:rPr><w:u w:val="single"/></w:rPr><w:t>Under</w:t></w:r><w:r><w:t> plain tail</w:t></w:r></w:p>"#,
        );
        let outcome =
            e.apply_edits_refined(vec![DocumentEdit::new("Under plain", "Under stern")]);
        assert_eq!(outcome.applied, 1);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{--plain--}{++stern++}"), "{text}");
        assert_eq!(e.text(ViewKind::Clean), "Under stern tail");
        // The kept "Under " split into an underlined and a plain run.
        let body = e.doc.body();
        let underlined = body
            .find_all("w:u")
            .len();
        assert!(underlined >= 1, "underline formatting preserved");
    }

    #[test]
    fn test_pure_deletion_delegates_to_engine() {
        let mut e = engine("<w:p><w:r><w:t>keep drop keep</w:t></w:r></w:p>");
        let outcome = e.apply_edits_refined(vec![DocumentEdit::new("drop ", "")]);
        assert_eq!(outcome.applied, 1);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{--drop --}"), "{text}");
    }

    #[test]
    fn test_identical_replacement_is_skipped() {
        let mut e = engine("<w:p><w:r><w:t>nothing to see</w:t></w:r></w:p>");
        let outcome = e.apply_edits_refined(vec![DocumentEdit::new("nothing", "nothing")]);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.statuses[0].reason, Some(SkipReason::NoChange));
    }

    #[test]
    fn test_missing_target_is_skipped() {
        let mut e = engine("<w:p><w:r><w:t>content</w:t></w:r></w:p>");
        let outcome = e.apply_edits_refined(vec![DocumentEdit::new("absent", "x")]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.statuses[0].reason, Some(SkipReason::MatchNotFound));
    }

    #[test]
    fn test_rpr_equal_compares_presence_only() {
        let tree = XmlTree::parse(
            br#"<root xmlns:w="ns"><w:rPr><w:b/></w:rPr><w:rPr><w:b/><w:sz w:val="24"/></w:rPr><w:rPr><w:i/></w:rPr></root>"#,
        )
        .unwrap();
        let root = tree.root();
        let children: Vec<_> = tree.children(root).to_vec();
        let (a, b, c) = (children[0], children[1], children[2]);
        // Size differences do not split segments; bold/italic do.
        assert!(rpr_equal(&tree, Some(a), Some(b)));
        assert!(!rpr_equal(&tree, Some(a), Some(c)));
        assert!(!rpr_equal(&tree, Some(a), None));
    }
}

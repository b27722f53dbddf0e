//! Tracked-change mutation engine.
//!
//! One engine owns one in-memory document plus its mapper snapshots.
//! Edits arrive either with a pre-computed offset (diff pipeline) or as
//! bare target text located by the matcher chain. Batches run in two
//! phases: indexed edits in descending offset order with no rebuild
//! between them, then heuristic edits longest-target-first with a full
//! map rebuild after every successful application.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::docx::{self, Document, NodeRef};
use crate::edit::trim::trim_common_context;
use crate::error::RedlineResult;
use crate::models::{
    BatchOutcome, DocumentEdit, EditStatus, OpKind, ReviewAction, ReviewActionType, SkipReason,
    ViewKind,
};
use crate::package::Package;
use crate::redline::comments::CommentStore;
use crate::redline::mapper::{set_text_preserve, Mapper};
use crate::xml::{NodeId, XmlTree};

const W16DU_NS: &str = "http://schemas.microsoft.com/office/word/2023/wordml/word16du";

/// Formatting overrides parsed from inline Markdown.
#[derive(Debug, Clone, Copy, Default)]
struct RunProps {
    bold: bool,
    italic: bool,
}

/// An edit with its location and operation fully resolved.
struct ResolvedEdit {
    target: String,
    new_text: String,
    comment: Option<String>,
    start: usize,
    op: OpKind,
    view: ViewKind,
}

pub struct Engine {
    pub(crate) doc: Document,
    pub(crate) comments: CommentStore,
    pub(crate) author: String,
    pub(crate) timestamp: String,
    pub(crate) current_id: u32,
    pub(crate) mapper: Mapper,
    pub(crate) clean_mapper: Option<Mapper>,
    /// Ids of deletions created in this session; a later heuristic edit
    /// matching inside one would double-apply, so it is skipped.
    pub(crate) session_del_ids: HashSet<String>,
}

impl Engine {
    /// Load a document and build the raw-view map.
    ///
    /// # Errors
    ///
    /// Returns an error when the package or a mapped part cannot be
    /// parsed.
    pub fn new(bytes: &[u8], author: &str) -> RedlineResult<Self> {
        let package = Package::from_bytes(bytes)?;
        let mut doc = Document::load(package)?;
        docx::normalize(&mut doc);
        for part in &mut doc.parts {
            let root = part.xml.root();
            if part.xml.attr(root, "xmlns:w16du").is_none() {
                part.xml.set_attr(root, "xmlns:w16du", W16DU_NS);
            }
            if let Some(ignorable) = part.xml.attr(root, "mc:Ignorable") {
                if !ignorable.split_whitespace().any(|t| t == "w16du") {
                    let extended = format!("{ignorable} w16du");
                    part.xml.set_attr(root, "mc:Ignorable", &extended);
                }
            }
        }

        let comments = CommentStore::load(&doc.package)?;
        let current_id = scan_existing_ids(&doc);
        let mapper = Mapper::build(&doc, ViewKind::Raw, comments.snapshot());

        Ok(Self {
            doc,
            comments,
            author: author.to_owned(),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            current_id,
            mapper,
            clean_mapper: None,
            session_del_ids: HashSet::new(),
        })
    }

    /// Logical text of the requested view. Builds the clean map lazily.
    pub fn text(&mut self, view: ViewKind) -> &str {
        if matches!(view, ViewKind::Clean) {
            self.ensure_clean_mapper();
        }
        self.view_mapper(view).full_text()
    }

    /// Apply a batch. Per-edit failures are recorded, never fatal.
    pub fn apply_edits(&mut self, edits: Vec<DocumentEdit>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let (mut indexed, mut heuristic): (Vec<_>, Vec<_>) =
            edits.into_iter().partition(|e| e.match_start.is_some());

        indexed.sort_by_key(|e| std::cmp::Reverse(e.match_start.unwrap_or(0)));
        let mut consumed: Vec<(usize, usize)> = Vec::new();
        for edit in indexed {
            let start = edit.match_start.unwrap_or(0);
            let end = start + edit.target_text.len();
            if consumed.iter().any(|&(s, e)| start < e && s < end) {
                outcome.record(EditStatus::skipped(&edit.target_text, SkipReason::Overlap));
                continue;
            }
            let resolved = ResolvedEdit {
                target: edit.target_text.clone(),
                new_text: edit.new_text.clone(),
                comment: edit.comment.clone(),
                start,
                op: edit
                    .op
                    .unwrap_or_else(|| classify(&edit.target_text, &edit.new_text)),
                view: edit.view,
            };
            match self.apply_indexed(&resolved) {
                Ok(()) => {
                    consumed.push((start, end));
                    outcome.record(EditStatus::applied(&edit.target_text));
                }
                Err(reason) => outcome.record(EditStatus::skipped(&edit.target_text, reason)),
            }
        }

        if !heuristic.is_empty() {
            heuristic.sort_by_key(|e| std::cmp::Reverse(e.target_text.len()));
            self.invalidate_maps();
            for edit in heuristic {
                match self.apply_heuristic(&edit) {
                    Ok(()) => {
                        outcome.record(EditStatus::applied(&edit.target_text));
                        self.invalidate_maps();
                    }
                    Err(reason) => {
                        outcome.record(EditStatus::skipped(&edit.target_text, reason));
                    }
                }
            }
        }

        if outcome.applied > 0 {
            self.invalidate_maps();
        }
        outcome
    }

    /// Accept, reject, or reply to existing markers by rendered id.
    pub fn apply_review_actions(&mut self, actions: &[ReviewAction]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for act in actions {
            let raw = act.target_id.as_str();
            let (id, is_change, is_comment) = if let Some(rest) = raw.strip_prefix("Chg:") {
                (rest, true, false)
            } else if let Some(rest) = raw.strip_prefix("Com:") {
                (rest, false, true)
            } else {
                // Bare ids from legacy callers target both kinds.
                (raw, true, true)
            };

            let success = match act.action {
                ReviewActionType::Accept => is_change && self.accept_change(id),
                ReviewActionType::Reject => is_change && self.reject_change(id),
                ReviewActionType::Reply => {
                    is_comment && self.reply_to_comment(id, act.text.as_deref().unwrap_or(""))
                }
            };
            if success {
                outcome.record(EditStatus::applied(raw));
            } else {
                outcome.record(EditStatus::skipped(raw, SkipReason::Unresolvable));
            }
        }
        if outcome.applied > 0 {
            self.invalidate_maps();
        }
        outcome
    }

    /// Accept every tracked change and strip all comment anchors.
    pub fn accept_all_revisions(&mut self) {
        for part in 0..self.doc.parts.len() {
            let tree = self.doc.tree_mut(part);
            for ins in tree.find_all("w:ins") {
                unwrap_node(tree, ins);
            }
            for del in tree.find_all("w:del") {
                tree.detach(del);
            }
            for tag in ["w:commentRangeStart", "w:commentRangeEnd", "w:commentReference"] {
                for el in tree.find_all(tag) {
                    tree.detach(el);
                }
            }
        }
        self.invalidate_maps();
    }

    /// Serialize the document, comment parts included.
    ///
    /// # Errors
    ///
    /// Returns an error when part registration or zip writing fails.
    pub fn save(&mut self) -> RedlineResult<Vec<u8>> {
        self.doc.flush_parts();
        self.comments.flush(&mut self.doc.package)?;
        self.doc.package.to_bytes()
    }

    // -----------------------------------------------------------------
    // Edit application
    // -----------------------------------------------------------------

    fn apply_heuristic(&mut self, edit: &DocumentEdit) -> Result<(), SkipReason> {
        if edit.target_text.is_empty() {
            warn!("skipping heuristic edit with empty target");
            return Err(SkipReason::EmptyTarget);
        }

        let (view, m) = match self.mapper.find_match_index(&edit.target_text) {
            Some(m) => (ViewKind::Raw, m),
            None => {
                self.ensure_clean_mapper();
                let clean_match = self
                    .clean_mapper
                    .as_ref()
                    .and_then(|cm| cm.find_match_index(&edit.target_text));
                match clean_match {
                    Some(m) => {
                        info!("matched edit against clean view");
                        (ViewKind::Clean, m)
                    }
                    None => {
                        warn!(
                            target_len = edit.target_text.len(),
                            "edit target not found in raw or clean view"
                        );
                        return Err(SkipReason::MatchNotFound);
                    }
                }
            }
        };
        let (start, len) = (m.start, m.len);

        if let Some(span) = self.view_mapper(view).context_at_range(start, start + len) {
            if let Some(del_id) = &span.del_id {
                if self.session_del_ids.contains(del_id) {
                    return Err(SkipReason::Overlap);
                }
            }
        }

        // Any overlap with an existing insertion needs special
        // handling; a deletion nested in a w:ins is invalid markup.
        let nested = {
            let spans = self.view_mapper(view).spans();
            spans
                .iter()
                .find(|s| s.ins_id.is_some() && s.start < start + len && start < s.end)
                .and_then(|s| s.ins_id.clone())
        };
        if let Some(ins_id) = nested {
            let insertion = {
                let spans = self.view_mapper(view).spans();
                let ins_spans: Vec<_> = spans
                    .iter()
                    .filter(|s| s.ins_id.as_deref() == Some(ins_id.as_str()))
                    .collect();
                ins_spans.first().map(|first| {
                    let text: String = ins_spans.iter().map(|s| s.text.as_str()).collect();
                    (first.start, text)
                })
            };
            if let Some((ins_start, full_ins_text)) = insertion {
                let ins_end = ins_start + full_ins_text.len();
                if ins_start <= start && start + len <= ins_end {
                    // Wholly inside: replace the whole insertion so the
                    // surrounding inserted context is not lost.
                    let rel = start - ins_start;
                    let expanded = format!(
                        "{}{}{}",
                        &full_ins_text[..rel],
                        edit.new_text,
                        &full_ins_text[rel + len..]
                    );
                    let proxy = ResolvedEdit {
                        op: classify(&full_ins_text, &expanded),
                        target: full_ins_text,
                        new_text: expanded,
                        comment: edit.comment.clone(),
                        start: ins_start,
                        view,
                    };
                    return self.apply_indexed(&proxy);
                }
                // The match spills over the insertion boundary. Reverse
                // the insertion, then retry against the rebuilt text
                // with the inserted characters removed from the target.
                let retry_target = {
                    let text = self.view_mapper(view).full_text();
                    let keep_start = ins_start.max(start);
                    let keep_end = ins_end.min(start + len);
                    format!("{}{}", &text[start..keep_start], &text[keep_end..start + len])
                };
                info!(ins_id = %ins_id, "match spans a pending insertion; rejecting and retrying");
                self.reject_change(&ins_id);
                self.invalidate_maps();
                let retry = DocumentEdit {
                    target_text: retry_target,
                    new_text: edit.new_text.clone(),
                    comment: edit.comment.clone(),
                    match_start: None,
                    op: None,
                    view: edit.view,
                };
                return self.apply_heuristic(&retry);
            }
        }

        // Fuzzy strategies can match text that differs from the edit's
        // target; trim against what the document actually holds.
        let actual = self.view_mapper(view).full_text()[start..start + len].to_owned();
        if actual == edit.new_text {
            return Err(SkipReason::NoChange);
        }

        let (final_target, final_new, effective_start, op);
        if edit.new_text.starts_with(&actual) {
            // Pure append: keep the matched text, insert the rest after.
            op = OpKind::Insertion;
            final_target = String::new();
            final_new = edit.new_text[actual.len()..].to_owned();
            effective_start = start + len;
        } else {
            let (prefix_len, suffix_len) = trim_common_context(&actual, &edit.new_text);
            let t_end = actual.len() - suffix_len;
            let n_end = edit.new_text.len() - suffix_len;
            final_target = actual[prefix_len..t_end].to_owned();
            final_new = edit.new_text[prefix_len..n_end].to_owned();
            effective_start = start + prefix_len;

            op = match (final_target.is_empty(), final_new.is_empty()) {
                (true, false) => OpKind::Insertion,
                (false, true) => OpKind::Deletion,
                (false, false) => OpKind::Modification,
                (true, true) => return Err(SkipReason::NoChange),
            };

            if !actual.is_empty() {
                let ratio = final_target.len() as f64 / actual.len() as f64;
                if ratio > 0.8 {
                    warn!(ratio, "edit rewrites most of its matched context");
                }
            }
        }

        let proxy = ResolvedEdit {
            target: final_target,
            new_text: final_new,
            comment: edit.comment.clone(),
            start: effective_start,
            op,
            view,
        };
        self.apply_indexed(&proxy)
    }

    fn apply_indexed(&mut self, edit: &ResolvedEdit) -> Result<(), SkipReason> {
        let start = edit.start;
        let len = edit.target.len();
        debug!(start, len, op = ?edit.op, "applying edit");

        if len > 0 {
            if let Some(span) = self
                .view_mapper(edit.view)
                .context_at_range(start, start + len)
                .cloned()
            {
                if let Some(ins_id) = span.ins_id {
                    info!(ins_id, "edit falls inside a tracked insertion; replacing it");
                    return self.replace_insertion(&ins_id, edit);
                }
            }
        }

        match edit.op {
            OpKind::Insertion => self.apply_insertion(edit),
            OpKind::Deletion | OpKind::Modification => {
                let runs = self.resolve_runs_in_view(edit.view, start, start + len);
                if runs.is_empty() {
                    return Err(SkipReason::Unresolvable);
                }
                if edit.op == OpKind::Deletion {
                    for run in runs {
                        self.track_delete_run(run);
                    }
                    Ok(())
                } else {
                    self.apply_modification(edit, &runs)
                }
            }
        }
    }

    /// Reject an existing insertion and re-apply the union text as a
    /// fresh insertion at the same position.
    fn replace_insertion(&mut self, ins_id: &str, edit: &ResolvedEdit) -> Result<(), SkipReason> {
        let ins_nodes = self.doc.find_by_id("w:ins", ins_id);
        let Some(&first) = ins_nodes.first() else {
            return Err(SkipReason::Unresolvable);
        };
        let tree = self.doc.tree(first.part);
        let Some(parent) = tree.parent(first.node) else {
            return Err(SkipReason::Unresolvable);
        };
        let Some(index) = tree.position(first.node) else {
            return Err(SkipReason::Unresolvable);
        };
        // Detached nodes stay readable, so this run still works as a
        // style source after the rejection below.
        let style_source = tree.child_by_tag(first.node, "w:r").map(|r| NodeRef {
            part: first.part,
            node: r,
        });

        self.reject_change(ins_id);

        if !edit.new_text.is_empty() {
            let ins_elem = self.track_insert(
                first.part,
                &edit.new_text,
                style_source,
                edit.comment.as_deref(),
            );
            if let Some(ins_elem) = ins_elem {
                self.doc.tree_mut(first.part).insert(parent, index, ins_elem);
                if let Some(comment) = &edit.comment {
                    self.attach_comment(first.part, parent, ins_elem, ins_elem, comment);
                }
            }
        }
        Ok(())
    }

    fn apply_insertion(&mut self, edit: &ResolvedEdit) -> Result<(), SkipReason> {
        let Some(anchor) = self.insertion_anchor_in_view(edit.view, edit.start) else {
            return Err(SkipReason::Unresolvable);
        };
        let tree = self.doc.tree(anchor.part);
        let Some(parent) = tree.parent(anchor.node) else {
            return Err(SkipReason::Unresolvable);
        };
        let Some(index) = tree.position(anchor.node) else {
            return Err(SkipReason::Unresolvable);
        };

        let (style_run, insert_at) = if edit.start == 0 {
            (anchor, index)
        } else {
            let next = next_sibling_run(tree, anchor.node).map(|n| NodeRef {
                part: anchor.part,
                node: n,
            });
            (determine_style_source(anchor, next, &edit.new_text), index + 1)
        };

        let ins_elem = self.track_insert(
            anchor.part,
            &edit.new_text,
            Some(style_run),
            edit.comment.as_deref(),
        );
        if let Some(ins_elem) = ins_elem {
            self.doc
                .tree_mut(anchor.part)
                .insert(parent, insert_at, ins_elem);
            if let Some(comment) = &edit.comment {
                self.attach_comment(anchor.part, parent, ins_elem, ins_elem, comment);
            }
        }
        Ok(())
    }

    fn apply_modification(
        &mut self,
        edit: &ResolvedEdit,
        runs: &[NodeRef],
    ) -> Result<(), SkipReason> {
        let mut first_del: Option<NodeRef> = None;
        let mut last_del: Option<NodeRef> = None;
        let mut last_run: Option<NodeRef> = None;
        for run in runs {
            if let Some(del) = self.track_delete_run(*run) {
                if first_del.is_none() {
                    first_del = Some(del);
                }
                last_del = Some(del);
                last_run = Some(*run);
            }
        }
        let (Some(first_del), Some(last_del), Some(last_run)) = (first_del, last_del, last_run)
        else {
            return Err(SkipReason::Unresolvable);
        };
        if edit.new_text.is_empty() {
            return Ok(());
        }

        let (parent, del_index, text_to_insert) = {
            let tree = self.doc.tree(last_del.part);
            let Some(parent) = tree.parent(last_del.node) else {
                return Err(SkipReason::Unresolvable);
            };
            let Some(del_index) = tree.position(last_del.node) else {
                return Err(SkipReason::Unresolvable);
            };

            // Re-applying the paragraph's own heading style must not
            // spawn a new paragraph; strip the prefix and stay inline.
            let mut text_to_insert = edit.new_text.clone();
            let (clean_text, style_name) = parse_markdown_style(&edit.new_text);
            if let Some(style_name) = &style_name {
                if let Some(p) = ancestor_paragraph(tree, last_del.node) {
                    let current = tree
                        .child_by_tag(p, "w:pPr")
                        .and_then(|ppr| tree.child_by_tag(ppr, "w:pStyle"))
                        .and_then(|s| tree.attr(s, "w:val"))
                        .and_then(|id| self.doc.styles.name_of(id));
                    if current == Some(style_name.as_str()) {
                        text_to_insert = clean_text.to_owned();
                    }
                }
            }
            (parent, del_index, text_to_insert)
        };

        let ins_elem = self.track_insert(
            last_del.part,
            &text_to_insert,
            Some(last_run),
            edit.comment.as_deref(),
        );
        if let Some(ins_elem) = ins_elem {
            self.doc
                .tree_mut(last_del.part)
                .insert(parent, del_index + 1, ins_elem);

            if let Some(comment) = &edit.comment {
                let tree = self.doc.tree(last_del.part);
                let start_p = tree.parent(first_del.node);
                let end_p = tree.parent(ins_elem);
                match (start_p, end_p) {
                    (Some(sp), Some(ep)) if sp == ep => {
                        self.attach_comment(last_del.part, sp, first_del.node, ins_elem, comment);
                    }
                    (Some(sp), Some(ep)) => {
                        self.attach_comment_spanning(
                            last_del.part,
                            sp,
                            first_del.node,
                            ep,
                            ins_elem,
                            comment,
                        );
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tracked-markup primitives
    // -----------------------------------------------------------------

    fn next_id(&mut self) -> String {
        self.current_id += 1;
        self.current_id.to_string()
    }

    pub(crate) fn create_change_marker(&mut self, part: usize, tag: &str) -> NodeId {
        let id = self.next_id();
        if tag == "w:del" {
            self.session_del_ids.insert(id.clone());
        }
        let author = self.author.clone();
        let date = self.timestamp.clone();
        let tree = self.doc.tree_mut(part);
        let node = tree.create(tag);
        tree.set_attr(node, "w:id", &id);
        tree.set_attr(node, "w:author", &author);
        tree.set_attr(node, "w:date", &date);
        tree.set_attr(node, "w16du:dateUtc", &date);
        node
    }

    /// Wrap `run` in a fresh deletion marker, converting its text to
    /// `w:delText`. Returns the marker.
    pub(crate) fn track_delete_run(&mut self, run: NodeRef) -> Option<NodeRef> {
        let del = self.create_change_marker(run.part, "w:del");
        let tree = self.doc.tree_mut(run.part);
        if tree.parent(run.node).is_none() {
            return None;
        }
        let new_run = tree.create("w:r");
        if let Some(rpr) = tree.child_by_tag(run.node, "w:rPr") {
            let copy = tree.deep_clone(rpr);
            tree.append(new_run, copy);
        }
        let text = docx::run_text(tree, run.node);
        let del_text = tree.create("w:delText");
        set_text_preserve(tree, del_text, &text);
        tree.append(new_run, del_text);
        tree.append(del, new_run);
        tree.replace(run.node, del);
        Some(NodeRef {
            part: run.part,
            node: del,
        })
    }

    /// Build insertion markup for `text`. Returns the unplaced inline
    /// `w:ins` element, or `None` when the text was block-level (new
    /// paragraphs placed directly after the anchor's paragraph).
    pub(crate) fn track_insert(
        &mut self,
        part: usize,
        text: &str,
        anchor: Option<NodeRef>,
        comment: Option<&str>,
    ) -> Option<NodeId> {
        let lines: Vec<String> = newline_re().split(text).map(str::to_owned).collect();
        let first = lines.first()?;

        let (_, first_style) = parse_markdown_style(first);
        if first_style.is_some() {
            // Heading first line: everything becomes new paragraphs.
            let anchor = anchor?;
            let created = self.append_insertion_paragraphs(part, &lines, anchor)?;
            if let Some(comment) = comment {
                if let (Some(&(start_p, start_ins)), Some(&(end_p, end_ins))) =
                    (created.first(), created.last())
                {
                    if start_p == end_p {
                        self.attach_comment(part, start_p, start_ins, start_ins, comment);
                    } else {
                        self.attach_comment_spanning(
                            part, start_p, start_ins, end_p, end_ins, comment,
                        );
                    }
                }
            }
            return None;
        }

        let ins = self.build_inline_insertion(part, first, anchor);

        let mut remaining: Vec<String> = lines[1..].to_vec();
        if remaining.last().is_some_and(String::is_empty) {
            remaining.pop();
        }
        if !remaining.is_empty() {
            if let Some(anchor) = anchor {
                self.append_insertion_paragraphs(part, &remaining, anchor);
            }
        }
        Some(ins)
    }

    /// One `w:ins` holding the parsed inline-Markdown segments of a
    /// single line. Not yet attached to the tree.
    fn build_inline_insertion(
        &mut self,
        part: usize,
        text: &str,
        anchor: Option<NodeRef>,
    ) -> NodeId {
        let ins = self.create_change_marker(part, "w:ins");
        let mut segments = Vec::new();
        parse_inline_markdown(text, RunProps::default(), &mut segments);

        let tree = self.doc.tree_mut(part);
        for (seg_text, props) in segments {
            let run = tree.create("w:r");
            if let Some(anchor) = anchor {
                if let Some(rpr) = tree.child_by_tag(anchor.node, "w:rPr") {
                    let copy = tree.deep_clone(rpr);
                    tree.append(run, copy);
                }
            }
            apply_run_props(tree, run, props);
            let t = tree.create("w:t");
            set_text_preserve(tree, t, &seg_text);
            tree.append(run, t);
            tree.append(ins, run);
        }
        ins
    }

    /// Insert one new tracked paragraph per line after the anchor's
    /// paragraph. Returns `(paragraph, ins)` pairs in document order.
    fn append_insertion_paragraphs(
        &mut self,
        part: usize,
        lines: &[String],
        anchor: NodeRef,
    ) -> Option<Vec<(NodeId, NodeId)>> {
        let tree = self.doc.tree(part);
        let paragraph = ancestor_paragraph(tree, anchor.node)?;
        let body = tree.parent(paragraph)?;
        let p_index = tree.position(paragraph)?;

        let mut created = Vec::new();
        let mut placed = 0usize;
        for line in lines {
            let (clean_text, style_name) = parse_markdown_style(line);
            if clean_text.is_empty() && style_name.is_none() {
                continue;
            }
            let clean_text = clean_text.to_owned();
            let style_id = style_name.as_ref().map(|n| self.doc.styles.id_for_name(n));
            let ins = self.create_change_marker(part, "w:ins");

            let mut segments = Vec::new();
            parse_inline_markdown(&clean_text, RunProps::default(), &mut segments);

            let tree = self.doc.tree_mut(part);
            let new_p = tree.create("w:p");
            if let Some(style_id) = style_id {
                set_paragraph_style(tree, new_p, &style_id);
            } else if let Some(ppr) = tree.child_by_tag(paragraph, "w:pPr") {
                let copy = tree.deep_clone(ppr);
                tree.insert(new_p, 0, copy);
            }

            for (seg_text, props) in segments {
                let run = tree.create("w:r");
                if let Some(rpr) = tree.child_by_tag(anchor.node, "w:rPr") {
                    let copy = tree.deep_clone(rpr);
                    tree.append(run, copy);
                }
                apply_run_props(tree, run, props);
                let t = tree.create("w:t");
                set_text_preserve(tree, t, &seg_text);
                tree.append(run, t);
                tree.append(ins, run);
            }

            tree.append(new_p, ins);
            tree.insert(body, p_index + 1 + placed, new_p);
            created.push((new_p, ins));
            placed += 1;
        }
        Some(created)
    }

    // -----------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------

    fn attach_comment(
        &mut self,
        part: usize,
        parent: NodeId,
        start_el: NodeId,
        end_el: NodeId,
        text: &str,
    ) {
        if text.is_empty() {
            return;
        }
        let comment_id = self.comments.add(&self.author, text, None);
        let tree = self.doc.tree_mut(part);
        let range_start = tree.create("w:commentRangeStart");
        tree.set_attr(range_start, "w:id", &comment_id);
        let range_end = tree.create("w:commentRangeEnd");
        tree.set_attr(range_end, "w:id", &comment_id);
        let ref_run = comment_reference_run(tree, &comment_id);

        let Some(start_index) = tree.position(start_el) else {
            return;
        };
        tree.insert(parent, start_index, range_start);
        let Some(end_index) = tree.position(end_el) else {
            return;
        };
        tree.insert(parent, end_index + 1, range_end);
        tree.insert(parent, end_index + 2, ref_run);
    }

    fn attach_comment_spanning(
        &mut self,
        part: usize,
        start_p: NodeId,
        start_el: NodeId,
        end_p: NodeId,
        end_el: NodeId,
        text: &str,
    ) {
        if text.is_empty() {
            return;
        }
        let comment_id = self.comments.add(&self.author, text, None);
        let tree = self.doc.tree_mut(part);
        let range_start = tree.create("w:commentRangeStart");
        tree.set_attr(range_start, "w:id", &comment_id);
        let range_end = tree.create("w:commentRangeEnd");
        tree.set_attr(range_end, "w:id", &comment_id);
        let ref_run = comment_reference_run(tree, &comment_id);

        if let Some(idx) = tree.position(start_el) {
            tree.insert(start_p, idx, range_start);
        }
        if let Some(idx) = tree.position(end_el) {
            tree.insert(end_p, idx + 1, range_end);
            tree.insert(end_p, idx + 2, ref_run);
        }
    }

    fn reply_to_comment(&mut self, parent_id: &str, text: &str) -> bool {
        if !self.comments.snapshot().contains_key(parent_id) {
            return false;
        }
        let new_id = self.comments.add(&self.author, text, Some(parent_id));
        self.anchor_reply(parent_id, &new_id);
        true
    }

    /// Anchor a reply to the parent comment's range. The new reference
    /// run goes after the parent's, which is the order readers expect
    /// for threading.
    fn anchor_reply(&mut self, parent_id: &str, new_id: &str) {
        let starts = self.doc.find_by_id("w:commentRangeStart", parent_id);
        let Some(&parent_start) = starts.first() else {
            warn!(parent_id, "parent comment range not found for reply");
            return;
        };
        let tree = self.doc.tree_mut(parent_start.part);
        let new_start = tree.create("w:commentRangeStart");
        tree.set_attr(new_start, "w:id", new_id);
        tree.insert_after(parent_start.node, new_start);

        let ends = self.doc.find_by_id("w:commentRangeEnd", parent_id);
        let Some(&parent_end) = ends.first() else {
            return;
        };

        let refs = self.doc.find_by_id("w:commentReference", parent_id);
        let insertion_point = refs
            .first()
            .and_then(|r| {
                let tree = self.doc.tree(r.part);
                tree.parent(r.node).filter(|&p| tree.tag(p) == "w:r")
            })
            .unwrap_or(parent_end.node);

        let tree = self.doc.tree_mut(parent_end.part);
        let new_end = tree.create("w:commentRangeEnd");
        tree.set_attr(new_end, "w:id", new_id);
        tree.insert_after(insertion_point, new_end);

        let ref_run = comment_reference_run(tree, new_id);
        tree.insert_after(new_end, ref_run);
    }

    // -----------------------------------------------------------------
    // Review actions
    // -----------------------------------------------------------------

    fn accept_change(&mut self, id: &str) -> bool {
        let ins_nodes = self.doc.find_by_id("w:ins", id);
        for n in &ins_nodes {
            unwrap_node(self.doc.tree_mut(n.part), n.node);
        }
        let del_nodes = self.doc.find_by_id("w:del", id);
        for d in &del_nodes {
            self.doc.tree_mut(d.part).detach(d.node);
        }
        !ins_nodes.is_empty() || !del_nodes.is_empty()
    }

    fn reject_change(&mut self, id: &str) -> bool {
        let ins_nodes = self.doc.find_by_id("w:ins", id);
        for n in &ins_nodes {
            self.doc.tree_mut(n.part).detach(n.node);
        }
        let del_nodes = self.doc.find_by_id("w:del", id);
        for d in &del_nodes {
            let tree = self.doc.tree_mut(d.part);
            for run in tree.children(d.node).to_vec() {
                for leaf in tree.children(run).to_vec() {
                    if tree.tag(leaf) == "w:delText" {
                        tree.set_tag(leaf, "w:t");
                    }
                }
            }
            unwrap_node(tree, d.node);
        }
        !ins_nodes.is_empty() || !del_nodes.is_empty()
    }

    // -----------------------------------------------------------------
    // Mapper access
    // -----------------------------------------------------------------

    pub(crate) fn invalidate_maps(&mut self) {
        // Full rebuild with a fresh snapshot so comments added during
        // the batch render in the metadata blocks.
        self.mapper = Mapper::build(&self.doc, ViewKind::Raw, self.comments.snapshot());
        self.clean_mapper = None;
    }

    pub(crate) fn ensure_clean_mapper(&mut self) {
        if self.clean_mapper.is_none() {
            self.clean_mapper = Some(Mapper::build(
                &self.doc,
                ViewKind::Clean,
                self.comments.snapshot(),
            ));
        }
    }

    pub(crate) fn view_mapper(&self, view: ViewKind) -> &Mapper {
        match view {
            ViewKind::Raw => &self.mapper,
            ViewKind::Clean => self.clean_mapper.as_ref().unwrap_or(&self.mapper),
        }
    }

    fn resolve_runs_in_view(&mut self, view: ViewKind, start: usize, end: usize) -> Vec<NodeRef> {
        match view {
            ViewKind::Raw => self.mapper.resolve_runs(&mut self.doc, start, end),
            ViewKind::Clean => {
                self.ensure_clean_mapper();
                match self.clean_mapper.as_mut() {
                    Some(m) => m.resolve_runs(&mut self.doc, start, end),
                    None => Vec::new(),
                }
            }
        }
    }

    fn insertion_anchor_in_view(&mut self, view: ViewKind, index: usize) -> Option<NodeRef> {
        match view {
            ViewKind::Raw => self.mapper.insertion_anchor(&mut self.doc, index),
            ViewKind::Clean => {
                self.ensure_clean_mapper();
                self.clean_mapper
                    .as_mut()
                    .and_then(|m| m.insertion_anchor(&mut self.doc, index))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn classify(target: &str, new_text: &str) -> OpKind {
    match (target.is_empty(), new_text.is_empty()) {
        (true, false) => OpKind::Insertion,
        (false, true) => OpKind::Deletion,
        _ => OpKind::Modification,
    }
}

fn scan_existing_ids(doc: &Document) -> u32 {
    let mut max_id = 0;
    for part in &doc.parts {
        for tag in ["w:ins", "w:del"] {
            for node in part.xml.find_all(tag) {
                if let Some(id) = part.xml.attr(node, "w:id").and_then(|v| v.parse().ok()) {
                    max_id = max_id.max(id);
                }
            }
        }
    }
    max_id
}

fn newline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\r\n]+").unwrap())
}

fn inline_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\*\*.*?\*\*)|(_.*?_)").unwrap())
}

/// `# Title` → `("Title", Some("Heading 1"))`; plain text passes through.
fn parse_markdown_style(text: &str) -> (&str, Option<String>) {
    let stripped = text.trim_start_matches('#');
    let level = text.len() - stripped.len();
    if level > 0 {
        if let Some(rest) = stripped.strip_prefix(' ') {
            return (rest.trim(), Some(format!("Heading {level}")));
        }
    }
    (text, None)
}

/// Flatten `**bold**` / `_italic_` (arbitrarily nested, leftmost-first)
/// into plain segments with combined formatting.
fn parse_inline_markdown(text: &str, base: RunProps, out: &mut Vec<(String, RunProps)>) {
    if text.is_empty() {
        return;
    }
    let Some(caps) = inline_token_re().captures(text) else {
        out.push((text.to_owned(), base));
        return;
    };
    let Some(whole) = caps.get(0) else {
        out.push((text.to_owned(), base));
        return;
    };

    let (inner, inner_props) = if let Some(bold) = caps.get(1) {
        let raw = bold.as_str();
        (&raw[2..raw.len() - 2], RunProps { bold: true, ..base })
    } else if let Some(italic) = caps.get(2) {
        let raw = italic.as_str();
        (
            &raw[1..raw.len() - 1],
            RunProps {
                italic: true,
                ..base
            },
        )
    } else {
        out.push((text.to_owned(), base));
        return;
    };

    if whole.start() > 0 {
        out.push((text[..whole.start()].to_owned(), base));
    }
    parse_inline_markdown(inner, inner_props, out);
    parse_inline_markdown(&text[whole.end()..], base, out);
}

fn apply_run_props(tree: &mut XmlTree, run: NodeId, props: RunProps) {
    if !props.bold && !props.italic {
        return;
    }
    let rpr = match tree.child_by_tag(run, "w:rPr") {
        Some(rpr) => rpr,
        None => {
            let rpr = tree.create("w:rPr");
            tree.insert(run, 0, rpr);
            rpr
        }
    };
    if props.bold {
        let b = tree.create("w:b");
        tree.append(rpr, b);
    }
    if props.italic {
        let i = tree.create("w:i");
        tree.append(rpr, i);
    }
}

fn set_paragraph_style(tree: &mut XmlTree, p: NodeId, style_id: &str) {
    if let Some(existing) = tree.child_by_tag(p, "w:pPr") {
        tree.detach(existing);
    }
    let ppr = tree.create("w:pPr");
    let pstyle = tree.create("w:pStyle");
    tree.set_attr(pstyle, "w:val", style_id);
    tree.append(ppr, pstyle);
    tree.insert(p, 0, ppr);
}

fn comment_reference_run(tree: &mut XmlTree, comment_id: &str) -> NodeId {
    let run = tree.create("w:r");
    let rpr = tree.create("w:rPr");
    let rstyle = tree.create("w:rStyle");
    tree.set_attr(rstyle, "w:val", "CommentReference");
    tree.append(rpr, rstyle);
    tree.append(run, rpr);
    let reference = tree.create("w:commentReference");
    tree.set_attr(reference, "w:id", comment_id);
    tree.append(run, reference);
    run
}

/// Replace a node with its children, in place.
fn unwrap_node(tree: &mut XmlTree, node: NodeId) {
    let Some(parent) = tree.parent(node) else {
        return;
    };
    let Some(mut index) = tree.position(node) else {
        return;
    };
    for child in tree.children(node).to_vec() {
        tree.insert(parent, index, child);
        index += 1;
    }
    tree.detach(node);
}

fn next_sibling_run(tree: &XmlTree, run: NodeId) -> Option<NodeId> {
    let mut curr = run;
    while let Some(next) = tree.next_sibling(curr) {
        if tree.tag(next) == "w:r" {
            return Some(next);
        }
        curr = next;
    }
    None
}

fn ancestor_paragraph(tree: &XmlTree, node: NodeId) -> Option<NodeId> {
    let mut curr = tree.parent(node);
    while let Some(n) = curr {
        if tree.tag(n) == "w:p" {
            return Some(n);
        }
        curr = tree.parent(n);
    }
    None
}

/// New text ending in a space reads as the start of the following
/// phrase, so it inherits the next run's formatting.
fn determine_style_source(prev: NodeRef, next: Option<NodeRef>, insert_text: &str) -> NodeRef {
    match next {
        Some(next) if !insert_text.is_empty() && insert_text.ends_with(' ') => next,
        _ => prev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docx_bytes(body: &str) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("[Content_Types].xml", options).unwrap();
        writer
            .write_all(
                br#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#,
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
    fn test_modification_produces_del_and_ins() {
        let mut e = engine(
            "<w:p><w:r><w:t>The supplier shall deliver goods on time.</w:t></w:r></w:p>",
        );
        let outcome =
            e.apply_edits(vec![DocumentEdit::new("shall deliver goods", "shall ship goods")]);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 0);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{--deliver--}"), "{text}");
        assert!(text.contains("{++ship++}"), "{text}");
        assert!(text.contains("[Chg:1] Reviewer"), "{text}");
        // Untouched context stays unwrapped.
        assert!(text.starts_with("The supplier shall "), "{text}");
    }

    #[test]
    fn test_clean_view_shows_result() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship")]);
        assert_eq!(e.text(ViewKind::Clean), "shall ship goods");
    }

    #[test]
    fn test_accept_both_changes_yields_final_text() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship")]);
        let outcome = e.apply_review_actions(&[
            ReviewAction {
                action: ReviewActionType::Accept,
                target_id: "Chg:1".to_owned(),
                text: None,
            },
            ReviewAction {
                action: ReviewActionType::Accept,
                target_id: "Chg:2".to_owned(),
                text: None,
            },
        ]);
        assert_eq!(outcome.applied, 2);
        assert_eq!(e.text(ViewKind::Raw), "shall ship goods");
    }

    #[test]
    fn test_reject_restores_original_text() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship")]);
        e.apply_review_actions(&[
            ReviewAction {
                action: ReviewActionType::Reject,
                target_id: "Chg:1".to_owned(),
                text: None,
            },
            ReviewAction {
                action: ReviewActionType::Reject,
                target_id: "Chg:2".to_owned(),
                text: None,
            },
        ]);
        assert_eq!(e.text(ViewKind::Raw), "shall deliver goods");
    }

    #[test]
    fn test_indexed_insertion_at_offset_zero() {
        let mut e = engine("<w:p><w:r><w:t>Hello world</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![DocumentEdit::new("", "Note: ").at_offset(0)]);
        assert_eq!(outcome.applied, 1);
        assert!(e.text(ViewKind::Raw).starts_with("{++Note: ++}"));
        assert_eq!(e.text(ViewKind::Clean), "Note: Hello world");
    }

    #[test]
    fn test_overlapping_indexed_edits_skip_later() {
        let mut e = engine("<w:p><w:r><w:t>alpha beta gamma</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![
            DocumentEdit::new("beta gamma", "B G").at_offset(6),
            DocumentEdit::new("alpha beta", "A B").at_offset(0),
        ]);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(
            outcome.statuses.iter().filter(|s| !s.applied).count(),
            1
        );
        assert!(outcome
            .statuses
            .iter()
            .any(|s| s.reason == Some(SkipReason::Overlap)));
    }

    #[test]
    fn test_empty_target_heuristic_skipped() {
        let mut e = engine("<w:p><w:r><w:t>text</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![DocumentEdit::new("", "new")]);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.statuses[0].reason, Some(SkipReason::EmptyTarget));
    }

    #[test]
    fn test_missing_target_skipped_not_fatal() {
        let mut e = engine("<w:p><w:r><w:t>actual content</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![
            DocumentEdit::new("no such text", "x"),
            DocumentEdit::new("actual", "real"),
        ]);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_edit_with_comment_attaches_anchor() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![
            DocumentEdit::new("deliver", "ship").with_comment("tightened wording")
        ]);
        assert_eq!(outcome.applied, 1);
        let snapshot = e.comments.snapshot();
        assert_eq!(snapshot.len(), 1);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("tightened wording"), "{text}");
        assert!(text.contains("[Com:1] Reviewer"), "{text}");
    }

    #[test]
    fn test_reply_threads_to_existing_comment() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship").with_comment("why?")]);
        let outcome = e.apply_review_actions(&[ReviewAction {
            action: ReviewActionType::Reply,
            target_id: "Com:1".to_owned(),
            text: Some("because of the SLA".to_owned()),
        }]);
        assert_eq!(outcome.applied, 1);
        let snapshot = e.comments.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["2"].parent_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_edit_inside_insertion_replaces_whole_insertion() {
        let mut e = engine("<w:p><w:r><w:t>base text</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("base", "fresh new")]);
        // "fresh new" now lives inside a w:ins; editing part of it must
        // not nest a deletion inside the insertion.
        e.apply_edits(vec![DocumentEdit::new("fresh", "crisp")]);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{++crisp new++}"), "{text}");
        assert!(!text.contains("fresh"), "{text}");
        assert_eq!(e.text(ViewKind::Clean), "crisp new text");
    }

    #[test]
    fn test_pure_append_becomes_insertion() {
        let mut e = engine("<w:p><w:r><w:t>Delivery within 30 days</w:t></w:r></w:p>");
        let outcome = e.apply_edits(vec![DocumentEdit::new(
            "within 30 days",
            "within 30 days of acceptance",
        )]);
        assert_eq!(outcome.applied, 1);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{++ of acceptance++}"), "{text}");
        assert!(!text.contains("{--"), "{text}");
    }

    #[test]
    fn test_accept_all_revisions_flattens() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship").with_comment("note")]);
        e.accept_all_revisions();
        assert_eq!(e.text(ViewKind::Raw), "shall ship goods");
    }

    #[test]
    fn test_bold_markdown_insert() {
        let mut e = engine("<w:p><w:r><w:t>plain start</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("start", "start is **vital** here")]);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("**vital**"), "{text}");
    }

    #[test]
    fn test_new_ids_continue_from_existing() {
        let mut e = engine(
            r#"<w:p><w:ins w:id="7" w:author="X"><w:r><w:t>kept </w:t></w:r></w:ins><w:r><w:t>shall deliver goods</w:t></w:r></w:p>"#,
        );
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship")]);
        let text = e.text(ViewKind::Raw).to_owned();
        assert!(text.contains("[Chg:8]"), "{text}");
    }

    #[test]
    fn test_parse_markdown_style() {
        assert_eq!(
            parse_markdown_style("## Terms"),
            ("Terms", Some("Heading 2".to_owned()))
        );
        assert_eq!(parse_markdown_style("#NoSpace"), ("#NoSpace", None));
        assert_eq!(parse_markdown_style("plain"), ("plain", None));
    }

    #[test]
    fn test_parse_inline_markdown_nesting() {
        let mut segments = Vec::new();
        parse_inline_markdown("a **b _c_** d", RunProps::default(), &mut segments);
        let texts: Vec<&str> = segments.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(texts, vec!["a ", "b ", "c", " d"]);
        assert!(segments[1].1.bold && !segments[1].1.italic);
        assert!(segments[2].1.bold && segments[2].1.italic);
        assert!(!segments[3].1.bold);
    }

    #[test]
    fn test_save_roundtrip_preserves_markup() {
        let mut e = engine("<w:p><w:r><w:t>shall deliver goods</w:t></w:r></w:p>");
        e.apply_edits(vec![DocumentEdit::new("deliver", "ship")]);
        let bytes = e.save().unwrap();
        let mut reloaded = Engine::new(&bytes, "Reviewer").unwrap();
        let text = reloaded.text(ViewKind::Raw).to_owned();
        assert!(text.contains("{--deliver--}"), "{text}");
        assert!(text.contains("{++ship++}"), "{text}");
    }
}

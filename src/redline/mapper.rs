//! Logical text mapper.
//!
//! Projects the document tree into one flat string (the *logical text*)
//! plus an ordered span list tying every character range back to the
//! run node that produced it. Virtual spans (markup wrappers, heading
//! prefixes, separators, metadata blocks) carry no run; real spans do.
//!
//! The raw view renders existing tracked changes as CriticMarkup
//! (`{--del--}`, `{++ins++}`, commented ranges as `{==text==}`) followed
//! by one `{>>...<<}` metadata block per marker group. The clean view
//! renders the document as if every change were accepted: deleted text
//! hidden, inserted text unwrapped, no metadata.
//!
//! Offsets are byte offsets into `full_text`. The map is rebuilt after
//! any mutation that changes run structure; node handles held by spans
//! stay valid across rebuilds because the arena never reuses them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::docx::{
    self, block_items, paragraph_items, part_container, run_style_markers, run_text, BlockItem,
    Document, DocxEvent, EventKind, NodeRef, ParaItem,
};
use crate::edit::{self, Match, MatchMode};
use crate::models::ViewKind;
use crate::redline::comments::CommentData;
use crate::xml::{NodeId, XmlTree};

/// One contiguous range of the logical text.
#[derive(Debug, Clone)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Backing run node; `None` for virtual spans.
    pub run: Option<NodeRef>,
    pub paragraph: Option<NodeRef>,
    /// Id of the enclosing `w:ins`, when inside a tracked insertion.
    pub ins_id: Option<String>,
    /// Id of the enclosing `w:del`, when inside a tracked deletion.
    pub del_id: Option<String>,
}

/// The logical text map for one view of a document.
#[derive(Debug, Clone)]
pub struct Mapper {
    view: ViewKind,
    full_text: String,
    spans: Vec<Span>,
    comments: BTreeMap<String, CommentData>,
}

impl Mapper {
    /// Build the map for `view`. `comments` is the metadata used when
    /// rendering `{>>...<<}` blocks; it is retained for rebuilds.
    pub fn build(doc: &Document, view: ViewKind, comments: BTreeMap<String, CommentData>) -> Self {
        let mut mapper = Self {
            view,
            full_text: String::new(),
            spans: Vec::new(),
            comments,
        };
        mapper.rebuild(doc);
        mapper
    }

    /// Re-project the document. Span offsets and run handles are
    /// refreshed; the comment metadata snapshot is kept.
    pub fn rebuild(&mut self, doc: &Document) {
        let mut builder = Builder {
            doc,
            view: self.view,
            comments: &self.comments,
            spans: Vec::new(),
            full_text: String::new(),
        };
        for part in 0..doc.parts.len() {
            builder.map_part(part);
            if builder.last_text() != Some("\n\n") {
                builder.add_virtual("\n\n", None);
            }
        }
        // Trim trailing separators.
        while builder.last_text() == Some("\n\n") {
            let span = builder.spans.pop();
            if let Some(span) = span {
                builder.full_text.truncate(span.start);
            }
        }
        self.spans = builder.spans;
        self.full_text = builder.full_text;
        debug!(view = ?self.view, len = self.full_text.len(), spans = self.spans.len(), "map built");
    }

    pub fn view(&self) -> ViewKind {
        self.view
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Locate `target` in the logical text via the strategy chain.
    pub fn find_match_index(&self, target: &str) -> Option<Match> {
        edit::find_match(&self.full_text, target, MatchMode::Plain)
    }

    /// The first real span overlapping the range; tells the caller
    /// whether a range sits inside an existing tracked change.
    pub fn context_at_range(&self, start: usize, end: usize) -> Option<&Span> {
        self.spans
            .iter()
            .find(|s| s.run.is_some() && s.end > start && s.start < end)
    }

    /// Resolve the range to whole run nodes, splitting boundary runs so
    /// the returned runs cover exactly the range. Rebuilds the map when
    /// splitting changed the tree.
    pub fn resolve_runs(&mut self, doc: &mut Document, start: usize, end: usize) -> Vec<NodeRef> {
        let affected: Vec<Span> = self
            .spans
            .iter()
            .filter(|s| s.end > start && s.start < end)
            .cloned()
            .collect();
        if affected.is_empty() {
            return Vec::new();
        }

        let mut working: Vec<NodeRef> = Vec::new();
        for span in &affected {
            if let Some(run) = span.run {
                if working.last() != Some(&run) {
                    working.push(run);
                }
            }
        }
        if working.is_empty() {
            return Vec::new();
        }

        let mut modified = false;
        let first_real = affected.iter().find(|s| s.run.is_some());
        let mut start_adjustment = 0;

        if let Some(first) = first_real {
            let local_start = start.saturating_sub(first.start);
            if local_start > 0 && start > first.start {
                let tree = doc.tree_mut(working[0].part);
                let right = split_run_at(tree, working[0].node, local_start);
                working[0] = NodeRef {
                    part: working[0].part,
                    node: right,
                };
                modified = true;
                start_adjustment = local_start;
            }
        }

        let last_real = affected.iter().rev().find(|s| s.run.is_some());
        if let Some(last) = last_real {
            let same_run = first_real.map(|f| f.start) == Some(last.start)
                && first_real.and_then(|f| f.run) == last.run;
            let run_to_split = *working.last().unwrap_or(&working[0]);
            let overlap_end = last.end.min(end);
            let mut local_end = overlap_end.saturating_sub(last.start);
            if same_run && start_adjustment > 0 {
                local_end = local_end.saturating_sub(start_adjustment);
            }
            let run_len = run_text(doc.tree(run_to_split.part), run_to_split.node).len();
            if local_end > 0 && local_end < run_len {
                let tree = doc.tree_mut(run_to_split.part);
                split_run_at(tree, run_to_split.node, local_end);
                // The left half keeps the original node id.
                modified = true;
            }
        }

        if modified {
            self.rebuild(doc);
        }
        working
    }

    /// Run immediately preceding `index`, splitting a containing run
    /// when the index falls inside one.
    pub fn insertion_anchor(&mut self, doc: &mut Document, index: usize) -> Option<NodeRef> {
        if let Some(span) = self.spans.iter().filter(|s| s.end == index).next_back() {
            if let Some(run) = span.run {
                return Some(run);
            }
        }

        let containing = self
            .spans
            .iter()
            .find(|s| s.start < index && index < s.end)
            .cloned();
        if let Some(span) = containing {
            if let Some(run) = span.run {
                let offset = index - span.start;
                let tree = doc.tree_mut(run.part);
                split_run_at(tree, run.node, offset);
                self.rebuild(doc);
                return Some(run);
            }
        }

        if index == 0 {
            return self.spans.iter().find_map(|s| s.run);
        }

        self.spans
            .iter()
            .filter(|s| s.end < index)
            .rev()
            .find_map(|s| s.run)
    }
}

/// Set a text leaf's content, flagging `xml:space` when whitespace at
/// either end would otherwise be dropped by consumers.
pub fn set_text_preserve(tree: &mut XmlTree, node: NodeId, text: &str) {
    tree.set_text(node, text);
    if text.trim() != text {
        tree.set_attr(node, "xml:space", "preserve");
    }
}

/// Split `run` at `offset` (bytes into its visible text). The original
/// node keeps the left half; the returned new sibling run carries a
/// cloned `w:rPr` and everything from the split point on.
pub fn split_run_at(tree: &mut XmlTree, run: NodeId, offset: usize) -> NodeId {
    let children: Vec<NodeId> = tree.children(run).to_vec();

    let mut consumed = 0usize;
    let mut split_point: Option<(usize, usize)> = None;
    for (idx, &child) in children.iter().enumerate() {
        let len = match tree.tag(child) {
            "w:t" | "w:delText" => tree.text(child).map_or(0, str::len),
            "w:tab" | "w:br" | "w:cr" => 1,
            _ => 0,
        };
        if consumed + len > offset {
            split_point = Some((idx, offset - consumed));
            break;
        }
        consumed += len;
    }

    let new_run = tree.create("w:r");
    if let Some(rpr) = tree.child_by_tag(run, "w:rPr") {
        let copy = tree.deep_clone(rpr);
        tree.append(new_run, copy);
    }

    if let Some((idx, inner)) = split_point {
        let child = children[idx];
        let mut move_from = idx;
        if inner > 0 {
            let tag = tree.tag(child).to_owned();
            let text = tree.text(child).unwrap_or("").to_owned();
            let (left, right) = text.split_at(inner);
            let left = left.to_owned();
            let right = right.to_owned();
            set_text_preserve(tree, child, &left);
            let right_leaf = tree.create(&tag);
            set_text_preserve(tree, right_leaf, &right);
            tree.append(new_run, right_leaf);
            move_from = idx + 1;
        }
        for &leftover in &children[move_from..] {
            if tree.tag(leftover) != "w:rPr" {
                tree.append(new_run, leftover);
            }
        }
    }

    tree.insert_after(run, new_run);
    new_run
}

// ---------------------------------------------------------------------------
// Map construction
// ---------------------------------------------------------------------------

struct Builder<'a> {
    doc: &'a Document,
    view: ViewKind,
    comments: &'a BTreeMap<String, CommentData>,
    spans: Vec<Span>,
    full_text: String,
}

#[derive(Clone)]
struct PendingPart {
    real: bool,
    text: String,
    run: Option<NodeRef>,
    ins_id: Option<String>,
    del_id: Option<String>,
}

/// Metadata snapshot taken per run, merged into one block when flushed.
#[derive(Default)]
struct MetaState {
    ins: Option<(String, Option<String>)>,
    del: Option<(String, Option<String>)>,
    comments: BTreeSet<String>,
}

impl Builder<'_> {
    fn last_text(&self) -> Option<&str> {
        self.spans.last().map(|s| s.text.as_str())
    }

    fn add_virtual(&mut self, text: &str, paragraph: Option<NodeRef>) {
        let start = self.full_text.len();
        self.spans.push(Span {
            start,
            end: start + text.len(),
            text: text.to_owned(),
            run: None,
            paragraph,
            ins_id: None,
            del_id: None,
        });
        self.full_text.push_str(text);
    }

    fn add_real(&mut self, part: &PendingPart, paragraph: NodeRef) {
        let start = self.full_text.len();
        self.spans.push(Span {
            start,
            end: start + part.text.len(),
            text: part.text.clone(),
            run: part.run,
            paragraph: Some(paragraph),
            ins_id: part.ins_id.clone(),
            del_id: part.del_id.clone(),
        });
        self.full_text.push_str(&part.text);
    }

    fn map_part(&mut self, part: usize) {
        let tree = self.doc.tree(part);
        let container = part_container(tree);
        self.map_blocks(part, container);
    }

    fn map_blocks(&mut self, part: usize, container: NodeId) {
        let tree = self.doc.tree(part);
        for item in block_items(tree, container) {
            match item {
                BlockItem::Paragraph(p) => {
                    let para = NodeRef { part, node: p };
                    let prefix = docx::paragraph_prefix(tree, &self.doc.styles, p);
                    if !prefix.is_empty() {
                        self.add_virtual(&prefix, Some(para));
                    }
                    self.map_paragraph(part, p);
                    self.add_virtual("\n\n", Some(para));
                }
                BlockItem::Table(t) => {
                    self.map_table(part, t);
                    if self.last_text() != Some("\n\n") {
                        self.add_virtual("\n\n", None);
                    }
                }
            }
        }
    }

    fn map_table(&mut self, part: usize, table: NodeId) {
        let tree = self.doc.tree(part);
        for (row_idx, row) in docx::table_rows(tree, table).into_iter().enumerate() {
            if row_idx > 0 {
                self.add_virtual("\n", None);
            }
            for (cell_idx, cell) in docx::row_cells(tree, row).into_iter().enumerate() {
                if cell_idx > 0 {
                    self.add_virtual(" | ", None);
                }
                self.map_blocks(part, cell);
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn map_paragraph(&mut self, part: usize, p: NodeId) {
        let tree = self.doc.tree(part);
        let para = NodeRef { part, node: p };
        let clean = matches!(self.view, ViewKind::Clean);

        let items = paragraph_items(tree, p);

        let mut active_comment_ids: BTreeSet<String> = BTreeSet::new();
        let mut active_ins: Option<DocxEvent> = None;
        let mut active_del: Option<DocxEvent> = None;

        let mut deferred_meta: Vec<MetaState> = Vec::new();
        let mut wrappers: (&'static str, &'static str) = ("", "");
        let mut pending: Vec<PendingPart> = Vec::new();

        for (i, item) in items.iter().enumerate() {
            match item {
                ParaItem::Run(run_node) => {
                    let run = NodeRef {
                        part,
                        node: *run_node,
                    };
                    let (marker_prefix, marker_suffix) = run_style_markers(tree, *run_node);
                    let text = run_text(tree, *run_node);

                    // A newline inside a styled run would otherwise put
                    // the closing marker on the wrong line.
                    let mut run_parts: Vec<PendingPart> = Vec::new();
                    let ins_id = active_ins.as_ref().map(|e| e.id.clone());
                    let del_id = active_del.as_ref().map(|e| e.id.clone());
                    let styled = !marker_prefix.is_empty() || !marker_suffix.is_empty();
                    let push_virtual = |parts: &mut Vec<PendingPart>, text: &str| {
                        parts.push(PendingPart {
                            real: false,
                            text: text.to_owned(),
                            run: None,
                            ins_id: None,
                            del_id: None,
                        });
                    };
                    let push_real = |parts: &mut Vec<PendingPart>, text: &str| {
                        parts.push(PendingPart {
                            real: true,
                            text: text.to_owned(),
                            run: Some(run),
                            ins_id: ins_id.clone(),
                            del_id: del_id.clone(),
                        });
                    };
                    if text.contains('\n') && styled {
                        for (idx, piece) in text.split('\n').enumerate() {
                            if idx > 0 {
                                push_real(&mut run_parts, "\n");
                            }
                            if !piece.is_empty() {
                                if !marker_prefix.is_empty() {
                                    push_virtual(&mut run_parts, &marker_prefix);
                                }
                                push_real(&mut run_parts, piece);
                                if !marker_suffix.is_empty() {
                                    push_virtual(&mut run_parts, &marker_suffix);
                                }
                            }
                        }
                    } else {
                        if !marker_prefix.is_empty() {
                            push_virtual(&mut run_parts, &marker_prefix);
                        }
                        if !text.is_empty() {
                            push_real(&mut run_parts, &text);
                        }
                        if !marker_suffix.is_empty() {
                            push_virtual(&mut run_parts, &marker_suffix);
                        }
                    }

                    let seg_len: usize = run_parts.iter().map(|x| x.text.len()).sum();
                    let hidden = clean && del_id.is_some();

                    if seg_len > 0 && !hidden {
                        let new_wrappers = if clean {
                            ("", "")
                        } else {
                            wrapper_tokens(ins_id.as_deref(), del_id.as_deref(), &active_comment_ids)
                        };

                        if !pending.is_empty() && new_wrappers == wrappers {
                            pending.extend(run_parts);
                        } else {
                            self.flush_pending(&mut pending, wrappers, para);
                            wrappers = new_wrappers;
                            pending = run_parts;
                        }
                    }

                    if !clean {
                        deferred_meta.push(MetaState {
                            ins: active_ins
                                .as_ref()
                                .map(|e| (e.id.clone(), e.author.clone())),
                            del: active_del
                                .as_ref()
                                .map(|e| (e.id.clone(), e.author.clone())),
                            comments: active_comment_ids.clone(),
                        });

                        let in_redline = ins_id.is_some() || del_id.is_some();
                        let defer = in_redline
                            && next_run_still_redline(
                                &items[i + 1..],
                                ins_id.is_some(),
                                del_id.is_some(),
                            );

                        if !defer {
                            self.flush_pending(&mut pending, wrappers, para);
                            wrappers = ("", "");
                            let block = self.merged_meta_block(&deferred_meta);
                            if !block.is_empty() {
                                self.add_virtual(&format!("{{>>{block}<<}}"), Some(para));
                            }
                            deferred_meta.clear();
                        }
                    }
                }
                ParaItem::Event(event) => {
                    self.flush_pending(&mut pending, wrappers, para);
                    wrappers = ("", "");
                    match event.kind {
                        EventKind::CommentStart => {
                            active_comment_ids.insert(event.id.clone());
                        }
                        EventKind::CommentEnd => {
                            active_comment_ids.remove(&event.id);
                        }
                        EventKind::InsStart => active_ins = Some(event.clone()),
                        EventKind::InsEnd => active_ins = None,
                        EventKind::DelStart => active_del = Some(event.clone()),
                        EventKind::DelEnd => active_del = None,
                        EventKind::CommentRef => {}
                    }
                }
            }
        }

        self.flush_pending(&mut pending, wrappers, para);
        if !deferred_meta.is_empty() {
            let block = self.merged_meta_block(&deferred_meta);
            if !block.is_empty() {
                self.add_virtual(&format!("{{>>{block}<<}}"), Some(para));
            }
        }
    }

    fn flush_pending(
        &mut self,
        pending: &mut Vec<PendingPart>,
        wrappers: (&'static str, &'static str),
        para: NodeRef,
    ) {
        if pending.is_empty() {
            return;
        }
        let (start_token, end_token) = wrappers;
        if !start_token.is_empty() {
            self.add_virtual(start_token, Some(para));
        }
        for part in pending.drain(..) {
            if part.real {
                self.add_real(&part, para);
            } else {
                let text = part.text.clone();
                self.add_virtual(&text, Some(para));
            }
        }
        if !end_token.is_empty() {
            self.add_virtual(end_token, Some(para));
        }
    }

    /// Render the deferred metadata states as one block: change lines
    /// first, comment lines after, each signature emitted once.
    fn merged_meta_block(&self, states: &[MetaState]) -> String {
        let mut change_lines: Vec<String> = Vec::new();
        let mut comment_lines: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for state in states {
            for entry in [&state.ins, &state.del] {
                let Some((id, author)) = entry else { continue };
                let sig = format!("Chg:{id}");
                if seen.insert(sig.clone()) {
                    let author = author.as_deref().unwrap_or("Unknown");
                    change_lines.push(format!("[{sig}] {author}"));
                }
            }
            for comment_id in &state.comments {
                // A reply renders beneath its thread root, not as its
                // own top-level line.
                let root_id = self.thread_root(comment_id);
                if self.comments.get(&root_id).is_none() {
                    continue;
                }
                if !seen.insert(format!("Com:{root_id}")) {
                    continue;
                }
                self.render_comment_thread(&root_id, 0, &mut comment_lines, &mut seen);
            }
        }

        change_lines.extend(comment_lines);
        change_lines.join("\n")
    }

    fn thread_root(&self, id: &str) -> String {
        let mut current = id.to_owned();
        while let Some(parent) = self
            .comments
            .get(&current)
            .and_then(|d| d.parent_id.clone())
        {
            if parent == current || !self.comments.contains_key(&parent) {
                break;
            }
            current = parent;
        }
        current
    }

    /// One line for the comment, then its replies indented beneath it,
    /// oldest first.
    fn render_comment_thread(
        &self,
        id: &str,
        depth: usize,
        out: &mut Vec<String>,
        seen: &mut BTreeSet<String>,
    ) {
        let Some(data) = self.comments.get(id) else {
            return;
        };
        seen.insert(format!("Com:{id}"));
        let mut header = format!("{}[Com:{id}] {}", "  ".repeat(depth), data.author);
        if !data.date.is_empty() {
            let short_date = data.date.split('T').next().unwrap_or(&data.date);
            header.push_str(&format!(" @ {short_date}"));
        }
        if data.resolved {
            header.push_str("(RESOLVED)");
        }
        out.push(format!("{header}: {}", data.text));

        let mut children: Vec<(&String, &CommentData)> = self
            .comments
            .iter()
            .filter(|(_, d)| d.parent_id.as_deref() == Some(id))
            .collect();
        children.sort_by(|a, b| a.1.date.cmp(&b.1.date).then_with(|| a.0.cmp(b.0)));
        for (child_id, _) in children {
            self.render_comment_thread(child_id, depth + 1, out, seen);
        }
    }
}

fn wrapper_tokens(
    ins_id: Option<&str>,
    del_id: Option<&str>,
    active_comments: &BTreeSet<String>,
) -> (&'static str, &'static str) {
    if del_id.is_some() {
        ("{--", "--}")
    } else if ins_id.is_some() {
        ("{++", "++}")
    } else if !active_comments.is_empty() {
        ("{==", "==}")
    } else {
        ("", "")
    }
}

/// Whether the next run after `rest` is still inside a tracked change,
/// given the current in-ins/in-del state. Controls metadata deferral so
/// one `{>>...<<}` block covers a whole contiguous marker group.
fn next_run_still_redline(rest: &[ParaItem], mut in_ins: bool, mut in_del: bool) -> bool {
    for item in rest {
        match item {
            ParaItem::Run(_) => return in_ins || in_del,
            ParaItem::Event(event) => match event.kind {
                EventKind::InsStart => in_ins = true,
                EventKind::InsEnd => in_ins = false,
                EventKind::DelStart => in_del = true,
                EventKind::DelEnd => in_del = false,
                _ => {}
            },
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;

    fn doc_from_body(body: &str) -> Document {
        let mut doc = Document::load(minimal_package(body)).unwrap();
        docx::normalize(&mut doc);
        doc
    }

    fn minimal_package(body: &str) -> Package {
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
        let bytes = writer.finish().unwrap().into_inner();
        Package::from_bytes(&bytes).unwrap()
    }

    fn build(doc: &Document, view: ViewKind) -> Mapper {
        Mapper::build(doc, view, BTreeMap::new())
    }

    #[test]
    fn test_plain_paragraphs_joined_by_blank_line() {
        let doc = doc_from_body(
            "<w:p><w:r><w:t>First.</w:t></w:r></w:p><w:p><w:r><w:t>Second.</w:t></w:r></w:p>",
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(mapper.full_text(), "First.\n\nSecond.");
    }

    #[test]
    fn test_deletion_wrapped_with_meta() {
        let doc = doc_from_body(
            r#"<w:p><w:r><w:t>Keep </w:t></w:r><w:del w:id="3" w:author="Ann"><w:r><w:delText>gone</w:delText></w:r></w:del><w:r><w:t> end</w:t></w:r></w:p>"#,
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(
            mapper.full_text(),
            "Keep {--gone--}{>>[Chg:3] Ann<<} end"
        );
    }

    #[test]
    fn test_clean_view_accepts_changes() {
        let doc = doc_from_body(
            r#"<w:p><w:r><w:t>Keep </w:t></w:r><w:del w:id="3" w:author="A"><w:r><w:delText>gone </w:delText></w:r></w:del><w:ins w:id="4" w:author="A"><w:r><w:t>new </w:t></w:r></w:ins><w:r><w:t>end</w:t></w:r></w:p>"#,
        );
        let mapper = build(&doc, ViewKind::Clean);
        assert_eq!(mapper.full_text(), "Keep new end");
    }

    #[test]
    fn test_adjacent_same_state_runs_share_one_wrapper() {
        let doc = doc_from_body(
            r#"<w:p><w:ins w:id="9" w:author="A"><w:r><w:t>one </w:t></w:r><w:r><w:rPr><w:sz w:val="20"/></w:rPr><w:t>two</w:t></w:r></w:ins></w:p>"#,
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(mapper.full_text(), "{++one two++}{>>[Chg:9] A<<}");
    }

    #[test]
    fn test_bold_run_markers() {
        let doc = doc_from_body(
            r#"<w:p><w:r><w:t>a </w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t>bold</w:t></w:r><w:r><w:t> z</w:t></w:r></w:p>"#,
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(mapper.full_text(), "a **bold** z");
    }

    #[test]
    fn test_table_cell_and_row_separators() {
        let doc = doc_from_body(
            "<w:tbl><w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>b</w:t></w:r></w:p></w:tc></w:tr><w:tr><w:tc><w:p><w:r><w:t>c</w:t></w:r></w:p></w:tc></w:tr></w:tbl>",
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(mapper.full_text(), "a\n\n | b\n\n\nc");
    }

    #[test]
    fn test_heading_prefix_virtual_span() {
        let doc = doc_from_body(
            r#"<w:p><w:pPr><w:outlineLvl w:val="0"/></w:pPr><w:r><w:t>Scope</w:t></w:r></w:p>"#,
        );
        let mapper = build(&doc, ViewKind::Raw);
        assert_eq!(mapper.full_text(), "# Scope");
        assert!(mapper.spans()[0].run.is_none());
    }

    #[test]
    fn test_resolve_runs_splits_boundaries() {
        let mut doc = doc_from_body("<w:p><w:r><w:t>alpha beta gamma</w:t></w:r></w:p>");
        let mut mapper = build(&doc, ViewKind::Raw);
        let m = mapper.find_match_index("beta").unwrap();
        let runs = mapper.resolve_runs(&mut doc, m.start, m.end());
        assert_eq!(runs.len(), 1);
        assert_eq!(run_text(doc.tree(runs[0].part), runs[0].node), "beta");
        // Map was rebuilt and still renders the same text.
        assert_eq!(mapper.full_text(), "alpha beta gamma");
    }

    #[test]
    fn test_resolve_runs_across_runs() {
        let doc_body = r#"<w:p><w:r><w:rPr><w:sz w:val="20"/></w:rPr><w:t>one </w:t></w:r><w:r><w:t>two three</w:t></w:r></w:p>"#;
        let mut doc = doc_from_body(doc_body);
        let mut mapper = build(&doc, ViewKind::Raw);
        // Crosses from the sized run into the plain one.
        let m = mapper.find_match_index("one two").unwrap();
        let runs = mapper.resolve_runs(&mut doc, m.start, m.end());
        assert_eq!(runs.len(), 2);
        let texts: Vec<String> = runs
            .iter()
            .map(|r| run_text(doc.tree(r.part), r.node))
            .collect();
        assert_eq!(texts, vec!["one ", "two"]);
    }

    #[test]
    fn test_insertion_anchor_at_span_boundary() {
        let mut doc = doc_from_body(
            "<w:p><w:r><w:t>head</w:t></w:r></w:p><w:p><w:r><w:t>tail</w:t></w:r></w:p>",
        );
        let mut mapper = build(&doc, ViewKind::Raw);
        let anchor = mapper.insertion_anchor(&mut doc, 4).unwrap();
        assert_eq!(run_text(doc.tree(anchor.part), anchor.node), "head");
    }

    #[test]
    fn test_insertion_anchor_splits_inside_span() {
        let mut doc = doc_from_body("<w:p><w:r><w:t>headtail</w:t></w:r></w:p>");
        let mut mapper = build(&doc, ViewKind::Raw);
        let anchor = mapper.insertion_anchor(&mut doc, 4).unwrap();
        assert_eq!(run_text(doc.tree(anchor.part), anchor.node), "head");
        assert_eq!(mapper.full_text(), "headtail");
    }

    #[test]
    fn test_split_run_at_preserves_formatting() {
        let mut tree = XmlTree::parse(
            br#"<w:p xmlns:w="ns"><w:r><w:rPr><w:b/></w:rPr><w:t>headtail</w:t></w:r></w:p>"#,
        )
        .unwrap();
        let p = tree.root();
        let run = tree.children(p)[0];
        let right = split_run_at(&mut tree, run, 4);
        assert_eq!(run_text(&tree, run), "head");
        assert_eq!(run_text(&tree, right), "tail");
        assert!(tree
            .child_by_tag(right, "w:rPr")
            .and_then(|rpr| tree.child_by_tag(rpr, "w:b"))
            .is_some());
    }

    #[test]
    fn test_comment_range_highlight_and_meta() {
        let mut comments = BTreeMap::new();
        comments.insert(
            "2".to_owned(),
            CommentData {
                author: "Bea".to_owned(),
                text: "check this".to_owned(),
                date: "2024-05-01T10:00:00Z".to_owned(),
                resolved: false,
                parent_id: None,
            },
        );
        let doc = doc_from_body(
            r#"<w:p><w:commentRangeStart w:id="2"/><w:r><w:t>flagged</w:t></w:r><w:commentRangeEnd w:id="2"/><w:r><w:t> rest</w:t></w:r></w:p>"#,
        );
        let mapper = Mapper::build(&doc, ViewKind::Raw, comments);
        assert_eq!(
            mapper.full_text(),
            "{==flagged==}{>>[Com:2] Bea @ 2024-05-01: check this<<} rest"
        );
    }

    #[test]
    fn test_reply_renders_indented_under_root() {
        let mut comments = BTreeMap::new();
        comments.insert(
            "2".to_owned(),
            CommentData {
                author: "Bea".to_owned(),
                text: "check this".to_owned(),
                date: "2024-05-01T10:00:00Z".to_owned(),
                resolved: false,
                parent_id: None,
            },
        );
        comments.insert(
            "3".to_owned(),
            CommentData {
                author: "Cal".to_owned(),
                text: "looks fine".to_owned(),
                date: "2024-05-02T09:00:00Z".to_owned(),
                resolved: false,
                parent_id: Some("2".to_owned()),
            },
        );
        let doc = doc_from_body(
            r#"<w:p><w:commentRangeStart w:id="2"/><w:commentRangeStart w:id="3"/><w:r><w:t>flagged</w:t></w:r><w:commentRangeEnd w:id="2"/><w:commentRangeEnd w:id="3"/><w:r><w:t> rest</w:t></w:r></w:p>"#,
        );
        let mapper = Mapper::build(&doc, ViewKind::Raw, comments);
        assert_eq!(
            mapper.full_text(),
            "{==flagged==}{>>[Com:2] Bea @ 2024-05-01: check this\n  [Com:3] Cal @ 2024-05-02: looks fine<<} rest"
        );
    }
}

//! WordprocessingML walk utilities shared by the mapper and the engine.
//!
//! Covers block iteration (paragraphs/tables, nested tables in cells),
//! the paragraph content event stream (runs interleaved with tracked
//! change and comment range markers), run text extraction, style-marker
//! derivation, heading prefixes, and the run-coalescing normalization
//! applied once at load.

use std::collections::HashMap;

use tracing::debug;

use crate::error::RedlineResult;
use crate::package::{Package, DOCUMENT_PART};
use crate::xml::{NodeId, XmlTree};

/// A node handle qualified by the document part it lives in.
///
/// Stable across mapper rebuilds; only meaningful against the
/// [`Document`] that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub part: usize,
    pub node: NodeId,
}

/// A parsed, mutable document part.
#[derive(Debug, Clone)]
pub struct DocPart {
    pub name: String,
    pub xml: XmlTree,
}

/// Resolved style information from `word/styles.xml`.
#[derive(Debug, Default, Clone)]
pub struct Styles {
    by_id: HashMap<String, StyleInfo>,
}

#[derive(Debug, Clone)]
struct StyleInfo {
    name: String,
    bold: bool,
}

impl Styles {
    fn from_part(tree: &XmlTree) -> Self {
        let mut by_id = HashMap::new();
        for style in tree.find_all("w:style") {
            let Some(id) = tree.attr(style, "w:styleId") else {
                continue;
            };
            let name = tree
                .child_by_tag(style, "w:name")
                .and_then(|n| tree.attr(n, "w:val"))
                .unwrap_or(id)
                .to_owned();
            let bold = tree
                .child_by_tag(style, "w:rPr")
                .and_then(|rpr| tree.child_by_tag(rpr, "w:b"))
                .is_some_and(|b| !is_off_val(tree.attr(b, "w:val")));
            by_id.insert(id.to_owned(), StyleInfo { name, bold });
        }
        Self { by_id }
    }

    pub fn name_of(&self, style_id: &str) -> Option<&str> {
        self.by_id.get(style_id).map(|s| s.name.as_str())
    }

    pub fn is_bold(&self, style_id: &str) -> bool {
        self.by_id.get(style_id).is_some_and(|s| s.bold)
    }

    /// Resolve a style display name (e.g. `Heading 1`) to its id.
    /// Falls back to the name with spaces stripped, which matches how
    /// Word derives built-in style ids.
    pub fn id_for_name(&self, name: &str) -> String {
        self.by_id
            .iter()
            .find(|(_, info)| info.name == name)
            .map_or_else(|| name.replace(' ', ""), |(id, _)| id.clone())
    }
}

/// An in-memory document: the package plus parsed parts in mapping
/// order (headers, body, footers).
#[derive(Debug, Clone)]
pub struct Document {
    pub package: Package,
    pub parts: Vec<DocPart>,
    pub styles: Styles,
    body_index: usize,
}

impl Document {
    /// Parse the mapped parts out of a package.
    ///
    /// # Errors
    ///
    /// Returns an error when a mapped part fails to parse.
    pub fn load(package: Package) -> RedlineResult<Self> {
        let mut headers: Vec<String> = Vec::new();
        let mut footers: Vec<String> = Vec::new();
        for name in package.part_names() {
            if name.starts_with("word/header") && name.ends_with(".xml") {
                headers.push(name.to_owned());
            } else if name.starts_with("word/footer") && name.ends_with(".xml") {
                footers.push(name.to_owned());
            }
        }
        headers.sort();
        footers.sort();

        let mut parts = Vec::new();
        for name in &headers {
            parts.push(DocPart {
                name: name.clone(),
                xml: package.parse_part(name)?,
            });
        }
        let body_index = parts.len();
        parts.push(DocPart {
            name: DOCUMENT_PART.to_owned(),
            xml: package.parse_part(DOCUMENT_PART)?,
        });
        for name in &footers {
            parts.push(DocPart {
                name: name.clone(),
                xml: package.parse_part(name)?,
            });
        }

        let styles = match package.part("word/styles.xml") {
            Some(_) => Styles::from_part(&package.parse_part("word/styles.xml")?),
            None => Styles::default(),
        };

        Ok(Self {
            package,
            parts,
            styles,
            body_index,
        })
    }

    pub fn body(&self) -> &XmlTree {
        &self.parts[self.body_index].xml
    }

    pub fn body_mut(&mut self) -> &mut XmlTree {
        &mut self.parts[self.body_index].xml
    }

    pub fn body_index(&self) -> usize {
        self.body_index
    }

    pub fn tree(&self, part: usize) -> &XmlTree {
        &self.parts[part].xml
    }

    pub fn tree_mut(&mut self, part: usize) -> &mut XmlTree {
        &mut self.parts[part].xml
    }

    /// Find a node by tag + `w:id` across all mapped parts.
    pub fn find_by_id(&self, tag: &str, id: &str) -> Vec<NodeRef> {
        let mut out = Vec::new();
        for (part, doc_part) in self.parts.iter().enumerate() {
            for node in doc_part.xml.find_all_with_attr(tag, "w:id", id) {
                out.push(NodeRef { part, node });
            }
        }
        out
    }

    /// Serialize every parsed part back into the package.
    pub fn flush_parts(&mut self) {
        for part in &self.parts {
            self.package.set_part(&part.name, part.xml.to_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Block iteration
// ---------------------------------------------------------------------------

/// A block-level item: paragraph or table.
#[derive(Debug, Clone, Copy)]
pub enum BlockItem {
    Paragraph(NodeId),
    Table(NodeId),
}

/// Paragraphs and tables directly under `container` (a body, header,
/// footer root child, or table cell), in document order. Recursion into
/// nested tables is left to the caller.
pub fn block_items(tree: &XmlTree, container: NodeId) -> Vec<BlockItem> {
    tree.children(container)
        .iter()
        .filter_map(|&child| match tree.tag(child) {
            "w:p" => Some(BlockItem::Paragraph(child)),
            "w:tbl" => Some(BlockItem::Table(child)),
            _ => None,
        })
        .collect()
}

/// The block container node of a part: `w:body` for the main document,
/// the root element itself for headers and footers.
pub fn part_container(tree: &XmlTree) -> NodeId {
    tree.child_by_tag(tree.root(), "w:body")
        .unwrap_or_else(|| tree.root())
}

// ---------------------------------------------------------------------------
// Paragraph content events
// ---------------------------------------------------------------------------

/// Marker kinds interleaved with runs inside a paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CommentStart,
    CommentEnd,
    CommentRef,
    InsStart,
    InsEnd,
    DelStart,
    DelEnd,
}

/// A tracked-change or comment marker event.
#[derive(Debug, Clone)]
pub struct DocxEvent {
    pub kind: EventKind,
    pub id: String,
    pub author: Option<String>,
}

/// One item of a paragraph's content stream.
#[derive(Debug, Clone)]
pub enum ParaItem {
    Run(NodeId),
    Event(DocxEvent),
}

/// Complex-field (`w:fldChar`) state: hides the rendered result of
/// PAGE / NUMPAGES instructions, which would otherwise leak stale page
/// numbers into the logical text.
#[derive(Default)]
struct FieldState {
    in_field: bool,
    instr: String,
    hide_result: bool,
}

impl FieldState {
    fn process_run(&mut self, tree: &XmlTree, run: NodeId, out: &mut Vec<ParaItem>) {
        // Comment references occasionally sit inside an ordinary run.
        for &child in tree.children(run) {
            if tree.tag(child) == "w:commentReference" {
                if let Some(id) = tree.attr(child, "w:id") {
                    out.push(ParaItem::Event(DocxEvent {
                        kind: EventKind::CommentRef,
                        id: id.to_owned(),
                        author: None,
                    }));
                }
            }
        }

        for &child in tree.children(run) {
            if tree.tag(child) != "w:fldChar" {
                continue;
            }
            match tree.attr(child, "w:fldCharType") {
                Some("begin") => {
                    self.in_field = true;
                    self.instr.clear();
                }
                Some("separate") => {
                    if is_page_instruction(&self.instr) {
                        self.hide_result = true;
                    }
                }
                Some("end") => {
                    self.in_field = false;
                    self.instr.clear();
                    self.hide_result = false;
                }
                _ => {}
            }
        }

        if self.in_field && !self.hide_result {
            for &child in tree.children(run) {
                if tree.tag(child) == "w:instrText" {
                    if let Some(text) = tree.text(child) {
                        self.instr.push_str(text);
                    }
                }
            }
        }

        if !self.hide_result {
            out.push(ParaItem::Run(run));
        }
    }
}

fn is_page_instruction(instr: &str) -> bool {
    let upper = instr.trim().to_uppercase();
    matches!(upper.split_whitespace().next(), Some("PAGE" | "NUMPAGES"))
}

fn event(tree: &XmlTree, node: NodeId, kind: EventKind) -> DocxEvent {
    DocxEvent {
        kind,
        id: tree.attr(node, "w:id").unwrap_or_default().to_owned(),
        author: tree.attr(node, "w:author").map(str::to_owned),
    }
}

/// The full content stream of a paragraph: runs and marker events in
/// document order, with runs inside `w:ins`/`w:del` bracketed by the
/// corresponding start/end events.
pub fn paragraph_items(tree: &XmlTree, paragraph: NodeId) -> Vec<ParaItem> {
    let mut out = Vec::new();
    let mut fields = FieldState::default();

    for &child in tree.children(paragraph) {
        match tree.tag(child) {
            "w:r" => fields.process_run(tree, child, &mut out),
            "w:ins" => {
                out.push(ParaItem::Event(event(tree, child, EventKind::InsStart)));
                for &sub in tree.children(child) {
                    match tree.tag(sub) {
                        "w:r" => fields.process_run(tree, sub, &mut out),
                        "w:commentRangeStart" => {
                            out.push(ParaItem::Event(event(tree, sub, EventKind::CommentStart)));
                        }
                        "w:commentRangeEnd" => {
                            out.push(ParaItem::Event(event(tree, sub, EventKind::CommentEnd)));
                        }
                        _ => {}
                    }
                }
                out.push(ParaItem::Event(event(tree, child, EventKind::InsEnd)));
            }
            "w:del" => {
                out.push(ParaItem::Event(event(tree, child, EventKind::DelStart)));
                for &sub in tree.children(child) {
                    if tree.tag(sub) == "w:r" {
                        out.push(ParaItem::Run(sub));
                    }
                }
                out.push(ParaItem::Event(event(tree, child, EventKind::DelEnd)));
            }
            "w:commentRangeStart" => {
                out.push(ParaItem::Event(event(tree, child, EventKind::CommentStart)));
            }
            "w:commentRangeEnd" => {
                out.push(ParaItem::Event(event(tree, child, EventKind::CommentEnd)));
            }
            _ => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Run inspection
// ---------------------------------------------------------------------------

/// Text of a run: `w:t` and `w:delText` content, `w:tab` as a space,
/// `w:br`/`w:cr` as newlines.
pub fn run_text(tree: &XmlTree, run: NodeId) -> String {
    let mut text = String::new();
    for &child in tree.children(run) {
        match tree.tag(child) {
            "w:t" | "w:delText" => text.push_str(tree.text(child).unwrap_or("")),
            "w:tab" => text.push(' '),
            "w:br" | "w:cr" => text.push('\n'),
            _ => {}
        }
    }
    text
}

fn is_off_val(val: Option<&str>) -> bool {
    matches!(val, Some("0" | "false" | "none" | "off"))
}

fn run_has_prop(tree: &XmlTree, run: NodeId, prop: &str) -> bool {
    tree.child_by_tag(run, "w:rPr")
        .and_then(|rpr| tree.child_by_tag(rpr, prop))
        .is_some_and(|p| !is_off_val(tree.attr(p, "w:val")))
}

pub fn run_is_bold(tree: &XmlTree, run: NodeId) -> bool {
    run_has_prop(tree, run, "w:b")
}

pub fn run_is_italic(tree: &XmlTree, run: NodeId) -> bool {
    run_has_prop(tree, run, "w:i")
}

/// Markdown-style markers for a run's explicit formatting.
/// Nesting order: bold outer, italic inner, so `**_text_**`.
pub fn run_style_markers(tree: &XmlTree, run: NodeId) -> (String, String) {
    let mut prefix = String::new();
    let mut suffix = String::new();
    if run_is_bold(tree, run) {
        prefix.push_str("**");
        suffix.insert_str(0, "**");
    }
    if run_is_italic(tree, run) {
        prefix.push('_');
        suffix.insert(0, '_');
    }
    (prefix, suffix)
}

/// Visible text of a paragraph, including runs inside insertions.
pub fn paragraph_text(tree: &XmlTree, paragraph: NodeId) -> String {
    let mut text = String::new();
    for item in paragraph_items(tree, paragraph) {
        if let ParaItem::Run(run) = item {
            text.push_str(&run_text(tree, run));
        }
    }
    text
}

// ---------------------------------------------------------------------------
// Heading prefix
// ---------------------------------------------------------------------------

fn paragraph_style_id<'a>(tree: &'a XmlTree, paragraph: NodeId) -> Option<&'a str> {
    tree.child_by_tag(paragraph, "w:pPr")
        .and_then(|ppr| tree.child_by_tag(ppr, "w:pStyle"))
        .and_then(|style| tree.attr(style, "w:val"))
}

fn outline_level(tree: &XmlTree, paragraph: NodeId) -> Option<u32> {
    tree.child_by_tag(paragraph, "w:pPr")
        .and_then(|ppr| tree.child_by_tag(ppr, "w:outlineLvl"))
        .and_then(|lvl| tree.attr(lvl, "w:val"))
        .and_then(|v| v.parse().ok())
}

/// Markdown heading prefix for a paragraph, or empty.
///
/// Precedence: explicit outline level, `Heading N`/`Title` style name,
/// then a heuristic for manually formatted headings (short, all-caps,
/// bold, `Normal`-styled).
pub fn paragraph_prefix(tree: &XmlTree, styles: &Styles, paragraph: NodeId) -> String {
    // Outline level is the structural truth: 0 = level 1 .. 8 = level 9.
    if let Some(lvl) = outline_level(tree, paragraph) {
        if lvl <= 8 {
            return format!("{} ", "#".repeat(lvl as usize + 1));
        }
    }

    let style_id = paragraph_style_id(tree, paragraph);
    let style_name = style_id.map(|id| styles.name_of(id).unwrap_or(id));

    if let Some(name) = style_name {
        if let Some(rest) = name.strip_prefix("Heading") {
            if let Ok(level) = rest.trim().parse::<usize>() {
                if level >= 1 {
                    return format!("{} ", "#".repeat(level));
                }
            }
        }
        if name == "Title" {
            return "# ".to_owned();
        }
        if name != "Normal" {
            return String::new();
        }
    }

    // Heuristic for "Normal" (or unstyled) headings: short, all-caps,
    // bold. Common in manually formatted contracts.
    let text = paragraph_text(tree, paragraph);
    let text = text.trim();
    if text.is_empty() || text.len() >= 100 {
        return String::new();
    }
    let all_caps =
        text.chars().any(char::is_alphabetic) && !text.chars().any(char::is_lowercase);
    if !all_caps {
        return String::new();
    }

    let style_bold = style_id.is_some_and(|id| styles.is_bold(id));
    let first_run_bold = paragraph_items(tree, paragraph)
        .iter()
        .filter_map(|item| match item {
            ParaItem::Run(run) if !run_text(tree, *run).trim().is_empty() => Some(*run),
            _ => None,
        })
        .next()
        .is_some_and(|run| run_is_bold(tree, run));

    if style_bold || first_run_bold {
        "## ".to_owned()
    } else {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

const SAFE_RUN_TAGS: &[&str] = &["w:t", "w:tab", "w:br", "w:cr", "w:delText", "w:rPr"];

/// Whether a run holds content that plain text-level coalescing would
/// destroy (drawings, embedded comment references, field chars).
fn run_has_special_content(tree: &XmlTree, run: NodeId) -> bool {
    tree.children(run)
        .iter()
        .any(|&child| !SAFE_RUN_TAGS.contains(&tree.tag(child)))
}

/// Structural fingerprint of a subtree, used to compare `w:rPr` blocks.
pub fn subtree_fingerprint(tree: &XmlTree, node: NodeId) -> String {
    let mut out = String::new();
    write_fingerprint(tree, node, &mut out);
    out
}

fn write_fingerprint(tree: &XmlTree, node: NodeId, out: &mut String) {
    out.push('<');
    out.push_str(tree.tag(node));
    let mut attrs: Vec<&(String, String)> = tree.attrs(node).iter().collect();
    attrs.sort();
    for (k, v) in attrs {
        out.push(' ');
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out.push('>');
    if let Some(text) = tree.text(node) {
        out.push_str(text);
    }
    for &child in tree.children(node) {
        write_fingerprint(tree, child, out);
    }
    out.push_str("</>");
}

fn rpr_fingerprint(tree: &XmlTree, run: NodeId) -> String {
    tree.child_by_tag(run, "w:rPr")
        .map(|rpr| subtree_fingerprint(tree, rpr))
        .unwrap_or_default()
}

/// Merge adjacent sibling runs with identical formatting. Editing
/// history often splits words across runs (`["Con", "tract"]`), which
/// breaks exact substring matching.
fn coalesce_runs(tree: &mut XmlTree, paragraph: NodeId) {
    let mut i = 0;
    loop {
        let runs: Vec<NodeId> = tree
            .children(paragraph)
            .iter()
            .copied()
            .filter(|&c| tree.tag(c) == "w:r")
            .collect();
        if i + 1 >= runs.len() {
            break;
        }
        let current = runs[i];
        let next = runs[i + 1];

        // Only merge direct siblings (no markers between them).
        let adjacent = tree
            .position(current)
            .zip(tree.position(next))
            .is_some_and(|(a, b)| b == a + 1);

        if !adjacent
            || run_has_special_content(tree, current)
            || run_has_special_content(tree, next)
            || rpr_fingerprint(tree, current) != rpr_fingerprint(tree, next)
        {
            i += 1;
            continue;
        }

        // Move content children across, preserving w:br / w:tab nodes.
        let to_move: Vec<NodeId> = tree
            .children(next)
            .iter()
            .copied()
            .filter(|&c| tree.tag(c) != "w:rPr")
            .collect();
        for child in to_move {
            tree.append(current, child);
        }
        tree.detach(next);
        // Re-check the new neighbor against `current`.
    }
}

fn normalize_container(tree: &mut XmlTree, container: NodeId) {
    for item in block_items(tree, container) {
        match item {
            BlockItem::Paragraph(p) => coalesce_runs(tree, p),
            BlockItem::Table(t) => {
                for row in table_rows(tree, t) {
                    for cell in row_cells(tree, row) {
                        normalize_container(tree, cell);
                    }
                }
            }
        }
    }
}

/// Direct `w:tr` children of a table.
pub fn table_rows(tree: &XmlTree, table: NodeId) -> Vec<NodeId> {
    tree.children(table)
        .iter()
        .copied()
        .filter(|&c| tree.tag(c) == "w:tr")
        .collect()
}

/// Direct `w:tc` children of a row.
pub fn row_cells(tree: &XmlTree, row: NodeId) -> Vec<NodeId> {
    tree.children(row)
        .iter()
        .copied()
        .filter(|&c| tree.tag(c) == "w:tc")
        .collect()
}

/// Normalize a loaded document for reliable text mapping: strip proofing
/// markers and coalesce runs in every mapped part.
pub fn normalize(document: &mut Document) {
    debug!("normalizing document structure");
    for part in &mut document.parts {
        let tree = &mut part.xml;
        for node in tree.find_all("w:proofErr") {
            tree.detach(node);
        }
        let container = part_container(tree);
        normalize_container(tree, container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_tree(inner: &str) -> XmlTree {
        let xml = format!(
            r#"<w:document xmlns:w="ns"><w:body>{inner}</w:body></w:document>"#
        );
        XmlTree::parse(xml.as_bytes()).unwrap()
    }

    fn first_paragraph(tree: &XmlTree) -> NodeId {
        let body = part_container(tree);
        match block_items(tree, body)[0] {
            BlockItem::Paragraph(p) => p,
            BlockItem::Table(_) => panic!("expected paragraph"),
        }
    }

    #[test]
    fn test_run_text_tabs_and_breaks() {
        let tree = body_tree("<w:p><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/><w:t>c</w:t></w:r></w:p>");
        let p = first_paragraph(&tree);
        let run = match &paragraph_items(&tree, p)[0] {
            ParaItem::Run(r) => *r,
            ParaItem::Event(_) => panic!("expected run"),
        };
        assert_eq!(run_text(&tree, run), "a b\nc");
    }

    #[test]
    fn test_paragraph_items_bracket_insertions() {
        let tree = body_tree(
            r#"<w:p><w:r><w:t>a</w:t></w:r><w:ins w:id="5" w:author="X"><w:r><w:t>b</w:t></w:r></w:ins></w:p>"#,
        );
        let p = first_paragraph(&tree);
        let items = paragraph_items(&tree, p);
        assert_eq!(items.len(), 4);
        assert!(matches!(
            &items[1],
            ParaItem::Event(e) if e.kind == EventKind::InsStart && e.id == "5"
        ));
        assert!(matches!(
            &items[3],
            ParaItem::Event(e) if e.kind == EventKind::InsEnd
        ));
    }

    #[test]
    fn test_page_field_result_hidden() {
        let tree = body_tree(
            r#"<w:p><w:r><w:fldChar w:fldCharType="begin"/></w:r><w:r><w:instrText> PAGE </w:instrText></w:r><w:r><w:fldChar w:fldCharType="separate"/></w:r><w:r><w:t>7</w:t></w:r><w:r><w:fldChar w:fldCharType="end"/></w:r><w:r><w:t>after</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        let text: String = paragraph_items(&tree, p)
            .iter()
            .filter_map(|i| match i {
                ParaItem::Run(r) => Some(run_text(&tree, *r)),
                ParaItem::Event(_) => None,
            })
            .collect();
        assert!(!text.contains('7'));
        assert!(text.contains("after"));
    }

    #[test]
    fn test_style_markers_nesting() {
        let tree = body_tree(
            r#"<w:p><w:r><w:rPr><w:b/><w:i/></w:rPr><w:t>x</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        let run = match &paragraph_items(&tree, p)[0] {
            ParaItem::Run(r) => *r,
            ParaItem::Event(_) => panic!("expected run"),
        };
        let (prefix, suffix) = run_style_markers(&tree, run);
        assert_eq!(prefix, "**_");
        assert_eq!(suffix, "_**");
    }

    #[test]
    fn test_bold_val_false_ignored() {
        let tree = body_tree(
            r#"<w:p><w:r><w:rPr><w:b w:val="false"/></w:rPr><w:t>x</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        let run = match &paragraph_items(&tree, p)[0] {
            ParaItem::Run(r) => *r,
            ParaItem::Event(_) => panic!("expected run"),
        };
        assert!(!run_is_bold(&tree, run));
    }

    #[test]
    fn test_heading_prefix_from_outline_level() {
        let tree = body_tree(
            r#"<w:p><w:pPr><w:outlineLvl w:val="1"/></w:pPr><w:r><w:t>Scope</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        assert_eq!(paragraph_prefix(&tree, &Styles::default(), p), "## ");
    }

    #[test]
    fn test_heading_heuristic_caps_bold() {
        let tree = body_tree(
            r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>GOVERNING LAW</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        assert_eq!(paragraph_prefix(&tree, &Styles::default(), p), "## ");
    }

    #[test]
    fn test_heading_heuristic_rejects_lowercase() {
        let tree = body_tree(
            r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>Governing Law</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        assert_eq!(paragraph_prefix(&tree, &Styles::default(), p), "");
    }

    #[test]
    fn test_coalesce_merges_identical_runs() {
        let mut tree = body_tree(
            r#"<w:p><w:r><w:t>Con</w:t></w:r><w:r><w:t>tract</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        coalesce_runs(&mut tree, p);
        let items = paragraph_items(&tree, p);
        assert_eq!(items.len(), 1);
        let run = match &items[0] {
            ParaItem::Run(r) => *r,
            ParaItem::Event(_) => panic!("expected run"),
        };
        assert_eq!(run_text(&tree, run), "Contract");
    }

    #[test]
    fn test_coalesce_respects_formatting_difference() {
        let mut tree = body_tree(
            r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>Bold</w:t></w:r><w:r><w:t>Plain</w:t></w:r></w:p>"#,
        );
        let p = first_paragraph(&tree);
        coalesce_runs(&mut tree, p);
        assert_eq!(paragraph_items(&tree, p).len(), 2);
    }
}

//! Arena-backed XML tree for DOCX part manipulation.
//!
//! Parsed with `quick-xml` into a flat arena of nodes addressed by
//! [`NodeId`] handles. Handles stay valid across structural mutation
//! (splits, inserts, detaches) because nodes are never moved or freed;
//! a detached node simply becomes unreachable from the root and is not
//! serialized.
//!
//! Tags and attribute names are stored prefixed (`w:p`, `w16du:dateUtc`)
//! exactly as they appear in the part. Namespace declarations are plain
//! attributes on the root element and round-trip untouched.
//!
//! Text is stored on the element itself (`w:t`, `w:delText` and friends
//! are text-only leaves in WordprocessingML; mixed content does not
//! occur in the parts this crate touches).

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Handle to a node in an [`XmlTree`] arena.
///
/// Valid for the lifetime of the tree it was issued by. Stable across
/// mutation; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An XML document held as a node arena.
#[derive(Debug, Clone)]
pub struct XmlTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl XmlTree {
    /// Create a tree with a single empty root element.
    pub fn new(root_tag: &str) -> Self {
        let root = Node {
            tag: root_tag.to_owned(),
            attrs: Vec::new(),
            text: None,
            parent: None,
            children: Vec::new(),
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    /// Parse a part's XML bytes into a tree.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed XML or when no root element exists.
    pub fn parse(xml: &[u8]) -> Result<Self, quick_xml::Error> {
        let mut reader = Reader::from_reader(xml);
        let mut buf = Vec::new();

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut root: Option<NodeId> = None;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    let id = push_element(&mut nodes, &e, stack.last().copied())?;
                    if root.is_none() {
                        root = Some(id);
                    }
                    stack.push(id);
                }
                Event::Empty(e) => {
                    let id = push_element(&mut nodes, &e, stack.last().copied())?;
                    if root.is_none() {
                        root = Some(id);
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(e) => {
                    if let Some(&current) = stack.last() {
                        let decoded = e.unescape()?;
                        match &mut nodes[current.0 as usize].text {
                            Some(t) => t.push_str(&decoded),
                            slot => *slot = Some(decoded.into_owned()),
                        }
                    }
                }
                Event::CData(e) => {
                    if let Some(&current) = stack.last() {
                        let raw = String::from_utf8_lossy(e.as_ref()).into_owned();
                        match &mut nodes[current.0 as usize].text {
                            Some(t) => t.push_str(&raw),
                            slot => *slot = Some(raw),
                        }
                    }
                }
                Event::Eof => break,
                // Declaration, comments, PIs and doctype carry nothing we
                // need to round-trip; the writer emits a fresh declaration.
                _ => {}
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| {
            quick_xml::Error::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no root element",
            )))
        })?;
        Ok(Self { nodes, root })
    }

    /// Serialize the tree (nodes reachable from the root) back to bytes,
    /// with a standalone UTF-8 declaration as Word emits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        // Writing to an in-memory cursor cannot fail.
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))));
        self.write_node(&mut writer, self.root);
        writer.into_inner().into_inner()
    }

    fn write_node(&self, writer: &mut Writer<Cursor<Vec<u8>>>, id: NodeId) {
        let node = &self.nodes[id.0 as usize];
        let mut start = BytesStart::new(node.tag.as_str());
        for (k, v) in &node.attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }

        if node.children.is_empty() && node.text.is_none() {
            let _ = writer.write_event(Event::Empty(start));
            return;
        }

        let _ = writer.write_event(Event::Start(start));
        if let Some(text) = &node.text {
            let _ = writer.write_event(Event::Text(BytesText::new(text)));
        }
        for &child in &node.children {
            self.write_node(writer, child);
        }
        let _ = writer.write_event(Event::End(BytesEnd::new(node.tag.as_str())));
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn tag(&self, id: NodeId) -> &str {
        &self.nodes[id.0 as usize].tag
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id.0 as usize]
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let attrs = &mut self.nodes[id.0 as usize].attrs;
        if let Some(slot) = attrs.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_owned();
        } else {
            attrs.push((name.to_owned(), value.to_owned()));
        }
    }

    /// Rename an element in place, keeping attributes and children.
    pub fn set_tag(&mut self, id: NodeId, tag: &str) {
        self.nodes[id.0 as usize].tag = tag.to_owned();
    }

    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        &self.nodes[id.0 as usize].attrs
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.nodes[id.0 as usize].text.as_deref()
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        self.nodes[id.0 as usize].text = Some(text.to_owned());
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0 as usize].children
    }

    /// First direct child with the given tag.
    pub fn child_by_tag(&self, id: NodeId, tag: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|&c| self.tag(c) == tag)
    }

    /// Index of `child` within its parent's child list.
    pub fn position(&self, child: NodeId) -> Option<usize> {
        let parent = self.parent(child)?;
        self.children(parent).iter().position(|&c| c == child)
    }

    /// Next sibling of `id`, if any.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.position(id)?;
        self.children(parent).get(idx + 1).copied()
    }

    // ------------------------------------------------------------------
    // Structure mutation
    // ------------------------------------------------------------------

    /// Create a detached element.
    pub fn create(&mut self, tag: &str) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            tag: tag.to_owned(),
            attrs: Vec::new(),
            text: None,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    /// Create a detached text-leaf element.
    pub fn create_with_text(&mut self, tag: &str, text: &str) -> NodeId {
        let id = self.create(tag);
        self.set_text(id, text);
        id
    }

    /// Append `child` as the last child of `parent`. Detaches `child`
    /// from any previous parent first.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0 as usize].parent = Some(parent);
        self.nodes[parent.0 as usize].children.push(child);
    }

    /// Insert `child` at `index` within `parent`'s children.
    pub fn insert(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        self.nodes[child.0 as usize].parent = Some(parent);
        let children = &mut self.nodes[parent.0 as usize].children;
        let index = index.min(children.len());
        children.insert(index, child);
    }

    /// Insert `node` as the sibling immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: NodeId, node: NodeId) {
        if let (Some(parent), Some(idx)) = (self.parent(anchor), self.position(anchor)) {
            self.insert(parent, idx + 1, node);
        }
    }

    /// Remove `id` from its parent's child list. The node itself (and its
    /// subtree) stays in the arena but is no longer serialized.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0 as usize].parent.take() {
            self.nodes[parent.0 as usize].children.retain(|&c| c != id);
        }
    }

    /// Replace `old` with `new` at the same position under `old`'s parent.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        if let (Some(parent), Some(idx)) = (self.parent(old), self.position(old)) {
            self.detach(old);
            self.insert(parent, idx, new);
        }
    }

    /// Deep-copy the subtree rooted at `id`; the copy is detached.
    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let node = self.nodes[id.0 as usize].clone();
        let copy = self.create(&node.tag);
        self.nodes[copy.0 as usize].attrs = node.attrs;
        self.nodes[copy.0 as usize].text = node.text;
        for child in node.children {
            let child_copy = self.deep_clone(child);
            self.append(copy, child_copy);
        }
        copy
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Pre-order descendants of `id`, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// All descendants of the root (root included) with the given tag.
    pub fn find_all(&self, tag: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        if self.tag(self.root) == tag {
            out.push(self.root);
        }
        out.extend(
            self.descendants(self.root)
                .into_iter()
                .filter(|&n| self.tag(n) == tag),
        );
        out
    }

    /// All descendants of the root with `tag` whose attribute `attr`
    /// equals `value`.
    pub fn find_all_with_attr(&self, tag: &str, attr: &str, value: &str) -> Vec<NodeId> {
        self.find_all(tag)
            .into_iter()
            .filter(|&n| self.attr(n, attr) == Some(value))
            .collect()
    }
}

fn push_element(
    nodes: &mut Vec<Node>,
    e: &BytesStart<'_>,
    parent: Option<NodeId>,
) -> Result<NodeId, quick_xml::Error> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::InvalidAttr)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }

    let id = NodeId(nodes.len() as u32);
    nodes.push(Node {
        tag,
        attrs,
        text: None,
        parent,
        children: Vec::new(),
    });
    if let Some(parent) = parent {
        nodes[parent.0 as usize].children.push(id);
    }
    Ok(id)
}

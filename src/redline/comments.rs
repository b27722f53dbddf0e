//! The four-part modern comment store.
//!
//! Word splits comment data across `word/comments.xml` (text and
//! authorship), `commentsExtended.xml` (threading and resolution state,
//! keyed by the `w14:paraId` of each comment's paragraph),
//! `commentsIds.xml` (durable ids) and `commentsExtensible.xml`
//! (UTC dates keyed by durable id). All four are parsed if present and
//! created otherwise; created parts get their content-type override and
//! document relationship registered at flush.
//!
//! Extension namespaces must be flagged `mc:Ignorable` on the comments
//! root or old Word builds drop the attributes on resave.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::error::RedlineResult;
use crate::package::Package;
use crate::xml::{NodeId, XmlTree};

const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const W14_NS: &str = "http://schemas.microsoft.com/office/word/2010/wordml";
const W15_NS: &str = "http://schemas.microsoft.com/office/word/2012/wordml";
const W16CID_NS: &str = "http://schemas.microsoft.com/office/word/2016/wordml/cid";
const W16CEX_NS: &str = "http://schemas.microsoft.com/office/word/2018/wordml/cex";
const MC_NS: &str = "http://schemas.openxmlformats.org/markup-compatibility/2006";

const COMMENTS_CT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.comments+xml";
const EXTENDED_CT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsExtended+xml";
const IDS_CT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsIds+xml";
const EXTENSIBLE_CT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsExtensible+xml";

const COMMENTS_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments";
const EXTENDED_REL: &str =
    "http://schemas.microsoft.com/office/2011/relationships/commentsExtended";
const IDS_REL: &str = "http://schemas.microsoft.com/office/2016/09/relationships/commentsIds";
const EXTENSIBLE_REL: &str =
    "http://schemas.microsoft.com/office/2018/08/relationships/commentsExtensible";

/// Extracted metadata for one existing comment.
#[derive(Debug, Clone)]
pub struct CommentData {
    pub author: String,
    pub text: String,
    pub date: String,
    pub resolved: bool,
    pub parent_id: Option<String>,
}

/// In-memory view of the comment parts, flushed back at save.
#[derive(Debug, Clone)]
pub struct CommentStore {
    comments: XmlTree,
    extended: XmlTree,
    ids: XmlTree,
    extensible: XmlTree,
    comments_name: String,
    extended_name: String,
    ids_name: String,
    extensible_name: String,
    next_id: u32,
}

impl CommentStore {
    /// Parse existing comment parts out of `package`, creating empty
    /// trees for the parts it lacks.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing part fails to parse.
    pub fn load(package: &Package) -> RedlineResult<Self> {
        let comments_name = part_for_content_type(package, COMMENTS_CT)
            .unwrap_or_else(|| "word/comments.xml".to_owned());
        let extended_name = part_for_content_type(package, EXTENDED_CT)
            .unwrap_or_else(|| "word/commentsExtended.xml".to_owned());
        let ids_name = part_for_content_type(package, IDS_CT)
            .unwrap_or_else(|| "word/commentsIds.xml".to_owned());
        let extensible_name = part_for_content_type(package, EXTENSIBLE_CT)
            .unwrap_or_else(|| "word/commentsExtensible.xml".to_owned());

        let mut comments = if package.has_part(&comments_name) {
            package.parse_part(&comments_name)?
        } else {
            info!(part = %comments_name, "creating comments part");
            XmlTree::new("w:comments")
        };
        ensure_comment_namespaces(&mut comments);

        let extended = if package.has_part(&extended_name) {
            package.parse_part(&extended_name)?
        } else {
            let mut tree = XmlTree::new("w15:commentsEx");
            tree.set_attr(tree.root(), "xmlns:w15", W15_NS);
            tree
        };
        let ids = if package.has_part(&ids_name) {
            package.parse_part(&ids_name)?
        } else {
            let mut tree = XmlTree::new("w16cid:commentsIds");
            tree.set_attr(tree.root(), "xmlns:w16cid", W16CID_NS);
            tree
        };
        let extensible = if package.has_part(&extensible_name) {
            package.parse_part(&extensible_name)?
        } else {
            let mut tree = XmlTree::new("w16cex:commentsExtensible");
            tree.set_attr(tree.root(), "xmlns:w16cex", W16CEX_NS);
            tree
        };

        let next_id = next_comment_id(&comments);
        debug!(next_id, "comment store loaded");

        Ok(Self {
            comments,
            extended,
            ids,
            extensible,
            comments_name,
            extended_name,
            ids_name,
            extensible_name,
            next_id,
        })
    }

    /// Append a comment (optionally a reply) across all four parts.
    /// Returns the new comment id.
    pub fn add(&mut self, author: &str, text: &str, parent_id: Option<&str>) -> String {
        let comment_id = self.next_id.to_string();
        self.next_id += 1;
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        info!(comment_id = %comment_id, parent = ?parent_id, "adding comment");

        let para_id = random_hex8();
        let rsid = random_hex8();

        let tree = &mut self.comments;
        let root = tree.root();
        let comment = tree.create("w:comment");
        tree.set_attr(comment, "w:id", &comment_id);
        tree.set_attr(comment, "w:author", author);
        tree.set_attr(comment, "w:date", &now);
        let initials = initials_of(author);
        if !initials.is_empty() {
            tree.set_attr(comment, "w:initials", &initials);
        }

        let p = tree.create("w:p");
        tree.set_attr(p, "w14:paraId", &para_id);
        tree.set_attr(p, "w14:textId", "77777777");
        tree.set_attr(p, "w:rsidR", &rsid);
        tree.set_attr(p, "w:rsidRDefault", &rsid);
        tree.set_attr(p, "w:rsidP", &rsid);

        let ppr = tree.create("w:pPr");
        let pstyle = tree.create("w:pStyle");
        tree.set_attr(pstyle, "w:val", "CommentText");
        tree.append(ppr, pstyle);
        tree.append(p, ppr);

        // Annotation-reference run, then the body text run.
        let ref_run = tree.create("w:r");
        let rpr = tree.create("w:rPr");
        let rstyle = tree.create("w:rStyle");
        tree.set_attr(rstyle, "w:val", "CommentReference");
        tree.append(rpr, rstyle);
        tree.append(ref_run, rpr);
        let annotation = tree.create("w:annotationRef");
        tree.append(ref_run, annotation);
        tree.append(p, ref_run);

        let text_run = tree.create("w:r");
        let t = tree.create_with_text("w:t", text);
        tree.append(text_run, t);
        tree.append(p, text_run);

        tree.append(comment, p);
        tree.append(root, comment);

        // Replies point at the thread root's paraId; Word flattens
        // nested replies the same way.
        let parent_para_id = parent_id.and_then(|pid| self.thread_root_para_id(pid));

        let ext_root = self.extended.root();
        let entry = self.extended.create("w15:commentEx");
        self.extended.set_attr(entry, "w15:paraId", &para_id);
        if let Some(parent_para) = &parent_para_id {
            self.extended.set_attr(entry, "w15:paraIdParent", parent_para);
        }
        self.extended.set_attr(entry, "w15:done", "0");
        self.extended.append(ext_root, entry);

        let durable_id = random_hex8();
        let ids_root = self.ids.root();
        let id_entry = self.ids.create("w16cid:commentId");
        self.ids.set_attr(id_entry, "w16cid:paraId", &para_id);
        self.ids.set_attr(id_entry, "w16cid:durableId", &durable_id);
        self.ids.append(ids_root, id_entry);

        let exb_root = self.extensible.root();
        let exb = self.extensible.create("w16cex:commentExtensible");
        self.extensible.set_attr(exb, "w16cex:durableId", &durable_id);
        self.extensible.set_attr(exb, "w16cex:dateUtc", &now);
        self.extensible.append(exb_root, exb);

        comment_id
    }

    fn para_id_of(&self, comment_id: &str) -> Option<String> {
        for &comment in &self.comment_nodes() {
            if self.comments.attr(comment, "w:id") != Some(comment_id) {
                continue;
            }
            for &p in self.comments.children(comment) {
                if self.comments.tag(p) == "w:p" {
                    if let Some(pid) = self.comments.attr(p, "w14:paraId") {
                        return Some(pid.to_owned());
                    }
                }
            }
        }
        None
    }

    /// The `paraId` of the root comment of `comment_id`'s thread.
    fn thread_root_para_id(&self, comment_id: &str) -> Option<String> {
        let direct = self.para_id_of(comment_id)?;
        for &entry in self.extended.children(self.extended.root()) {
            if self.extended.attr(entry, "w15:paraId") == Some(direct.as_str()) {
                if let Some(parent) = self.extended.attr(entry, "w15:paraIdParent") {
                    return Some(parent.to_owned());
                }
            }
        }
        Some(direct)
    }

    fn comment_nodes(&self) -> Vec<NodeId> {
        self.comments
            .children(self.comments.root())
            .iter()
            .copied()
            .filter(|&c| self.comments.tag(c) == "w:comment")
            .collect()
    }

    /// Extract author/text/date/resolved/parent for every comment,
    /// with threading resolved through the extended part.
    pub fn snapshot(&self) -> BTreeMap<String, CommentData> {
        let mut data = BTreeMap::new();
        let mut para_to_comment: BTreeMap<String, String> = BTreeMap::new();

        for &comment in &self.comment_nodes() {
            let Some(id) = self.comments.attr(comment, "w:id") else {
                continue;
            };
            let author = self
                .comments
                .attr(comment, "w:author")
                .unwrap_or("Unknown")
                .to_owned();
            let date = self.comments.attr(comment, "w:date").unwrap_or("").to_owned();
            let resolved = matches!(
                self.comments.attr(comment, "w15:done"),
                Some("1" | "true" | "on")
            );
            // Legacy threading attribute; the extended part overrides it.
            let parent_id = self.comments.attr(comment, "w15:p").map(str::to_owned);

            let mut text_parts: Vec<String> = Vec::new();
            for &p in self.comments.children(comment) {
                if self.comments.tag(p) != "w:p" {
                    continue;
                }
                if let Some(pid) = self.comments.attr(p, "w14:paraId") {
                    para_to_comment.insert(pid.to_owned(), id.to_owned());
                }
                let mut line = String::new();
                for &r in self.comments.children(p) {
                    if self.comments.tag(r) != "w:r" {
                        continue;
                    }
                    for &t in self.comments.children(r) {
                        if self.comments.tag(t) == "w:t" {
                            line.push_str(self.comments.text(t).unwrap_or(""));
                        }
                    }
                }
                text_parts.push(line);
            }
            let text = text_parts.join("\n").trim().to_owned();

            data.insert(
                id.to_owned(),
                CommentData {
                    author,
                    text,
                    date,
                    resolved,
                    parent_id,
                },
            );
        }

        for &entry in self.extended.children(self.extended.root()) {
            let (Some(para), Some(parent_para)) = (
                self.extended.attr(entry, "w15:paraId"),
                self.extended.attr(entry, "w15:paraIdParent"),
            ) else {
                continue;
            };
            let (Some(child), Some(parent)) =
                (para_to_comment.get(para), para_to_comment.get(parent_para))
            else {
                continue;
            };
            if let Some(slot) = data.get_mut(child) {
                slot.parent_id = Some(parent.clone());
            }
        }

        data
    }

    /// Write all four parts into the package and register their
    /// content types and document relationships.
    ///
    /// # Errors
    ///
    /// Returns an error when the content-type or relationship parts are
    /// malformed.
    pub fn flush(&self, package: &mut Package) -> RedlineResult<()> {
        let parts: [(&str, &XmlTree, &str, &str); 4] = [
            (&self.comments_name, &self.comments, COMMENTS_CT, COMMENTS_REL),
            (&self.extended_name, &self.extended, EXTENDED_CT, EXTENDED_REL),
            (&self.ids_name, &self.ids, IDS_CT, IDS_REL),
            (
                &self.extensible_name,
                &self.extensible,
                EXTENSIBLE_CT,
                EXTENSIBLE_REL,
            ),
        ];
        for (name, tree, content_type, rel_type) in parts {
            package.set_part(name, tree.to_bytes());
            package.ensure_content_type(&format!("/{name}"), content_type)?;
            let target = name.trim_start_matches("word/");
            package.ensure_relationship(rel_type, target)?;
        }
        Ok(())
    }
}

fn ensure_comment_namespaces(tree: &mut XmlTree) {
    let root = tree.root();
    let wanted = [
        ("xmlns:w", W_NS),
        ("xmlns:w14", W14_NS),
        ("xmlns:w15", W15_NS),
        ("xmlns:w16cid", W16CID_NS),
        ("xmlns:w16cex", W16CEX_NS),
        ("xmlns:mc", MC_NS),
    ];
    for (name, value) in wanted {
        if tree.attr(root, name).is_none() {
            tree.set_attr(root, name, value);
        }
    }
    tree.set_attr(root, "mc:Ignorable", "w14 w15 w16cid w16cex");
}

fn next_comment_id(comments: &XmlTree) -> u32 {
    let mut max = 0u32;
    for &comment in comments.children(comments.root()) {
        if comments.tag(comment) != "w:comment" {
            continue;
        }
        if let Some(id) = comments.attr(comment, "w:id") {
            if let Ok(n) = id.parse::<u32>() {
                max = max.max(n);
            }
        }
    }
    max + 1
}

/// Part name (without leading slash) carrying `content_type`, per the
/// `[Content_Types].xml` overrides. Safer than relationship types, which
/// vary by Word version.
fn part_for_content_type(package: &Package, content_type: &str) -> Option<String> {
    let types = package.parse_part("[Content_Types].xml").ok()?;
    for &child in types.children(types.root()) {
        if types.tag(child) == "Override"
            && types.attr(child, "ContentType") == Some(content_type)
        {
            if let Some(name) = types.attr(child, "PartName") {
                return Some(name.trim_start_matches('/').to_owned());
            }
        }
    }
    None
}

fn random_hex8() -> String {
    format!("{:08X}", rand::thread_rng().gen::<u32>())
}

fn initials_of(author: &str) -> String {
    author
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_store() -> CommentStore {
        CommentStore {
            comments: {
                let mut t = XmlTree::new("w:comments");
                ensure_comment_namespaces(&mut t);
                t
            },
            extended: XmlTree::new("w15:commentsEx"),
            ids: XmlTree::new("w16cid:commentsIds"),
            extensible: XmlTree::new("w16cex:commentsExtensible"),
            comments_name: "word/comments.xml".to_owned(),
            extended_name: "word/commentsExtended.xml".to_owned(),
            ids_name: "word/commentsIds.xml".to_owned(),
            extensible_name: "word/commentsExtensible.xml".to_owned(),
            next_id: 1,
        }
    }

    #[test]
    fn test_add_populates_all_four_parts() {
        let mut store = empty_store();
        let id = store.add("Review Bot", "needs a cap", None);
        assert_eq!(id, "1");
        assert_eq!(store.comment_nodes().len(), 1);
        assert_eq!(store.extended.children(store.extended.root()).len(), 1);
        assert_eq!(store.ids.children(store.ids.root()).len(), 1);
        assert_eq!(store.extensible.children(store.extensible.root()).len(), 1);

        let comment = store.comment_nodes()[0];
        assert_eq!(store.comments.attr(comment, "w:initials"), Some("RB"));
    }

    #[test]
    fn test_reply_links_to_thread_root() {
        let mut store = empty_store();
        let root_id = store.add("A", "root", None);
        let reply_id = store.add("B", "first reply", Some(&root_id));
        // Replying to the reply must still anchor to the root's paraId.
        store.add("C", "second reply", Some(&reply_id));

        let root_para = store.para_id_of(&root_id).unwrap();
        let entries: Vec<NodeId> = store.extended.children(store.extended.root()).to_vec();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            store.extended.attr(entries[1], "w15:paraIdParent"),
            Some(root_para.as_str())
        );
        assert_eq!(
            store.extended.attr(entries[2], "w15:paraIdParent"),
            Some(root_para.as_str())
        );
    }

    #[test]
    fn test_snapshot_resolves_threading() {
        let mut store = empty_store();
        let root_id = store.add("A", "root", None);
        let reply_id = store.add("B", "reply", Some(&root_id));
        let data = store.snapshot();
        assert_eq!(data[&reply_id].parent_id.as_deref(), Some(root_id.as_str()));
        assert_eq!(data[&root_id].parent_id, None);
        assert_eq!(data[&root_id].text, "root");
        assert!(!data[&root_id].resolved);
    }

    #[test]
    fn test_next_id_continues_after_existing() {
        let xml = br#"<w:comments xmlns:w="ns"><w:comment w:id="7" w:author="X"/></w:comments>"#;
        let comments = XmlTree::parse(xml).unwrap();
        assert_eq!(next_comment_id(&comments), 8);
    }
}

//! DOCX package container.
//!
//! A DOCX file is a zip of XML parts. The engine only ever parses and
//! rewrites the parts it touches (document body, headers/footers, the
//! comment parts); everything else round-trips byte-for-byte in the
//! original entry order. New parts (created comment stores) are appended
//! and registered in `[Content_Types].xml` and the document's
//! relationship part.

use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{RedlineError, RedlineResult};
use crate::xml::XmlTree;

/// Main document part name.
pub const DOCUMENT_PART: &str = "word/document.xml";

const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const DOCUMENT_RELS_PART: &str = "word/_rels/document.xml.rels";

/// An opened DOCX package: ordered raw parts.
#[derive(Debug, Clone)]
pub struct Package {
    parts: Vec<(String, Vec<u8>)>,
}

impl Package {
    /// Open a package from DOCX bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RedlineError::PackageLoad`] when the bytes are not a
    /// valid zip or the main document part is missing.
    pub fn from_bytes(bytes: &[u8]) -> RedlineResult<Self> {
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(|e| RedlineError::PackageLoad {
                reason: e.to_string(),
            })?;

        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| RedlineError::PackageLoad {
                reason: e.to_string(),
            })?;
            if entry.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| RedlineError::PackageLoad {
                    reason: e.to_string(),
                })?;
            parts.push((entry.name().to_owned(), data));
        }

        let package = Self { parts };
        if package.part(DOCUMENT_PART).is_none() {
            return Err(RedlineError::PackageLoad {
                reason: format!("no {DOCUMENT_PART} part"),
            });
        }
        Ok(package)
    }

    /// Serialize the package back to DOCX bytes, preserving entry order.
    ///
    /// # Errors
    ///
    /// Returns an error if zip serialization fails.
    pub fn to_bytes(&self) -> RedlineResult<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, data) in &self.parts {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(data)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    /// Raw bytes of a part, if present.
    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    /// Replace a part's bytes, or append the part if it does not exist.
    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        if let Some(slot) = self.parts.iter_mut().find(|(n, _)| n == name) {
            slot.1 = data;
        } else {
            self.parts.push((name.to_owned(), data));
        }
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.parts.iter().any(|(n, _)| n == name)
    }

    /// Names of all parts in package order.
    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(n, _)| n.as_str())
    }

    /// Parse a part as XML.
    ///
    /// # Errors
    ///
    /// Returns [`RedlineError::MissingPart`] or an XML error.
    pub fn parse_part(&self, name: &str) -> RedlineResult<XmlTree> {
        let bytes = self.part(name).ok_or_else(|| RedlineError::MissingPart {
            part: name.to_owned(),
        })?;
        XmlTree::parse(bytes).map_err(|source| RedlineError::Xml {
            part: name.to_owned(),
            source,
        })
    }

    /// Register a content-type `<Override>` for a part (idempotent).
    ///
    /// `part_name` is package-absolute, e.g. `/word/comments.xml`.
    ///
    /// # Errors
    ///
    /// Returns an error if `[Content_Types].xml` is missing or malformed.
    pub fn ensure_content_type(&mut self, part_name: &str, content_type: &str) -> RedlineResult<()> {
        let mut types = self.parse_part(CONTENT_TYPES_PART)?;
        let root = types.root();

        let exists = types
            .children(root)
            .iter()
            .any(|&c| types.tag(c) == "Override" && types.attr(c, "PartName") == Some(part_name));
        if exists {
            return Ok(());
        }

        let node = types.create("Override");
        types.set_attr(node, "PartName", part_name);
        types.set_attr(node, "ContentType", content_type);
        types.append(root, node);

        self.set_part(CONTENT_TYPES_PART, types.to_bytes());
        Ok(())
    }

    /// Ensure the main document part has a relationship of `rel_type` to
    /// `target` (relative to `word/`). Returns the relationship id.
    ///
    /// # Errors
    ///
    /// Returns an error if the relationship part is malformed.
    pub fn ensure_relationship(&mut self, rel_type: &str, target: &str) -> RedlineResult<String> {
        let mut rels = if self.has_part(DOCUMENT_RELS_PART) {
            self.parse_part(DOCUMENT_RELS_PART)?
        } else {
            let mut tree = XmlTree::new("Relationships");
            tree.set_attr(
                tree.root(),
                "xmlns",
                "http://schemas.openxmlformats.org/package/2006/relationships",
            );
            tree
        };
        let root = rels.root();

        let mut max_rid = 0u32;
        for &child in rels.children(root) {
            if rels.attr(child, "Target") == Some(target) {
                if let Some(id) = rels.attr(child, "Id") {
                    return Ok(id.to_owned());
                }
            }
            if let Some(id) = rels.attr(child, "Id") {
                if let Ok(n) = id.trim_start_matches("rId").parse::<u32>() {
                    max_rid = max_rid.max(n);
                }
            }
        }

        let rid = format!("rId{}", max_rid + 1);
        let node = rels.create("Relationship");
        rels.set_attr(node, "Id", &rid);
        rels.set_attr(node, "Type", rel_type);
        rels.set_attr(node, "Target", target);
        rels.append(root, node);

        self.set_part(DOCUMENT_RELS_PART, rels.to_bytes());
        Ok(rid)
    }
}

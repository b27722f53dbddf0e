//! An explicit editing session over one document.
//!
//! Front ends drive redlining in two phases: phase 1 extracts the
//! logical text a caller (human or model) writes edits against, phase 2
//! applies the resulting batch. [`Session`] carries the engine across
//! both phases, so the extracted text and the matched document are
//! guaranteed to come from the same normalized tree. Callers thread the
//! session through both calls instead of relying on any process-wide
//! state.

use tracing::{debug, info};

use crate::edit::diff::generate_edits_from_text;
use crate::error::RedlineResult;
use crate::models::{BatchOutcome, DocumentEdit, ReviewAction, ViewKind};
use crate::package::Package;
use crate::redline::Engine;
use crate::xml::XmlTree;

const SETTINGS_PART: &str = "word/settings.xml";
const SETTINGS_CT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.settings+xml";
const SETTINGS_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/settings";
const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

/// One redlining session: open, read text, apply edit or review
/// batches in any order, then save.
pub struct Session {
    engine: Engine,
}

impl Session {
    /// Load a DOCX and normalize it for editing. All changes produced
    /// through this session are attributed to `author`.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not a readable DOCX package.
    pub fn open(bytes: &[u8], author: &str) -> RedlineResult<Self> {
        Ok(Self {
            engine: Engine::new(bytes, author)?,
        })
    }

    /// The logical text of the document in `view`. This is the exact
    /// string phase-2 targets are matched against.
    pub fn text(&mut self, view: ViewKind) -> &str {
        self.engine.text(view)
    }

    /// Apply a batch of targeted edits as tracked changes.
    pub fn apply_edits(&mut self, edits: Vec<DocumentEdit>) -> BatchOutcome {
        self.engine.apply_edits(edits)
    }

    /// Apply a batch with word-level diff refinement: only the words
    /// that actually differ inside each matched range are marked.
    pub fn apply_edits_refined(&mut self, edits: Vec<DocumentEdit>) -> BatchOutcome {
        self.engine.apply_edits_refined(edits)
    }

    /// Parse a JSON edit batch and apply it refined. This is the shape
    /// front ends deliver.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON does not parse; individual edit
    /// failures are reported in the outcome, never as errors.
    pub fn apply_edits_json(&mut self, edits_json: &str) -> RedlineResult<BatchOutcome> {
        let edits: Vec<DocumentEdit> = serde_json::from_str(edits_json)?;
        info!(count = edits.len(), "applying JSON edit batch");
        Ok(self.engine.apply_edits_refined(edits))
    }

    /// Diff a full rewrite of the `view` text against the document and
    /// apply the differences as indexed edits.
    ///
    /// Useful when a caller rewrites whole passages rather than
    /// supplying targeted replacements.
    pub fn apply_rewrite(&mut self, modified_text: &str, view: ViewKind) -> BatchOutcome {
        let original = self.engine.text(view).to_owned();
        let mut edits = generate_edits_from_text(&original, modified_text);
        for edit in &mut edits {
            edit.view = view;
        }
        debug!(count = edits.len(), "rewrite diff produced edits");
        self.engine.apply_edits(edits)
    }

    /// Accept, reject, or reply to existing tracked changes and
    /// comments.
    pub fn apply_review_actions(&mut self, actions: &[ReviewAction]) -> BatchOutcome {
        self.engine.apply_review_actions(actions)
    }

    /// Accept every outstanding revision in one pass.
    pub fn accept_all(&mut self) {
        self.engine.accept_all_revisions();
    }

    /// The underlying engine, for callers needing its full surface.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Serialize back to DOCX bytes with track changes switched on and
    /// editing locks removed, so the result opens straight into review
    /// mode.
    ///
    /// # Errors
    ///
    /// Returns an error when a package part cannot be serialized.
    pub fn save(&mut self) -> RedlineResult<Vec<u8>> {
        strip_edit_protection(&mut self.engine);
        enable_track_changes(&mut self.engine.doc.package)?;
        self.engine.save()
    }
}

/// Drop range-permission and lock markers from every mapped part.
/// Protected regions would otherwise stop reviewers from accepting the
/// very changes this session created.
fn strip_edit_protection(engine: &mut Engine) {
    let mut removed = 0usize;
    for part in 0..engine.doc.parts.len() {
        let tree = engine.doc.tree_mut(part);
        for tag in ["w:permStart", "w:permEnd", "w:lock"] {
            for node in tree.find_all(tag) {
                tree.detach(node);
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!(removed, "stripped edit-protection markers");
    }
}

/// Turn on `w:trackRevisions` in the settings part and drop settings
/// that would hide or freeze the revision view.
fn enable_track_changes(package: &mut Package) -> RedlineResult<()> {
    let mut settings = if package.has_part(SETTINGS_PART) {
        package.parse_part(SETTINGS_PART)?
    } else {
        info!(part = SETTINGS_PART, "creating settings part");
        package.ensure_content_type(&format!("/{SETTINGS_PART}"), SETTINGS_CT)?;
        package.ensure_relationship(SETTINGS_REL, "settings.xml")?;
        let mut tree = XmlTree::new("w:settings");
        tree.set_attr(tree.root(), "xmlns:w", W_NS);
        tree
    };

    let root = settings.root();
    if settings.child_by_tag(root, "w:trackRevisions").is_none() {
        let node = settings.create("w:trackRevisions");
        settings.append(root, node);
    }
    for tag in [
        "w:revisionView",
        "w:documentProtection",
        "w:writeProtection",
        "w:docFinal",
    ] {
        for node in settings.find_all(tag) {
            settings.detach(node);
        }
    }

    package.set_part(SETTINGS_PART, settings.to_bytes());
    Ok(())
}

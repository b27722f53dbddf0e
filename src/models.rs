//! Public edit and review-action models.
//!
//! These arrive as JSON batches from the tool-call front ends; the
//! engine-private match state never crosses the serialization boundary.

use serde::{Deserialize, Serialize};

/// The derived kind of a classified edit. Never user-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insertion,
    Deletion,
    Modification,
}

/// Which logical-text view an edit was matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewKind {
    /// Markup view: redline wrappers and metadata blocks included.
    #[default]
    Raw,
    /// Accepted-changes view: deletions hidden, insertions unwrapped.
    Clean,
}

/// A single atomic "replace target with new" edit request.
///
/// `new_text` may use Markdown formatting (`# Title`, `**bold**`,
/// `_italic_`); the engine renders it as native formatting inside the
/// tracked insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEdit {
    /// Exact text to find. Include surrounding context when the bare
    /// target is ambiguous.
    pub target_text: String,

    /// Replacement text. Empty means pure deletion.
    #[serde(default)]
    pub new_text: String,

    /// Optional review-pane comment attached to the produced markers.
    #[serde(default)]
    pub comment: Option<String>,

    /// Pre-computed absolute offset into the logical text. Set by the
    /// diff pipeline; absent for heuristic (matcher-located) edits.
    #[serde(skip)]
    pub match_start: Option<usize>,

    /// Resolved operation kind, fixed during classification.
    #[serde(skip)]
    pub op: Option<OpKind>,

    /// View the offset was computed against.
    #[serde(skip)]
    pub view: ViewKind,
}

impl DocumentEdit {
    pub fn new(target_text: impl Into<String>, new_text: impl Into<String>) -> Self {
        Self {
            target_text: target_text.into(),
            new_text: new_text.into(),
            comment: None,
            match_start: None,
            op: None,
            view: ViewKind::Raw,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.match_start = Some(offset);
        self
    }
}

/// Review-pane actions on existing markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewActionType {
    Accept,
    Reject,
    Reply,
}

/// A meta-action targeting an existing tracked change or comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAction {
    pub action: ReviewActionType,

    /// Id string as rendered in the logical text, e.g. `Chg:4` or
    /// `Com:2`. A bare id is treated as both kinds for legacy input.
    pub target_id: String,

    /// Reply body (REPLY only).
    #[serde(default)]
    pub text: Option<String>,
}

/// Why an edit in a batch was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Target absent under every matcher strategy, in every view.
    MatchNotFound,
    /// Target empty on the heuristic (text-only) entry point.
    EmptyTarget,
    /// Could not resolve an anchor or target runs in the tree.
    Unresolvable,
    /// Range already consumed by an earlier edit in this batch.
    Overlap,
    /// Target and replacement are already identical in the document.
    NoChange,
}

/// Outcome of one edit inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct EditStatus {
    /// Leading fragment of the target text, for reporting.
    pub target: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl EditStatus {
    pub(crate) fn applied(target: &str) -> Self {
        Self {
            target: truncate(target),
            applied: true,
            reason: None,
        }
    }

    pub(crate) fn skipped(target: &str, reason: SkipReason) -> Self {
        Self {
            target: truncate(target),
            applied: false,
            reason: Some(reason),
        }
    }
}

fn truncate(text: &str) -> String {
    let mut end = text.len().min(40);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

/// Batch result: per-edit failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub statuses: Vec<EditStatus>,
}

impl BatchOutcome {
    pub(crate) fn record(&mut self, status: EditStatus) {
        if status.applied {
            self.applied += 1;
        } else {
            self.skipped += 1;
        }
        self.statuses.push(status);
    }

    pub(crate) fn merge(&mut self, other: BatchOutcome) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.statuses.extend(other.statuses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_deserializes_without_private_state() {
        let edit: DocumentEdit = serde_json::from_str(
            r#"{"target_text": "deliver", "new_text": "ship", "comment": "tightened"}"#,
        )
        .unwrap();
        assert_eq!(edit.target_text, "deliver");
        assert_eq!(edit.match_start, None);
        assert_eq!(edit.view, ViewKind::Raw);
    }

    #[test]
    fn test_review_action_uppercase() {
        let action: ReviewAction =
            serde_json::from_str(r#"{"action": "ACCEPT", "target_id": "Chg:3"}"#).unwrap();
        assert_eq!(action.action, ReviewActionType::Accept);
    }

    #[test]
    fn test_outcome_counts() {
        let mut outcome = BatchOutcome::default();
        outcome.record(EditStatus::applied("a"));
        outcome.record(EditStatus::skipped("b", SkipReason::MatchNotFound));
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 1);
    }
}

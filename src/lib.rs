//! `redline` — track-changes redlining engine for DOCX.
//!
//! Takes a document as bytes, applies text-targeted edits as native
//! `w:ins`/`w:del` markup with threaded comments, and hands back bytes
//! Word opens straight into review mode.
//!
//! # Flow
//!
//! ```text
//! DOCX bytes → Session::open → text(view)        (phase 1: extract)
//!                  ↓
//!       apply_edits / apply_rewrite /            (phase 2: redline)
//!       apply_review_actions
//!                  ↓
//!              save() → DOCX bytes
//! ```
//!
//! Edits target the *logical text*: a flattened projection of the
//! document in which existing tracked changes render as
//! CriticMarkup-style wrappers (`{--del--}`, `{++ins++}`, `{==range==}`)
//! followed by `{>>[Chg:id] author<<}` metadata blocks. Targets are
//! located with a fuzzy matcher tolerant of whitespace, quote, and
//! formatting-marker variance; replacements are narrowed to word-level
//! diffs so untouched words stay unmarked.

pub mod docx;
pub mod edit;
pub mod error;
pub mod models;
pub mod package;
pub mod redline;
pub mod session;
pub mod xml;

pub use error::{RedlineError, RedlineResult};
pub use models::{BatchOutcome, DocumentEdit, ReviewAction, ReviewActionType, ViewKind};
pub use redline::Engine;
pub use session::Session;

//! Tracked-change authoring over OOXML documents.
//!
//! [`mapper`] projects the tree into logical text, [`engine`] applies
//! edits as native `w:ins`/`w:del` markup, [`comments`] manages the
//! four-part comment store, and [`refine`] narrows replacements to
//! word-level diffs before they hit the tree.

pub mod comments;
pub mod engine;
pub mod mapper;
pub mod refine;

pub use engine::Engine;
pub use mapper::Mapper;

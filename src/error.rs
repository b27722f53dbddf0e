//! Error types for the redline crate.
//!
//! Only loading and serialization failures are errors. Per-edit failures
//! (no match, cross-paragraph span, structural conflict) are skip
//! *outcomes* reported through [`crate::models::BatchOutcome`], never
//! through this type.

/// Redline-specific error types.
#[derive(Debug, thiserror::Error)]
pub enum RedlineError {
    /// Input bytes are not a valid DOCX package.
    #[error("invalid DOCX package: {reason}")]
    PackageLoad { reason: String },

    /// A required package part is missing.
    #[error("missing package part: {part}")]
    MissingPart { part: String },

    /// Zip container error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// XML parse or serialization error in a package part.
    #[error("XML error in {part}: {source}")]
    Xml {
        part: String,
        #[source]
        source: quick_xml::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for redline operations.
pub type RedlineResult<T> = Result<T, RedlineError>;

//! MusicXML import
//!
//! Reads a `score-partwise` document and rebuilds the same [`Tune`] the
//! ABC grammar produces, so the ABC renderer consumes one AST regardless
//! of which direction the conversion runs. Anything the document contains
//! that the AST cannot hold is reported as a diagnostic, never an error;
//! only a malformed document or an unsupported root element aborts.
//!
//! [`Tune`]: crate::models::Tune

mod parser;

pub use parser::parse_score;

use thiserror::Error;

/// Errors that abort an import. Recoverable problems become diagnostics
/// instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unsupported document: {0}")]
    Unsupported(String),
}

//! Typed errors for the failure modes callers may want to match on.
//!
//! Everything else travels as [`anyhow::Error`] with context attached at the
//! point of failure.

use thiserror::Error;

/// Errors raised while populating or finalizing model parameters.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("weight normalization has already been removed; parameters are frozen")]
    AlreadyFinalized,

    #[error("checkpoint is missing parameter `{0}`")]
    MissingParameter(String),

    #[error("checkpoint has {} unexpected parameter(s): {}", .0.len(), .0.join(", "))]
    UnexpectedParameters(Vec<String>),

    #[error("shape mismatch for `{name}`: model expects {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("expected {expected} feature channels, got {found}")]
    FeatureDim { expected: usize, found: usize },
}

/// Errors raised while parsing an utterance manifest.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read manifest")]
    Io(#[from] std::io::Error),

    #[error("malformed manifest line {line}: expected `<utterance_id> <path>`, got {content:?}")]
    MalformedLine { line: usize, content: String },

    #[error("invalid utterance id {id:?} on manifest line {line}: ids name output files and must not contain path separators")]
    InvalidId { line: usize, id: String },
}

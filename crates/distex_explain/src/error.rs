//! Error types for distex_explain.

use thiserror::Error;

/// Result type alias using [`ExplainError`].
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Errors that can occur while explaining a distance.
///
/// Configuration and mask generation errors are raised before the model is
/// called. Model output errors abort the run in progress; the model is
/// assumed deterministic, so nothing is retried.
#[derive(Error, Debug)]
pub enum ExplainError {
    /// Invalid configuration, axis roles, references or parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Masks could not be generated for the requested grid.
    #[error("Mask generation error: {0}")]
    MaskGeneration(String),

    /// The model returned malformed embeddings.
    #[error("Model output error: {0}")]
    ModelOutput(String),

    /// The model call itself failed.
    #[error("Model call failed: {0}")]
    Model(#[from] distex_core::CoreError),

    /// Cancelled before any batch was evaluated.
    #[error("Explanation cancelled before any mask was evaluated")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

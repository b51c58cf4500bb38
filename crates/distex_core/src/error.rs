//! Error types for distex_core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur in distex_core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid array shape provided.
    #[error("Invalid shape: expected {expected}, got {got}")]
    InvalidShape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Shape mismatch between arrays.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Dimension error.
    #[error("Dimension error: expected {expected} dimensions, got {got}")]
    DimensionError {
        /// Expected number of dimensions.
        expected: usize,
        /// Actual number of dimensions.
        got: usize,
    },

    /// Axis roles do not describe the input.
    #[error("Invalid axis roles: {0}")]
    InvalidAxisRoles(String),

    /// The embedding model failed to produce an output.
    #[error("Model error: {0}")]
    ModelError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(err: &CoreError) -> &'static str {
        // Exhaustive on purpose
        match err {
            CoreError::InvalidShape { .. } => "Invalid shape",
            CoreError::ShapeMismatch(_) => "Shape mismatch",
            CoreError::DimensionError { .. } => "Dimension error",
            CoreError::InvalidAxisRoles(_) => "Invalid axis roles",
            CoreError::ModelError(_) => "Model error",
        }
    }

    #[test]
    fn test_error_display() {
        let errors = [
            CoreError::InvalidShape {
                expected: "[2, 2]".to_string(),
                got: "[3]".to_string(),
            },
            CoreError::ShapeMismatch("masks vs input".to_string()),
            CoreError::DimensionError { expected: 3, got: 2 },
            CoreError::InvalidAxisRoles("two channel axes".to_string()),
            CoreError::ModelError("forward failed".to_string()),
        ];
        for err in &errors {
            assert!(err.to_string().starts_with(label(err)));
        }
        assert!(errors[2].to_string().contains("expected 3 dimensions, got 2"));
    }
}

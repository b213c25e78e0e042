//! Error types shared across the runtime

use thiserror::Error;

/// Errors surfaced at the pipeline boundary.
///
/// Every failure inside a generation propagates up as one of these kinds;
/// partial work (latents, borrowed sessions) is released on the way out.
#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unsupported diffuser: {0}")]
    UnsupportedDiffuser(String),

    #[error("unsupported scheduler: {0}")]
    UnsupportedScheduler(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

impl DiffusionError {
    /// Shape-mismatch constructor that accepts any dimension slices.
    pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiffusionError::shape(&[1, 3, 512, 512], &[1, 4, 64, 64]);
        let msg = err.to_string();
        assert!(msg.contains("[1, 3, 512, 512]"));
        assert!(msg.contains("[1, 4, 64, 64]"));
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(DiffusionError::Cancelled.to_string(), "generation cancelled");
    }
}

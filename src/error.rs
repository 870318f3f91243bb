use thiserror::Error;

/// Errors raised when a layer's caller breaks the layer contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("shape mismatch: expected {expected:?}, got {got:?} ({message})")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("stale state: {0}")]
    StaleState(String),
}

pub type Result<T> = std::result::Result<T, LayerError>;

impl LayerError {
    pub(crate) fn shape(expected: &[usize], got: &[usize], message: impl Into<String>) -> Self {
        LayerError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
            message: message.into(),
        }
    }
}

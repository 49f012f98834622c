//! Error types for meshsub core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshsub core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Acknowledgement label failed structural validation
    #[error("invalid acknowledgement label {label:?}: {reason}")]
    LabelInvalid { label: String, reason: String },
}

impl Error {
    pub(crate) fn label_invalid(label: &str, reason: impl Into<String>) -> Self {
        Self::LabelInvalid {
            label: label.to_string(),
            reason: reason.into(),
        }
    }
}

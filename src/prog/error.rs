use thiserror::Error;

use crate::storage::StorageError;

use super::Flow;

/// Errors a label handler can return.
#[derive(Debug, Error)]
pub enum ProgError {
    /// The prog has no handler for this label, so it cannot provide flow control.
    #[error("no handler for label '{label}'")]
    UnknownLabel {
        /// The label that was dispatched.
        label: String,
    },

    /// Storage error while signalling, budding or reaping.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Frame payload did not match the expected shape.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Handler-specific failure the workflow chose not to turn into a nap or page.
    #[error("{0}")]
    Failed(String),
}

impl ProgError {
    /// Builds an `UnknownLabel` error.
    #[must_use]
    pub fn unknown_label(label: &str) -> Self {
        Self::UnknownLabel {
            label: label.to_string(),
        }
    }

    /// Builds a `Failed` error from any message.
    #[must_use]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Result type of a label handler.
pub type ProgResult = Result<Flow, ProgError>;

use thiserror::Error;
use uuid::Uuid;

use crate::prog::{ProgError, UnknownWorkflowType};
use crate::storage::StorageError;

/// Errors raised while running strands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The strand names a prog the worker does not know.
    #[error(transparent)]
    UnknownWorkflowType(#[from] UnknownWorkflowType),

    /// The prog had no handler for the strand's label.
    #[error("BUG: prog {prog} did not provide flow control at label {label}")]
    FlowControlNotProvided {
        /// Prog that was invoked.
        prog: String,
        /// Label that was dispatched.
        label: String,
    },

    /// Releasing (or writing under) a lease found it no longer ours.
    #[error("BUG: lease integrity violated for strand {strand_id}")]
    LeaseIntegrityViolated {
        /// Strand whose lease was lost.
        strand_id: Uuid,
    },

    /// The strand does not exist (already deleted or never created).
    #[error("Strand not found: {0}")]
    StrandNotFound(Uuid),

    /// The page does not exist.
    #[error("Page not found: {0}")]
    PageNotFound(Uuid),

    /// A label handler returned an error.
    #[error("prog {prog} failed at label {label}: {source}")]
    Prog {
        /// Prog that failed.
        prog: String,
        /// Label that failed.
        label: String,
        /// The handler's error.
        #[source]
        source: ProgError,
    },

    /// A label handler panicked.
    #[error("BUG: strand {strand_id} panicked: {message}")]
    Panicked {
        /// Strand whose handler panicked.
        strand_id: Uuid,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Storage error outside any lease-guarded write.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Programmer defects that must halt the worker rather than be retried.
    ///
    /// A store failure is never fatal, whether it surfaced inside a label
    /// handler or around it: the label's writes were not committed and
    /// the strand runs again once its lease is free.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Prog {
                source: ProgError::Storage(_),
                ..
            } => false,
            Self::UnknownWorkflowType(_)
            | Self::FlowControlNotProvided { .. }
            | Self::LeaseIntegrityViolated { .. }
            | Self::Prog { .. }
            | Self::Panicked { .. } => true,
            Self::StrandNotFound(_) | Self::PageNotFound(_) | Self::Storage(_) => false,
        }
    }

    /// Maps a guarded write failure: a lost lease is an integrity violation.
    pub(crate) fn from_guarded(err: StorageError) -> Self {
        match err {
            StorageError::LeaseMismatch { id } => Self::LeaseIntegrityViolated { strand_id: id },
            other => Self::Storage(other),
        }
    }
}

//! Error types for the entity store and mutation queue.

use crate::journal::JournalError;
use thiserror::Error;
use verdant_protocol::{MutationId, MutationKind, MutationStatus, PostId, ProtocolError};

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An unresolved record for the same logical operation already exists.
    #[error("duplicate in-flight {kind} for post {target_id} (existing mutation {existing})")]
    DuplicateInFlight {
        /// Kind of the rejected mutation.
        kind: MutationKind,
        /// Target of the rejected mutation.
        target_id: PostId,
        /// The record that is still unresolved.
        existing: MutationId,
    },

    /// The queue is at capacity and holds no parked records to prune.
    #[error("mutation queue full ({capacity} records)")]
    QueueOverflow {
        /// Configured capacity.
        capacity: usize,
    },

    /// The targeted post is not in the entity store.
    #[error("unknown post: {0}")]
    UnknownEntity(PostId),

    /// No record with this id is queued.
    #[error("unknown mutation: {0}")]
    UnknownMutation(MutationId),

    /// The requested status change is not allowed from the current status.
    #[error("mutation {id} cannot move from {from:?} to {to}")]
    InvalidTransition {
        /// Record id.
        id: MutationId,
        /// Current status.
        from: MutationStatus,
        /// Requested transition.
        to: &'static str,
    },

    /// Invalid mutation data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Journal persistence failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

impl CoreError {
    /// Returns true if the error rejects the caller's request rather than
    /// signalling a storage failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::DuplicateInFlight { .. }
                | CoreError::QueueOverflow { .. }
                | CoreError::UnknownEntity(_)
                | CoreError::Protocol(_)
        )
    }
}

//! Error types for the sync layer.

use thiserror::Error;
use verdant_core::CoreError;
use verdant_protocol::{MutationId, MutationKind, PostId, ProtocolError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// An unresolved write for the same logical operation exists.
    #[error("duplicate in-flight {kind} for post {target_id} (existing mutation {existing})")]
    DuplicateInFlight {
        /// Kind of the rejected write.
        kind: MutationKind,
        /// Target of the rejected write.
        target_id: PostId,
        /// The write that is still unresolved.
        existing: MutationId,
    },

    /// The network call failed in a way that may succeed on retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The server refused the write; retrying will not help.
    #[error("rejected by server{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    PermanentRejection {
        /// HTTP status, if the rejection came from an HTTP response.
        status: Option<u16>,
        /// Reason given by the server.
        message: String,
    },

    /// The push channel closed or could not be opened.
    #[error("push channel dropped: {0}")]
    ChannelDropped(String),

    /// The mutation queue is full.
    #[error("mutation queue full ({capacity} records)")]
    QueueOverflow {
        /// Configured capacity.
        capacity: usize,
    },

    /// A request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// No credential is available.
    #[error("credential unavailable: {0}")]
    Credential(String),

    /// The operation needs a signed-in session.
    #[error("not logged in")]
    NotLoggedIn,

    /// Malformed data at a boundary.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local store or queue failure.
    #[error("core error: {0}")]
    Core(#[source] CoreError),
}

impl SyncError {
    /// Creates a transient network error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::TransientNetwork(message.into())
    }

    /// Creates a permanent rejection.
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::PermanentRejection {
            status,
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::Timeout | SyncError::ChannelDropped(_)
        )
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DuplicateInFlight {
                kind,
                target_id,
                existing,
            } => SyncError::DuplicateInFlight {
                kind,
                target_id,
                existing,
            },
            CoreError::QueueOverflow { capacity } => SyncError::QueueOverflow { capacity },
            CoreError::Protocol(e) => SyncError::Protocol(e),
            other => SyncError::Core(other),
        }
    }
}

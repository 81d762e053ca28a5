//! Error types for journal persistence.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while persisting the mutation queue.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the journal file lock.
    #[error("journal locked: another process has exclusive access")]
    Locked,

    /// A record could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A record is malformed.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the bad record.
        offset: u64,
        /// Description of the problem.
        message: String,
    },

    /// The journal was written by an incompatible version.
    #[error("unsupported journal version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u16,
        /// Version this build writes.
        expected: u16,
    },
}

impl JournalError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }
}

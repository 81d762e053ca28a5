//! Error types for protocol validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating inbound data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message is not valid JSON or does not have the `{type, data}` shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message `type` is not one of the known push kinds.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required field is missing from the message `data`.
    #[error("missing field `{field}` in {kind} message")]
    MissingField {
        /// Message type being parsed.
        kind: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A field carries a value that cannot be accepted.
    #[error("invalid value for `{field}`: {message}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// The payload does not belong to the mutation kind it was paired with.
    #[error("payload does not match mutation kind {0}")]
    PayloadMismatch(&'static str),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

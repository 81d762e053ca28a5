//! # Verdant Protocol
//!
//! Data types shared by the Verdant client sync core.
//!
//! This crate provides:
//! - Identifier newtypes (`PostId`, `CommentId`, `UserId`, `MutationId`)
//! - Feed entities (`Post`, `Comment`)
//! - `MutationRecord` for queued local writes, with kind-specific payloads
//! - `PushEvent` for server-pushed events, validated from raw `{type, data}`
//!   messages at the channel boundary
//! - `WriteAck` for server-confirmed state and `PostSnapshot` for re-reads
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod entity;
mod error;
mod event;
mod ids;
mod mutation;

pub use ack::{PostSnapshot, ServerState, WriteAck};
pub use entity::{Comment, Post};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{EventFamily, InboundMessage, PushEvent, PushEventKind, PushPayload};
pub use ids::{CommentId, MutationId, PostId, Timestamp, UserId};
pub use mutation::{MutationKind, MutationPayload, MutationRecord, MutationStatus, Undo};

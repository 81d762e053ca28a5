//! Boundaries to the backend.
//!
//! The sync layer talks to the server only through these traits, so the
//! transport (HTTP, WebSocket, an in-process fake) is chosen by the caller.

use crate::error::SyncResult;
use async_trait::async_trait;
use verdant_protocol::{MutationRecord, Post, PostId, PostSnapshot, WriteAck};

/// Sends queued writes to the server.
///
/// # Contract
///
/// - One call per attempt of one mutation
/// - The mutation id is sent as the idempotency key, so a resend of a write
///   the server already applied returns the original outcome
/// - Errors are classified: retryable errors (`is_retryable()`) keep the
///   write queued, anything else rejects it
#[async_trait]
pub trait RemoteWritePort: Send + Sync {
    /// Sends one mutation and returns the server's authoritative state.
    async fn send(&self, record: &MutationRecord) -> SyncResult<WriteAck>;
}

/// Reads entities from the server.
#[async_trait]
pub trait EntityFetchPort: Send + Sync {
    /// Fetches the whole feed, newest first.
    async fn fetch_feed(&self) -> SyncResult<Vec<Post>>;

    /// Fetches the given posts. Posts that no longer exist are omitted.
    ///
    /// The snapshot carries the server time of the read, so events at or
    /// before it can be recognised as already counted.
    async fn fetch_posts(&self, ids: &[PostId]) -> SyncResult<PostSnapshot>;
}

/// Opens the authenticated push channel.
#[async_trait]
pub trait RemotePushPort: Send + Sync {
    /// Connects with a bearer credential.
    async fn connect(&self, bearer_token: &str) -> SyncResult<Box<dyn PushConnection>>;
}

/// An open push channel delivering raw text frames.
#[async_trait]
pub trait PushConnection: Send {
    /// Waits for the next frame.
    ///
    /// Returns `None` once the server closed the channel.
    async fn next_frame(&mut self) -> Option<SyncResult<String>>;
}

/// Supplies the bearer credential for the current session.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns a valid bearer token.
    async fn bearer_token(&self) -> SyncResult<String>;
}

/// A credential source returning a fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    /// Creates a source for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn bearer_token(&self) -> SyncResult<String> {
        Ok(self.0.clone())
    }
}

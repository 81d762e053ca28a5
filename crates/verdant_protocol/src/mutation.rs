//! Queued local writes.

use crate::entity::Post;
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::EventFamily;
use crate::ids::{CommentId, MutationId, PostId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Kind of user-initiated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Like a post.
    Like,
    /// Remove a like.
    Unlike,
    /// Add a comment to a post.
    Comment,
    /// Publish a new post.
    CreatePost,
    /// Delete one of the user's posts.
    DeletePost,
}

impl MutationKind {
    /// Returns the stable name used in logs and tooling.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Like => "like",
            MutationKind::Unlike => "unlike",
            MutationKind::Comment => "comment",
            MutationKind::CreatePost => "create-post",
            MutationKind::DeletePost => "delete-post",
        }
    }

    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            MutationKind::Like => 1,
            MutationKind::Unlike => 2,
            MutationKind::Comment => 3,
            MutationKind::CreatePost => 4,
            MutationKind::DeletePost => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MutationKind::Like),
            2 => Some(MutationKind::Unlike),
            3 => Some(MutationKind::Comment),
            4 => Some(MutationKind::CreatePost),
            5 => Some(MutationKind::DeletePost),
            _ => None,
        }
    }

    /// Returns the push-event family that touches the same fields.
    pub fn family(&self) -> Option<EventFamily> {
        match self {
            MutationKind::Like | MutationKind::Unlike => Some(EventFamily::Likes),
            MutationKind::Comment => Some(EventFamily::Comments),
            MutationKind::CreatePost | MutationKind::DeletePost => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Waiting to be sent.
    Pending,
    /// Sent to the server, awaiting the outcome.
    Processing,
    /// Last attempt failed; awaiting retry or, once parked, user action.
    Failed,
}

impl MutationStatus {
    /// Returns the stable name used in logs and tooling.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Processing => "processing",
            MutationStatus::Failed => "failed",
        }
    }
}

/// Kind-specific data of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MutationPayload {
    /// Like the target post.
    Like,
    /// Unlike the target post.
    Unlike,
    /// Comment on the target post.
    #[serde(rename_all = "camelCase")]
    Comment {
        /// Synthesized id of the optimistic placeholder.
        comment_id: CommentId,
        /// Author (the local user).
        author_id: UserId,
        /// Comment text.
        content: String,
    },
    /// Publish a post under the temporary target id.
    #[serde(rename_all = "camelCase")]
    CreatePost {
        /// Author (the local user).
        author_id: UserId,
        /// Post text.
        content: String,
        /// Reference to an already uploaded image.
        image_ref: Option<String>,
    },
    /// Delete the target post.
    DeletePost,
}

impl MutationPayload {
    /// Returns the mutation kind this payload belongs to.
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::Like => MutationKind::Like,
            MutationPayload::Unlike => MutationKind::Unlike,
            MutationPayload::Comment { .. } => MutationKind::Comment,
            MutationPayload::CreatePost { .. } => MutationKind::CreatePost,
            MutationPayload::DeletePost => MutationKind::DeletePost,
        }
    }

    /// Builds a comment payload with a fresh placeholder id.
    pub fn comment(author_id: UserId, content: impl Into<String>) -> Self {
        MutationPayload::Comment {
            comment_id: CommentId::local(),
            author_id,
            content: content.into(),
        }
    }

    /// Builds a create-post payload.
    pub fn create_post(
        author_id: UserId,
        content: impl Into<String>,
        image_ref: Option<String>,
    ) -> Self {
        MutationPayload::CreatePost {
            author_id,
            content: content.into(),
            image_ref,
        }
    }
}

/// Describes how to reverse an optimistic effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Undo {
    /// Subtract `delta` from the like count and restore the liked flag.
    #[serde(rename_all = "camelCase")]
    Likes {
        /// Delta that was applied optimistically.
        delta: i64,
        /// `liked_by_me` before the mutation.
        liked_before: bool,
    },
    /// Remove the optimistic comment.
    #[serde(rename_all = "camelCase")]
    RemoveComment {
        /// Placeholder id of the comment.
        comment_id: CommentId,
    },
    /// Remove the optimistically created post.
    RemovePost,
    /// Put back a post that was optimistically deleted.
    RestorePost {
        /// The post as it was before deletion.
        post: Box<Post>,
        /// Its position in the feed.
        position: usize,
    },
    /// The optimistic apply changed nothing.
    Noop,
}

/// A queued local write.
///
/// # Invariants
///
/// - `seq` is strictly increasing in enqueue order
/// - At most one unresolved record exists per logical operation
/// - A record leaves the queue only on confirmation, permanent rejection,
///   discard, or overflow pruning of parked records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Enqueue order.
    pub seq: u64,
    /// Unique token, also the idempotency key sent to the server.
    pub id: MutationId,
    /// Kind of write.
    pub kind: MutationKind,
    /// Post the write targets.
    pub target_id: PostId,
    /// Kind-specific data.
    pub payload: MutationPayload,
    /// Current status.
    pub status: MutationStatus,
    /// Enqueue time.
    pub created_at: Timestamp,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Reversal data for the optimistic effect, if still applied.
    pub undo: Option<Undo>,
    /// Retries are exhausted and the optimistic effect has been reverted.
    pub parked: bool,
}

impl MutationRecord {
    /// Creates a Pending record.
    ///
    /// # Errors
    ///
    /// Returns `PayloadMismatch` if the payload belongs to another kind.
    pub fn new(
        seq: u64,
        kind: MutationKind,
        target_id: PostId,
        payload: MutationPayload,
    ) -> ProtocolResult<Self> {
        if payload.kind() != kind {
            return Err(ProtocolError::PayloadMismatch(kind.as_str()));
        }
        Ok(Self {
            seq,
            id: MutationId::new(),
            kind,
            target_id,
            payload,
            status: MutationStatus::Pending,
            created_at: Timestamp::now(),
            retry_count: 0,
            last_error: None,
            undo: None,
            parked: false,
        })
    }

    /// Returns true if `other` describes the same logical operation.
    ///
    /// Two comments on one post are distinct operations; they collide only
    /// when they reuse the same placeholder id.
    pub fn same_operation(&self, other: &MutationRecord) -> bool {
        if self.kind != other.kind || self.target_id != other.target_id {
            return false;
        }
        match (&self.payload, &other.payload) {
            (
                MutationPayload::Comment { comment_id: a, .. },
                MutationPayload::Comment { comment_id: b, .. },
            ) => a == b,
            _ => true,
        }
    }

    /// Returns true if the record still takes part in syncing (not parked).
    pub fn is_active(&self) -> bool {
        !self.parked
    }

    /// Returns the placeholder comment id for comment mutations.
    pub fn comment_id(&self) -> Option<&CommentId> {
        match &self.payload {
            MutationPayload::Comment { comment_id, .. } => Some(comment_id),
            _ => None,
        }
    }
}

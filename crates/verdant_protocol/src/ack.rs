//! Server confirmations of local writes and read snapshots.

use crate::entity::{Comment, Post};
use crate::ids::{MutationId, Timestamp};
use serde::{Deserialize, Serialize};

/// Authoritative state returned by the server for a confirmed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ServerState {
    /// Like fields after a like/unlike.
    #[serde(rename_all = "camelCase")]
    Likes {
        /// Like count as stored by the server.
        like_count: u64,
        /// Whether the local user likes the post.
        liked_by_me: bool,
    },
    /// The stored comment, carrying its authoritative id.
    Comment {
        /// The comment.
        comment: Comment,
    },
    /// The stored post, carrying its authoritative id.
    Post {
        /// The post.
        post: Box<Post>,
    },
    /// The post no longer exists.
    Deleted,
}

/// Successful response of the remote write API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    /// Idempotency key of the confirmed write.
    pub mutation_id: MutationId,
    /// Server time at which the state was read.
    pub server_timestamp: Timestamp,
    /// Authoritative state.
    pub state: ServerState,
}

impl WriteAck {
    /// Creates an acknowledgement.
    pub fn new(mutation_id: MutationId, server_timestamp: Timestamp, state: ServerState) -> Self {
        Self {
            mutation_id,
            server_timestamp,
            state,
        }
    }
}

/// Posts read from the server together with the time they were read.
///
/// Every event with a server timestamp at or before `server_timestamp` is
/// already reflected in `posts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSnapshot {
    /// The posts that still exist.
    pub posts: Vec<Post>,
    /// Server time at which the posts were read.
    pub server_timestamp: Timestamp,
}

impl PostSnapshot {
    /// Creates a snapshot.
    pub fn new(posts: Vec<Post>, server_timestamp: Timestamp) -> Self {
        Self {
            posts,
            server_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_json_shape() {
        let ack = WriteAck::new(
            MutationId::new(),
            Timestamp::from_millis(5),
            ServerState::Likes {
                like_count: 3,
                liked_by_me: true,
            },
        );
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["state"]["state"], "likes");
        assert_eq!(json["state"]["likeCount"], 3);
        assert_eq!(json["serverTimestamp"], 5);

        let back: WriteAck = serde_json::from_value(json).unwrap();
        assert_eq!(back, ack);
    }

    #[test]
    fn snapshot_json_shape() {
        let json = r#"{"posts": [], "serverTimestamp": 42}"#;
        let snapshot: PostSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.posts.is_empty());
        assert_eq!(snapshot.server_timestamp, Timestamp::from_millis(42));
    }
}

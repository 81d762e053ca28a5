//! Server-pushed events and their wire format.
//!
//! The push channel delivers untyped `{type, data}` JSON messages. They are
//! validated here, at the channel boundary, into [`PushEvent`]s whose payload
//! is a tagged enum per kind. Nothing downstream ever sees raw JSON.

use crate::entity::Comment;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{CommentId, PostId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire name of notification messages.
pub const NOTIFICATION_TYPE: &str = "notification";
/// Wire name of like-delta messages.
pub const LIKE_DELTA_TYPE: &str = "like-delta";
/// Wire name of comment-delta messages.
pub const COMMENT_DELTA_TYPE: &str = "comment-delta";

/// Kind of push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushEventKind {
    /// A user-facing notification; does not change entities.
    Notification,
    /// Another user liked or unliked a post.
    LikeChanged,
    /// Another user commented on a post.
    CommentAdded,
}

impl PushEventKind {
    /// Returns the wire name of this kind.
    pub fn wire_name(&self) -> &'static str {
        match self {
            PushEventKind::Notification => NOTIFICATION_TYPE,
            PushEventKind::LikeChanged => LIKE_DELTA_TYPE,
            PushEventKind::CommentAdded => COMMENT_DELTA_TYPE,
        }
    }
}

/// Group of fields shared by push events and local mutations.
///
/// A push event is deferred while a local mutation of the same family is
/// unresolved for the same post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    /// `like_count` / `liked_by_me`.
    Likes,
    /// The comment sequence.
    Comments,
}

/// Kind-specific payload of a push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushPayload {
    /// Notification text.
    Notification {
        /// Human-readable message.
        message: String,
    },
    /// Signed change to the like count.
    LikeChanged {
        /// +1 for a like, -1 for an unlike.
        delta: i64,
    },
    /// A new comment.
    CommentAdded {
        /// The comment as stored by the server.
        comment: Comment,
    },
}

/// An event pushed by the server. Consumed once; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Event id; together with `server_timestamp` it de-duplicates deliveries.
    pub id: String,
    /// Kind of event.
    pub kind: PushEventKind,
    /// User whose action caused the event.
    pub origin_user_id: UserId,
    /// Post the event refers to (always present for like/comment events).
    pub target_id: Option<PostId>,
    /// Kind-specific payload.
    pub payload: PushPayload,
    /// Server time of the event.
    pub server_timestamp: Timestamp,
}

impl PushEvent {
    /// Creates a like-delta event.
    pub fn like_changed(
        id: impl Into<String>,
        origin: UserId,
        post_id: PostId,
        delta: i64,
        server_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind: PushEventKind::LikeChanged,
            origin_user_id: origin,
            target_id: Some(post_id),
            payload: PushPayload::LikeChanged { delta },
            server_timestamp,
        }
    }

    /// Creates a comment-added event.
    pub fn comment_added(
        id: impl Into<String>,
        origin: UserId,
        comment: Comment,
        server_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind: PushEventKind::CommentAdded,
            origin_user_id: origin,
            target_id: Some(comment.post_id.clone()),
            payload: PushPayload::CommentAdded { comment },
            server_timestamp,
        }
    }

    /// Creates a notification event.
    pub fn notification(
        id: impl Into<String>,
        origin: UserId,
        post_id: Option<PostId>,
        message: impl Into<String>,
        server_timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind: PushEventKind::Notification,
            origin_user_id: origin,
            target_id: post_id,
            payload: PushPayload::Notification {
                message: message.into(),
            },
            server_timestamp,
        }
    }

    /// Returns the family of entity fields this event changes.
    pub fn family(&self) -> Option<EventFamily> {
        match self.kind {
            PushEventKind::LikeChanged => Some(EventFamily::Likes),
            PushEventKind::CommentAdded => Some(EventFamily::Comments),
            PushEventKind::Notification => None,
        }
    }

    /// Returns the key used to recognise repeated deliveries.
    pub fn dedupe_key(&self) -> (String, Timestamp) {
        (self.id.clone(), self.server_timestamp)
    }

    /// Encodes the event into its wire message.
    pub fn to_inbound(&self) -> InboundMessage {
        let mut data = serde_json::Map::new();
        data.insert("id".into(), Value::String(self.id.clone()));
        data.insert(
            "timestamp".into(),
            Value::from(self.server_timestamp.as_millis()),
        );
        if let Some(post_id) = &self.target_id {
            data.insert("postId".into(), Value::String(post_id.to_string()));
        }
        match &self.payload {
            PushPayload::Notification { message } => {
                data.insert(
                    "fromUserId".into(),
                    Value::String(self.origin_user_id.to_string()),
                );
                data.insert("message".into(), Value::String(message.clone()));
            }
            PushPayload::LikeChanged { delta } => {
                data.insert(
                    "userId".into(),
                    Value::String(self.origin_user_id.to_string()),
                );
                data.insert("delta".into(), Value::from(*delta));
            }
            PushPayload::CommentAdded { comment } => {
                data.insert(
                    "userId".into(),
                    Value::String(self.origin_user_id.to_string()),
                );
                data.insert(
                    "comment".into(),
                    serde_json::to_value(comment).unwrap_or(Value::Null),
                );
            }
        }
        InboundMessage {
            kind: self.kind.wire_name().to_string(),
            data: Value::Object(data),
        }
    }
}

/// A raw message received on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message type (`notification`, `like-delta`, `comment-delta`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Untyped message body.
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    id: Option<String>,
    from_user_id: UserId,
    post_id: Option<PostId>,
    message: String,
    timestamp: Timestamp,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikeDeltaData {
    id: Option<String>,
    user_id: UserId,
    post_id: PostId,
    delta: Option<i64>,
    liked: Option<bool>,
    timestamp: Timestamp,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireComment {
    id: CommentId,
    author_id: Option<UserId>,
    content: String,
    created_at: Option<Timestamp>,
    client_ref: Option<CommentId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentDeltaData {
    id: Option<String>,
    user_id: UserId,
    post_id: PostId,
    comment: WireComment,
    timestamp: Timestamp,
}

impl InboundMessage {
    /// Parses a JSON text frame.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Validates the message into a typed event.
    ///
    /// Events without an explicit id get one synthesized from their
    /// content, so that repeated deliveries still de-duplicate.
    pub fn into_event(self) -> ProtocolResult<PushEvent> {
        match self.kind.as_str() {
            NOTIFICATION_TYPE => {
                let data: NotificationData = serde_json::from_value(self.data)?;
                let id = data.id.unwrap_or_else(|| {
                    format!("{NOTIFICATION_TYPE}:{}:{}", data.from_user_id, data.timestamp.as_millis())
                });
                Ok(PushEvent::notification(
                    id,
                    data.from_user_id,
                    data.post_id,
                    data.message,
                    data.timestamp,
                ))
            }
            LIKE_DELTA_TYPE => {
                let data: LikeDeltaData = serde_json::from_value(self.data)?;
                let delta = match (data.delta, data.liked) {
                    (Some(delta), _) => delta,
                    (None, Some(true)) => 1,
                    (None, Some(false)) => -1,
                    (None, None) => {
                        return Err(ProtocolError::MissingField {
                            kind: LIKE_DELTA_TYPE,
                            field: "delta",
                        })
                    }
                };
                if delta == 0 {
                    return Err(ProtocolError::InvalidField {
                        field: "delta",
                        message: "must be non-zero".into(),
                    });
                }
                let id = data.id.unwrap_or_else(|| {
                    format!(
                        "{LIKE_DELTA_TYPE}:{}:{}:{}",
                        data.user_id,
                        data.post_id,
                        data.timestamp.as_millis()
                    )
                });
                Ok(PushEvent::like_changed(
                    id,
                    data.user_id,
                    data.post_id,
                    delta,
                    data.timestamp,
                ))
            }
            COMMENT_DELTA_TYPE => {
                let data: CommentDeltaData = serde_json::from_value(self.data)?;
                let wire = data.comment;
                if wire.content.is_empty() {
                    return Err(ProtocolError::InvalidField {
                        field: "comment.content",
                        message: "must not be empty".into(),
                    });
                }
                let id = data
                    .id
                    .unwrap_or_else(|| format!("{COMMENT_DELTA_TYPE}:{}", wire.id));
                let comment = Comment {
                    id: wire.id,
                    post_id: data.post_id,
                    author_id: wire.author_id.unwrap_or_else(|| data.user_id.clone()),
                    content: wire.content,
                    created_at: wire.created_at.unwrap_or(data.timestamp),
                    client_ref: wire.client_ref,
                };
                Ok(PushEvent::comment_added(
                    id,
                    data.user_id,
                    comment,
                    data.timestamp,
                ))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

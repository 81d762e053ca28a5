//! Feed entities: posts and their comments.

use crate::ids::{CommentId, PostId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// A comment on a post.
///
/// Comments are append-only within a post. An optimistic comment carries a
/// synthesized id until the server confirms it; the confirmed record keeps
/// that id in `client_ref` so late push events can be matched against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Comment id (synthesized while unconfirmed).
    pub id: CommentId,
    /// Post the comment belongs to.
    pub post_id: PostId,
    /// Author of the comment.
    pub author_id: UserId,
    /// Comment text.
    pub content: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Synthesized client id the comment was created under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<CommentId>,
}

impl Comment {
    /// Creates a comment.
    pub fn new(
        id: CommentId,
        post_id: PostId,
        author_id: UserId,
        content: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            post_id,
            author_id,
            content: content.into(),
            created_at,
            client_ref: None,
        }
    }

    /// Sets the synthesized client id.
    pub fn with_client_ref(mut self, client_ref: CommentId) -> Self {
        self.client_ref = Some(client_ref);
        self
    }

    /// Returns true if `id` names this comment, either by its own id or by
    /// the client id it was created under.
    pub fn matches(&self, id: &CommentId) -> bool {
        &self.id == id || self.client_ref.as_ref() == Some(id)
    }
}

/// A post in the community feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Post id.
    pub id: PostId,
    /// Author of the post.
    pub author_id: UserId,
    /// Post text.
    pub content: String,
    /// Reference to the attached image, if any.
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Number of likes.
    #[serde(default)]
    pub like_count: u64,
    /// Whether the local user likes this post.
    #[serde(default)]
    pub liked_by_me: bool,
    /// Comments in arrival order.
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// Decrements received while the count was already zero. Later
    /// increments pay this off first, so deltas commute at the floor.
    #[serde(skip)]
    like_deficit: u64,
}

impl Post {
    /// Creates a post with no likes and no comments.
    pub fn new(
        id: PostId,
        author_id: UserId,
        content: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            author_id,
            content: content.into(),
            image_ref: None,
            created_at,
            like_count: 0,
            liked_by_me: false,
            comments: Vec::new(),
            like_deficit: 0,
        }
    }

    /// Sets the image reference.
    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    /// Sets the like count.
    pub fn with_likes(mut self, like_count: u64, liked_by_me: bool) -> Self {
        self.set_likes(like_count);
        self.liked_by_me = liked_by_me;
        self
    }

    /// Replaces the like count with an authoritative value.
    pub fn set_likes(&mut self, like_count: u64) {
        self.like_count = like_count;
        self.like_deficit = 0;
    }

    /// Returns the position of the comment matching `id`.
    pub fn comment_position(&self, id: &CommentId) -> Option<usize> {
        self.comments.iter().position(|c| c.matches(id))
    }

    /// Returns true if a comment matching `id` exists.
    pub fn has_comment(&self, id: &CommentId) -> bool {
        self.comment_position(id).is_some()
    }

    /// Adjusts the like count by a signed delta.
    ///
    /// The shown count never drops below zero, but the part of a decrement
    /// cut off at zero is remembered and cancelled by later increments. Any
    /// order of the same deltas ends at `max(0, start + sum)`.
    pub fn adjust_likes(&mut self, delta: i64) {
        let balance = i128::from(self.like_count) - i128::from(self.like_deficit) + i128::from(delta);
        if balance >= 0 {
            self.like_count = u64::try_from(balance).unwrap_or(u64::MAX);
            self.like_deficit = 0;
        } else {
            self.like_count = 0;
            self.like_deficit = u64::try_from(-balance).unwrap_or(u64::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> Post {
        Post::new(
            PostId::new("p1"),
            UserId::new("u1"),
            "leaf spots on tomato",
            Timestamp::from_millis(1),
        )
    }

    #[test]
    fn like_adjustment_floors_at_zero() {
        let mut p = post().with_likes(1, false);
        p.adjust_likes(-3);
        assert_eq!(p.like_count, 0);
        p.adjust_likes(2);
        assert_eq!(p.like_count, 0);
        p.adjust_likes(1);
        assert_eq!(p.like_count, 1);
    }

    #[test]
    fn unlike_before_like_commutes_at_zero() {
        let mut forward = post();
        forward.adjust_likes(1);
        forward.adjust_likes(-1);

        let mut reversed = post();
        reversed.adjust_likes(-1);
        reversed.adjust_likes(1);

        assert_eq!(forward.like_count, 0);
        assert_eq!(reversed.like_count, 0);
    }

    #[test]
    fn set_likes_clears_pending_decrements() {
        let mut p = post();
        p.adjust_likes(-2);
        p.set_likes(4);
        p.adjust_likes(1);
        assert_eq!(p.like_count, 5);
    }

    #[test]
    fn comment_matches_client_ref() {
        let local = CommentId::local();
        let confirmed = Comment::new(
            CommentId::new("c9"),
            PostId::new("p1"),
            UserId::new("u1"),
            "try copper fungicide",
            Timestamp::from_millis(2),
        )
        .with_client_ref(local.clone());

        assert!(confirmed.matches(&local));
        assert!(confirmed.matches(&CommentId::new("c9")));
        assert!(!confirmed.matches(&CommentId::new("c10")));
    }

    #[test]
    fn post_deserializes_from_server_json() {
        let json = r#"{
            "id": "p1",
            "authorId": "u7",
            "content": "blight?",
            "createdAt": 1700000000000,
            "likeCount": 3
        }"#;
        let p: Post = serde_json::from_str(json).unwrap();
        assert_eq!(p.like_count, 3);
        assert!(!p.liked_by_me);
        assert!(p.comments.is_empty());
        assert!(p.image_ref.is_none());
    }
}

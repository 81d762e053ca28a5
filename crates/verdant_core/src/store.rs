//! Entity store: the posts, comments and like state shown to the UI.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};
use verdant_protocol::{
    Comment, MutationPayload, MutationRecord, Post, PostId, PushEvent, PushPayload, ServerState,
    Timestamp, Undo,
};

/// Default number of push event keys remembered for de-duplication.
const DEFAULT_EVENT_MEMORY: usize = 4096;

/// Result of an optimistic apply.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticApply {
    /// How to reverse the effect.
    pub undo: Undo,
    /// The affected post after the apply (`None` if it was deleted).
    pub post: Option<Post>,
}

/// Outcome of applying a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The delta changed the store.
    Applied,
    /// The event was delivered before; nothing changed.
    Duplicate,
    /// The event carries no entity change, targets an unloaded post, or
    /// duplicates a comment already present.
    Ignored,
}

#[derive(Default)]
struct StoreState {
    posts: HashMap<PostId, Post>,
    feed: Vec<PostId>,
    seen: HashSet<(String, Timestamp)>,
    seen_order: VecDeque<(String, Timestamp)>,
}

impl StoreState {
    fn post_mut(&mut self, id: &PostId) -> CoreResult<&mut Post> {
        self.posts
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownEntity(id.clone()))
    }

    fn insert_at(&mut self, position: usize, post: Post) {
        let id = post.id.clone();
        if self.posts.insert(id.clone(), post).is_none() {
            let position = position.min(self.feed.len());
            self.feed.insert(position, id);
        }
    }

    fn remove(&mut self, id: &PostId) -> Option<(Post, usize)> {
        let post = self.posts.remove(id)?;
        let position = self.feed.iter().position(|p| p == id).unwrap_or(0);
        self.feed.retain(|p| p != id);
        Some((post, position))
    }

    fn remember(&mut self, key: (String, Timestamp), capacity: usize) {
        if self.seen.insert(key.clone()) {
            self.seen_order.push_back(key);
            while self.seen_order.len() > capacity {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

/// The single shared mutable store of feed entities.
///
/// All writers (optimistic apply, confirmed apply, remote-event apply,
/// rollback) go through this narrow operation set. Each operation takes the
/// internal write lock for its whole read-modify-write sequence, so writes to
/// the same post never interleave.
///
/// The store is handed out as `Arc<EntityStore>`; there is no global
/// instance.
pub struct EntityStore {
    state: RwLock<StoreState>,
    event_memory: usize,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_event_memory(DEFAULT_EVENT_MEMORY)
    }

    /// Creates an empty store remembering up to `capacity` push event keys.
    pub fn with_event_memory(capacity: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            event_memory: capacity.max(1),
        }
    }

    /// Replaces the whole snapshot with a full fetch, in feed order.
    pub fn load(&self, posts: Vec<Post>) {
        let mut state = self.state.write();
        state.posts.clear();
        state.feed.clear();
        for post in posts {
            let end = state.feed.len();
            state.insert_at(end, post);
        }
        debug!(posts = state.feed.len(), "entity store loaded");
    }

    /// Merges re-fetched posts: known posts are replaced in place, unknown
    /// posts are added at the top of the feed.
    ///
    /// Returns the number of posts merged.
    pub fn refresh(&self, posts: Vec<Post>) -> usize {
        let mut state = self.state.write();
        let mut added = 0;
        let count = posts.len();
        for post in posts {
            if let Some(existing) = state.posts.get_mut(&post.id) {
                *existing = post;
            } else {
                state.insert_at(added, post);
                added += 1;
            }
        }
        count
    }

    /// Removes a post that the server reports as gone.
    pub fn evict(&self, id: &PostId) -> bool {
        self.state.write().remove(id).is_some()
    }

    /// Drops all state (logout).
    pub fn reset(&self) {
        *self.state.write() = StoreState::default();
        debug!("entity store reset");
    }

    /// Returns a copy of a post.
    pub fn get(&self, id: &PostId) -> Option<Post> {
        self.state.read().posts.get(id).cloned()
    }

    /// Returns true if the post is loaded.
    pub fn contains(&self, id: &PostId) -> bool {
        self.state.read().posts.contains_key(id)
    }

    /// Returns the posts in feed order.
    pub fn feed(&self) -> Vec<Post> {
        let state = self.state.read();
        state
            .feed
            .iter()
            .filter_map(|id| state.posts.get(id).cloned())
            .collect()
    }

    /// Returns the ids of all loaded posts in feed order.
    pub fn post_ids(&self) -> Vec<PostId> {
        self.state.read().feed.clone()
    }

    /// Returns the number of loaded posts.
    pub fn len(&self) -> usize {
        self.state.read().posts.len()
    }

    /// Returns true if no post is loaded.
    pub fn is_empty(&self) -> bool {
        self.state.read().posts.is_empty()
    }

    /// Applies a mutation's effect before the server confirms it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if a like, unlike, comment or delete targets a
    /// post that is not loaded.
    pub fn apply_optimistic(&self, record: &MutationRecord) -> CoreResult<OptimisticApply> {
        let mut state = self.state.write();
        let target = &record.target_id;

        let undo = match &record.payload {
            MutationPayload::Like => {
                let post = state.post_mut(target)?;
                if post.liked_by_me {
                    Undo::Noop
                } else {
                    post.liked_by_me = true;
                    post.adjust_likes(1);
                    Undo::Likes {
                        delta: 1,
                        liked_before: false,
                    }
                }
            }
            MutationPayload::Unlike => {
                let post = state.post_mut(target)?;
                if post.liked_by_me {
                    post.liked_by_me = false;
                    post.adjust_likes(-1);
                    Undo::Likes {
                        delta: -1,
                        liked_before: true,
                    }
                } else {
                    Undo::Noop
                }
            }
            MutationPayload::Comment {
                comment_id,
                author_id,
                content,
            } => {
                let post = state.post_mut(target)?;
                if post.has_comment(comment_id) {
                    Undo::Noop
                } else {
                    post.comments.push(Comment::new(
                        comment_id.clone(),
                        target.clone(),
                        author_id.clone(),
                        content.clone(),
                        record.created_at,
                    ));
                    Undo::RemoveComment {
                        comment_id: comment_id.clone(),
                    }
                }
            }
            MutationPayload::CreatePost {
                author_id,
                content,
                image_ref,
            } => {
                if state.posts.contains_key(target) {
                    Undo::Noop
                } else {
                    let mut post =
                        Post::new(target.clone(), author_id.clone(), content.clone(), record.created_at);
                    post.image_ref = image_ref.clone();
                    state.insert_at(0, post);
                    Undo::RemovePost
                }
            }
            MutationPayload::DeletePost => {
                let (post, position) = state
                    .remove(target)
                    .ok_or_else(|| CoreError::UnknownEntity(target.clone()))?;
                Undo::RestorePost {
                    post: Box::new(post),
                    position,
                }
            }
        };

        trace!(mutation = %record.id, kind = %record.kind, post = %target, ?undo, "optimistic apply");
        Ok(OptimisticApply {
            undo,
            post: state.posts.get(target).cloned(),
        })
    }

    /// Reverses an optimistic effect.
    ///
    /// Like effects are reversed by the inverse delta, so likes from other
    /// users applied in the meantime are kept.
    pub fn rollback(&self, target: &PostId, undo: &Undo) {
        let mut state = self.state.write();
        match undo {
            Undo::Likes {
                delta,
                liked_before,
            } => {
                if let Some(post) = state.posts.get_mut(target) {
                    post.adjust_likes(-delta);
                    post.liked_by_me = *liked_before;
                }
            }
            Undo::RemoveComment { comment_id } => {
                if let Some(post) = state.posts.get_mut(target) {
                    post.comments.retain(|c| &c.id != comment_id);
                }
            }
            Undo::RemovePost => {
                state.remove(target);
            }
            Undo::RestorePost { post, position } => {
                state.insert_at(*position, post.as_ref().clone());
            }
            Undo::Noop => {}
        }
        debug!(post = %target, ?undo, "optimistic effect rolled back");
    }

    /// Applies the server's authoritative state for a confirmed write.
    ///
    /// Confirmed values replace the optimistic ones for the same fields. A
    /// confirmed post created under a temporary id is re-keyed to its server
    /// id, keeping its feed position.
    pub fn apply_confirmed(&self, target: &PostId, server_state: &ServerState) {
        let mut state = self.state.write();
        match server_state {
            ServerState::Likes {
                like_count,
                liked_by_me,
            } => {
                if let Some(post) = state.posts.get_mut(target) {
                    post.set_likes(*like_count);
                    post.liked_by_me = *liked_by_me;
                }
            }
            ServerState::Comment { comment } => {
                if let Some(post) = state.posts.get_mut(target) {
                    let placeholder = comment
                        .client_ref
                        .as_ref()
                        .and_then(|client_ref| post.comment_position(client_ref));
                    match placeholder.or_else(|| post.comment_position(&comment.id)) {
                        Some(position) => post.comments[position] = comment.clone(),
                        None => post.comments.push(comment.clone()),
                    }
                }
            }
            ServerState::Post { post } => {
                let server_post = post.as_ref().clone();
                let position = state.remove(target).map(|(_, position)| position);
                if state.posts.contains_key(&server_post.id) {
                    // A push event or refresh delivered it first.
                    if let Some(existing) = state.posts.get_mut(&server_post.id) {
                        *existing = server_post;
                    }
                } else {
                    state.insert_at(position.unwrap_or(0), server_post);
                }
            }
            ServerState::Deleted => {
                state.remove(target);
            }
        }
        debug!(post = %target, "confirmed state applied");
    }

    /// Applies a push event's delta.
    ///
    /// Like deltas are added, never set, so independent events commute.
    /// Each event (id + server timestamp) takes effect at most once.
    pub fn apply_remote_event(&self, event: &PushEvent) -> RemoteApply {
        let mut state = self.state.write();
        let key = event.dedupe_key();
        if state.seen.contains(&key) {
            trace!(event = %event.id, "duplicate push event");
            return RemoteApply::Duplicate;
        }
        state.remember(key, self.event_memory);

        let Some(target) = &event.target_id else {
            return RemoteApply::Ignored;
        };
        let Some(post) = state.posts.get_mut(target) else {
            return RemoteApply::Ignored;
        };

        match &event.payload {
            PushPayload::Notification { .. } => RemoteApply::Ignored,
            PushPayload::LikeChanged { delta } => {
                post.adjust_likes(*delta);
                RemoteApply::Applied
            }
            PushPayload::CommentAdded { comment } => {
                let known = post.has_comment(&comment.id)
                    || comment
                        .client_ref
                        .as_ref()
                        .is_some_and(|client_ref| post.has_comment(client_ref));
                if known {
                    RemoteApply::Ignored
                } else {
                    post.comments.push(comment.clone());
                    RemoteApply::Applied
                }
            }
        }
    }
}

impl EntityStore {
    /// Records a push event as delivered without applying it.
    ///
    /// Used for events already reflected in server state the store received
    /// by other means, so a later redelivery is recognised as a duplicate.
    /// Returns false if the event had been seen before.
    pub fn acknowledge_event(&self, event: &PushEvent) -> bool {
        let mut state = self.state.write();
        let key = event.dedupe_key();
        if state.seen.contains(&key) {
            return false;
        }
        state.remember(key, self.event_memory);
        true
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

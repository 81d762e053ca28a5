//! In-process fake of the Verdant backend.
//!
//! The fake keeps authoritative server state for one viewing user:
//! - Posts in feed order (newest first)
//! - The set of users liking each post
//! - The acknowledgement of every applied write, keyed by mutation id, so
//!   a resent write returns its original outcome
//!
//! Writes made by the viewer are echoed on the push channel like a real
//! server would, which lets tests check that own events are not counted
//! twice.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use verdant_protocol::{
    Comment, CommentId, MutationId, MutationPayload, MutationRecord, Post, PostId, PushEvent,
    PostSnapshot, ServerState, Timestamp, UserId, WriteAck,
};
use verdant_sync::{
    EntityFetchPort, PushConnection, RemotePushPort, RemoteWritePort, SyncError, SyncResult,
};

#[derive(Default)]
struct ServerData {
    posts: Vec<Post>,
    likers: HashMap<PostId, HashSet<UserId>>,
    acks: HashMap<MutationId, WriteAck>,
    fail_writes: u32,
    reject_next: Option<String>,
    fail_connects: u32,
    connections: Vec<mpsc::UnboundedSender<String>>,
}

impl ServerData {
    fn post_mut(&mut self, id: &PostId) -> SyncResult<&mut Post> {
        self.posts
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| SyncError::rejected(Some(404), format!("post {id} not found")))
    }

    fn view(&self, post: &Post, viewer: &UserId) -> Post {
        let mut post = post.clone();
        post.liked_by_me = self
            .likers
            .get(&post.id)
            .is_some_and(|users| users.contains(viewer));
        post
    }

    fn broadcast(&mut self, event: &PushEvent) {
        let frame = event.to_inbound().to_json();
        self.connections.retain(|tx| tx.send(frame.clone()).is_ok());
    }
}

/// A fake server implementing every port.
pub struct FakeBackend {
    viewer: UserId,
    data: Mutex<ServerData>,
    writes_open: watch::Sender<bool>,
    clock: AtomicU64,
    next_id: AtomicU64,
    sends: AtomicUsize,
    connects: AtomicUsize,
}

impl FakeBackend {
    /// Creates a server seen by `viewer`.
    pub fn new(viewer: impl Into<UserId>) -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            viewer: viewer.into(),
            data: Mutex::new(ServerData::default()),
            writes_open,
            clock: AtomicU64::new(1_000),
            next_id: AtomicU64::new(1),
            sends: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    /// Creates a server holding `posts`, shared behind an `Arc`.
    pub fn with_posts(viewer: impl Into<UserId>, posts: Vec<Post>) -> Arc<Self> {
        let backend = Self::new(viewer);
        backend.seed(posts);
        Arc::new(backend)
    }

    /// Adds posts to the feed. `liked_by_me` marks the viewer as a liker.
    pub fn seed(&self, posts: Vec<Post>) {
        let mut data = self.data.lock();
        for mut post in posts {
            if post.liked_by_me {
                data.likers
                    .entry(post.id.clone())
                    .or_default()
                    .insert(self.viewer.clone());
            }
            post.liked_by_me = false;
            data.posts.push(post);
        }
    }

    fn tick(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.fetch_add(10, Ordering::SeqCst))
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // ---- scripting ----

    /// Fails the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.data.lock().fail_writes = n;
    }

    /// Rejects the next write permanently.
    pub fn reject_next_write(&self, reason: impl Into<String>) {
        self.data.lock().reject_next = Some(reason.into());
    }

    /// Fails the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.data.lock().fail_connects = n;
    }

    /// Holds every write until [`resume_writes`](Self::resume_writes).
    pub fn pause_writes(&self) {
        self.writes_open.send_replace(false);
    }

    /// Releases held writes.
    pub fn resume_writes(&self) {
        self.writes_open.send_replace(true);
    }

    // ---- push channel ----

    /// Sends an event to every open connection without changing server
    /// state.
    pub fn push_event(&self, event: &PushEvent) {
        self.data.lock().broadcast(event);
    }

    /// Sends a raw frame to every open connection.
    pub fn push_raw(&self, frame: impl Into<String>) {
        let frame = frame.into();
        self.data
            .lock()
            .connections
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }

    /// Closes every open connection, as if the network dropped.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.data.lock().connections);
        debug!(connections = dropped.len(), "fake backend dropped connections");
    }

    /// Returns the number of open connections.
    pub fn open_connections(&self) -> usize {
        let mut data = self.data.lock();
        data.connections.retain(|tx| !tx.is_closed());
        data.connections.len()
    }

    /// Another user likes a post. Returns the event broadcast for it.
    pub fn add_remote_like(&self, post_id: &PostId, user: impl Into<UserId>) -> PushEvent {
        let event = self.add_remote_like_held(post_id, user);
        self.push_event(&event);
        event
    }

    /// Another user likes a post, but the event is not broadcast. Deliver
    /// it later with [`push_event`](Self::push_event) to model a slow
    /// push channel.
    pub fn add_remote_like_held(&self, post_id: &PostId, user: impl Into<UserId>) -> PushEvent {
        let user = user.into();
        let mut data = self.data.lock();
        let ts = self.tick();
        let event = PushEvent::like_changed(self.next_id("ev"), user.clone(), post_id.clone(), 1, ts);
        if data.likers.entry(post_id.clone()).or_default().insert(user) {
            if let Ok(post) = data.post_mut(post_id) {
                post.adjust_likes(1);
            }
        }
        event
    }

    /// Another user comments on a post. Returns the event broadcast for it.
    pub fn add_remote_comment(
        &self,
        post_id: &PostId,
        user: impl Into<UserId>,
        content: &str,
    ) -> PushEvent {
        let user = user.into();
        let ts = self.tick();
        let comment = Comment::new(
            CommentId::new(self.next_id("c")),
            post_id.clone(),
            user.clone(),
            content,
            ts,
        );
        let event = PushEvent::comment_added(self.next_id("ev"), user, comment.clone(), ts);
        let mut data = self.data.lock();
        if let Ok(post) = data.post_mut(post_id) {
            post.comments.push(comment);
        }
        data.broadcast(&event);
        event
    }

    // ---- inspection ----

    /// Returns a post as the viewer would fetch it.
    pub fn post(&self, id: &PostId) -> Option<Post> {
        let data = self.data.lock();
        data.posts
            .iter()
            .find(|p| &p.id == id)
            .map(|p| data.view(p, &self.viewer))
    }

    /// Returns the feed as the viewer would fetch it.
    pub fn posts(&self) -> Vec<Post> {
        let data = self.data.lock();
        data.posts.iter().map(|p| data.view(p, &self.viewer)).collect()
    }

    /// Returns the number of write requests received.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Returns the number of distinct writes applied.
    pub fn applied_writes(&self) -> usize {
        self.data.lock().acks.len()
    }

    /// Returns the number of connection attempts.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn apply(&self, data: &mut ServerData, record: &MutationRecord) -> SyncResult<(ServerState, Option<PushEvent>)> {
        let ts = self.tick();
        let post_id = record.target_id.clone();
        match &record.payload {
            MutationPayload::Like | MutationPayload::Unlike => {
                let like = matches!(record.payload, MutationPayload::Like);
                data.post_mut(&post_id)?;
                let users = data.likers.entry(post_id.clone()).or_default();
                let changed = if like {
                    users.insert(self.viewer.clone())
                } else {
                    users.remove(&self.viewer)
                };
                let delta = if like { 1 } else { -1 };
                let post = data.post_mut(&post_id)?;
                if changed {
                    post.adjust_likes(delta);
                }
                let state = ServerState::Likes {
                    like_count: post.like_count,
                    liked_by_me: like,
                };
                let echo = changed.then(|| {
                    PushEvent::like_changed(self.next_id("ev"), self.viewer.clone(), post_id, delta, ts)
                });
                Ok((state, echo))
            }
            MutationPayload::Comment {
                comment_id,
                author_id,
                content,
            } => {
                let comment = Comment::new(
                    CommentId::new(self.next_id("c")),
                    post_id.clone(),
                    author_id.clone(),
                    content.clone(),
                    ts,
                )
                .with_client_ref(comment_id.clone());
                data.post_mut(&post_id)?.comments.push(comment.clone());
                let echo = PushEvent::comment_added(self.next_id("ev"), self.viewer.clone(), comment.clone(), ts);
                Ok((ServerState::Comment { comment }, Some(echo)))
            }
            MutationPayload::CreatePost {
                author_id,
                content,
                image_ref,
            } => {
                let mut post = Post::new(PostId::new(self.next_id("p")), author_id.clone(), content.clone(), ts);
                post.image_ref = image_ref.clone();
                data.posts.insert(0, post.clone());
                Ok((ServerState::Post { post: Box::new(post) }, None))
            }
            MutationPayload::DeletePost => {
                data.posts.retain(|p| p.id != post_id);
                data.likers.remove(&post_id);
                Ok((ServerState::Deleted, None))
            }
        }
    }
}

#[async_trait]
impl RemoteWritePort for FakeBackend {
    async fn send(&self, record: &MutationRecord) -> SyncResult<WriteAck> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let mut open = self.writes_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| SyncError::transport_retryable("backend gone"))?;

        let mut data = self.data.lock();
        if data.fail_writes > 0 {
            data.fail_writes -= 1;
            return Err(SyncError::transport_retryable("scripted failure"));
        }
        if let Some(reason) = data.reject_next.take() {
            return Err(SyncError::rejected(Some(422), reason));
        }
        if let Some(ack) = data.acks.get(&record.id) {
            return Ok(ack.clone());
        }

        let (state, echo) = self.apply(&mut data, record)?;
        let ack = WriteAck::new(record.id, self.tick(), state);
        data.acks.insert(record.id, ack.clone());
        if let Some(event) = echo {
            data.broadcast(&event);
        }
        Ok(ack)
    }
}

#[async_trait]
impl EntityFetchPort for FakeBackend {
    async fn fetch_feed(&self) -> SyncResult<Vec<Post>> {
        Ok(self.posts())
    }

    async fn fetch_posts(&self, ids: &[PostId]) -> SyncResult<PostSnapshot> {
        let data = self.data.lock();
        let posts = data
            .posts
            .iter()
            .filter(|p| ids.contains(&p.id))
            .map(|p| data.view(p, &self.viewer))
            .collect();
        Ok(PostSnapshot::new(posts, self.tick()))
    }
}

struct FakeConnection {
    frames: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl PushConnection for FakeConnection {
    async fn next_frame(&mut self) -> Option<SyncResult<String>> {
        self.frames.recv().await.map(Ok)
    }
}

#[async_trait]
impl RemotePushPort for FakeBackend {
    async fn connect(&self, bearer_token: &str) -> SyncResult<Box<dyn PushConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if bearer_token.is_empty() {
            return Err(SyncError::Credential("empty bearer token".into()));
        }

        let mut data = self.data.lock();
        if data.fail_connects > 0 {
            data.fail_connects -= 1;
            return Err(SyncError::ChannelDropped("scripted connect failure".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        data.connections.push(tx);
        Ok(Box::new(FakeConnection { frames: rx }))
    }
}

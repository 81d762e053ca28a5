//! Session facade wiring the store, queue, coordinator and push listener.

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::ports::{CredentialSource, EntityFetchPort, RemotePushPort, RemoteWritePort};
use crate::push::PushListener;
use crate::reconciler::{Reconciler, SyncEvent};
use crate::state::ConnectionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;
use verdant_core::{EntityStore, JournalBackend, MutationQueue, QueueStats};
use verdant_protocol::{
    CommentId, MutationId, MutationKind, MutationPayload, MutationRecord, Post, PostId,
};

/// The backend ports a client talks through.
#[derive(Clone)]
pub struct SyncPorts {
    /// Sends queued writes.
    pub writer: Arc<dyn RemoteWritePort>,
    /// Fetches posts.
    pub fetcher: Arc<dyn EntityFetchPort>,
    /// Opens the push channel.
    pub push: Arc<dyn RemotePushPort>,
}

impl SyncPorts {
    /// Uses one backend for all three ports.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: RemoteWritePort + EntityFetchPort + RemotePushPort + 'static,
    {
        Self {
            writer: backend.clone(),
            fetcher: backend.clone(),
            push: backend,
        }
    }
}

/// Client-side sync for one device.
///
/// Writes are accepted only while logged in. Each write is applied to the
/// store before the call returns and sent in the background.
///
/// ```rust,ignore
/// let client = SyncClient::new(SyncConfig::new("u1"), SyncPorts::from_backend(backend));
/// client.login(Arc::new(StaticCredential::new(token))).await?;
///
/// let mut events = client.subscribe();
/// client.like(&PostId::new("42"))?;
/// assert!(client.post(&PostId::new("42")).unwrap().liked_by_me);
/// ```
pub struct SyncClient {
    config: SyncConfig,
    ports: SyncPorts,
    reconciler: Arc<Reconciler>,
    coordinator: SyncCoordinator,
    listener: PushListener,
    logged_in: AtomicBool,
}

impl SyncClient {
    /// Creates a client with an in-memory queue.
    pub fn new(config: SyncConfig, ports: SyncPorts) -> Self {
        let store = Arc::new(EntityStore::new());
        let queue = Arc::new(MutationQueue::with_config(store, config.queue.clone()));
        Self::build(config, ports, queue)
    }

    /// Creates a client whose queue survives restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub fn open(
        config: SyncConfig,
        ports: SyncPorts,
        backend: Box<dyn JournalBackend>,
    ) -> SyncResult<Self> {
        let store = Arc::new(EntityStore::new());
        let queue = Arc::new(MutationQueue::open(store, config.queue.clone(), backend)?);
        Ok(Self::build(config, ports, queue))
    }

    fn build(config: SyncConfig, ports: SyncPorts, queue: Arc<MutationQueue>) -> Self {
        let reconciler = Arc::new(Reconciler::new(config.local_user_id.clone(), queue));
        let coordinator =
            SyncCoordinator::new(&config, Arc::clone(&reconciler), Arc::clone(&ports.writer));
        let listener = PushListener::new(
            &config,
            Arc::clone(&reconciler),
            Arc::clone(&ports.push),
            Arc::clone(&ports.fetcher),
        );
        Self {
            config,
            ports,
            reconciler,
            coordinator,
            listener,
            logged_in: AtomicBool::new(false),
        }
    }

    /// Starts a session.
    ///
    /// Loads the feed, re-applies the effect of writes restored from the
    /// journal, returns writes interrupted by an earlier logout to Pending,
    /// then starts sending and listening.
    ///
    /// # Errors
    ///
    /// Returns the fetch error if the feed cannot be loaded; the client stays
    /// logged out.
    pub async fn login(&self, credentials: Arc<dyn CredentialSource>) -> SyncResult<()> {
        if self.is_logged_in() {
            return Ok(());
        }

        let feed = self.ports.fetcher.fetch_feed().await?;
        let posts = feed.len();
        self.store().load(feed);
        let restored = self.queue().reapply_all()?;
        let resumed = self.queue().requeue_failed()?;

        self.logged_in.store(true, Ordering::SeqCst);
        self.listener.start(credentials);
        self.coordinator.start();
        info!(user = %self.config.local_user_id, posts, restored, resumed, "session started");
        Ok(())
    }

    /// Ends the session.
    ///
    /// In-flight sends are abandoned and their records become Failed, to be
    /// resent after the next login. The push channel is closed before the
    /// store is cleared, so no event lands afterwards.
    pub async fn logout(&self) -> SyncResult<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        let abandoned = self.coordinator.shutdown().await?;
        self.listener.stop().await;
        self.reconciler.clear();
        self.store().reset();
        info!(user = %self.config.local_user_id, abandoned = abandoned.len(), "session ended");
        Ok(())
    }

    /// Returns true between login and logout.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Queues a write and applies it optimistically.
    ///
    /// # Errors
    ///
    /// - `NotLoggedIn` outside a session
    /// - `DuplicateInFlight` if the same operation is unresolved
    /// - `QueueOverflow` if the queue is full
    pub fn enqueue(
        &self,
        kind: MutationKind,
        target_id: PostId,
        payload: MutationPayload,
    ) -> SyncResult<MutationId> {
        if !self.is_logged_in() {
            return Err(SyncError::NotLoggedIn);
        }
        let id = self.queue().enqueue(kind, target_id.clone(), payload)?;
        info!(mutation = %id, %kind, post = %target_id, "mutation queued");
        Ok(id)
    }

    /// Likes a post.
    pub fn like(&self, post_id: &PostId) -> SyncResult<MutationId> {
        self.enqueue(MutationKind::Like, post_id.clone(), MutationPayload::Like)
    }

    /// Removes the local user's like.
    pub fn unlike(&self, post_id: &PostId) -> SyncResult<MutationId> {
        self.enqueue(MutationKind::Unlike, post_id.clone(), MutationPayload::Unlike)
    }

    /// Comments on a post. Returns the placeholder id of the shown comment.
    pub fn comment(
        &self,
        post_id: &PostId,
        content: impl Into<String>,
    ) -> SyncResult<(MutationId, CommentId)> {
        let comment_id = CommentId::local();
        let payload = MutationPayload::Comment {
            comment_id: comment_id.clone(),
            author_id: self.config.local_user_id.clone(),
            content: content.into(),
        };
        let id = self.enqueue(MutationKind::Comment, post_id.clone(), payload)?;
        Ok((id, comment_id))
    }

    /// Creates a post. Returns the temporary id it is shown under until the
    /// server assigns one.
    pub fn create_post(
        &self,
        content: impl Into<String>,
        image_ref: Option<String>,
    ) -> SyncResult<(MutationId, PostId)> {
        let post_id = PostId::local();
        let payload =
            MutationPayload::create_post(self.config.local_user_id.clone(), content, image_ref);
        let id = self.enqueue(MutationKind::CreatePost, post_id.clone(), payload)?;
        Ok((id, post_id))
    }

    /// Deletes a post.
    pub fn delete_post(&self, post_id: &PostId) -> SyncResult<MutationId> {
        self.enqueue(MutationKind::DeletePost, post_id.clone(), MutationPayload::DeletePost)
    }

    /// Re-attempts a write whose retries were exhausted.
    pub fn retry(&self, id: MutationId) -> SyncResult<()> {
        self.queue().retry(id)?;
        info!(mutation = %id, "parked mutation retried");
        Ok(())
    }

    /// Drops a write that is not in flight and reverts its effect.
    pub fn discard(&self, id: MutationId) -> SyncResult<()> {
        self.queue().discard(id)?;
        info!(mutation = %id, "mutation discarded");
        Ok(())
    }

    /// Subscribes to UI events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.reconciler.subscribe()
    }

    /// Returns the push channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.listener.state()
    }

    /// Watches push channel state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.listener.watch_state()
    }

    /// Returns true while the offline indicator is raised.
    pub fn is_offline(&self) -> bool {
        self.listener.is_offline()
    }

    /// Returns the feed as shown to the user.
    pub fn feed(&self) -> Vec<Post> {
        self.store().feed()
    }

    /// Returns one post as shown to the user.
    pub fn post(&self, id: &PostId) -> Option<Post> {
        self.store().get(id)
    }

    /// Returns a queued write.
    pub fn mutation(&self, id: MutationId) -> Option<MutationRecord> {
        self.queue().get(id)
    }

    /// Returns queue counts.
    pub fn stats(&self) -> QueueStats {
        self.queue().stats()
    }

    /// Returns the entity store.
    pub fn store(&self) -> &Arc<EntityStore> {
        self.reconciler.store()
    }

    /// Returns the mutation queue.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        self.reconciler.queue()
    }

    /// Returns the reconciler.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Returns the push listener.
    pub fn listener(&self) -> &PushListener {
        &self.listener
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

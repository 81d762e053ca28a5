//! Test fixtures and session helpers.
//!
//! Provides posts, configurations and signed-in clients for common test
//! scenarios.

use crate::backend::FakeBackend;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use verdant_core::FileJournalBackend;
use verdant_protocol::{Post, PostId, Timestamp, UserId};
use verdant_sync::{RetryConfig, StaticCredential, SyncClient, SyncConfig, SyncPorts};

/// The user every fixture signs in as.
pub const LOCAL_USER: &str = "me";

/// How long [`eventually`] waits before giving up.
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a post by `author` with `likes` likes.
pub fn post(id: &str, likes: u64) -> Post {
    Post::new(
        PostId::new(id),
        UserId::new("author"),
        format!("leaf spots on {id}"),
        Timestamp::from_millis(1),
    )
    .with_likes(likes, false)
}

/// Three posts, `p1` to `p3`, with 10, 0 and 3 likes.
pub fn sample_posts() -> Vec<Post> {
    vec![post("p1", 10), post("p2", 0), post("p3", 3)]
}

/// A configuration for [`LOCAL_USER`] that retries without waiting.
pub fn test_config() -> SyncConfig {
    SyncConfig::new(LOCAL_USER)
        .with_retry(RetryConfig::immediate())
        .with_request_timeout(Duration::from_secs(2))
}

/// Polls `condition` until it holds or [`EVENTUALLY_TIMEOUT`] passes.
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Awaits `future`, failing the test if it takes longer than
/// [`EVENTUALLY_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(EVENTUALLY_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {EVENTUALLY_TIMEOUT:?}"),
    }
}

/// A client signed in against a fake backend.
pub struct TestSession {
    /// The fake server.
    pub backend: Arc<FakeBackend>,
    /// The client under test.
    pub client: SyncClient,
}

impl TestSession {
    /// Starts a session against a server holding `posts` and waits for the
    /// push channel.
    pub async fn start(posts: Vec<Post>) -> Self {
        Self::start_with(posts, test_config()).await
    }

    /// Starts a session with a custom configuration.
    pub async fn start_with(posts: Vec<Post>, config: SyncConfig) -> Self {
        let backend = FakeBackend::with_posts(LOCAL_USER, posts);
        let client = SyncClient::new(config, SyncPorts::from_backend(Arc::clone(&backend)));
        let session = Self { backend, client };
        session.login().await;
        session
    }

    /// Signs in again and waits for the push channel.
    pub async fn login(&self) {
        self.client
            .login(Arc::new(StaticCredential::new("test-token")))
            .await
            .expect("login failed");
        assert!(
            eventually(|| self.client.connection_state().is_connected()).await,
            "push channel did not connect"
        );
    }

    /// Returns a post as the client shows it.
    pub fn shown(&self, id: &str) -> Post {
        self.client
            .post(&PostId::new(id))
            .unwrap_or_else(|| panic!("post {id} not shown"))
    }

    /// Waits until the queue is empty.
    pub async fn settle(&self) {
        assert!(
            eventually(|| self.client.queue().is_empty()).await,
            "queue did not drain: {:?}",
            self.client.stats()
        );
    }
}

/// A journal file in a temporary directory.
pub struct TempJournal {
    dir: TempDir,
}

impl TempJournal {
    /// Creates an empty temporary directory for a journal.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
        }
    }

    /// Returns the journal path.
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("mutations.vmq")
    }

    /// Opens the journal file.
    pub fn open(&self) -> FileJournalBackend {
        FileJournalBackend::open(&self.path()).expect("failed to open journal")
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}

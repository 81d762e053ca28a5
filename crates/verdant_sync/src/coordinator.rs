//! Dispatch of queued writes to the server.
//!
//! ## Dispatch model
//!
//! - Records are taken from the queue's pending batch in enqueue order
//! - At most `worker_count` sends are in flight at once
//! - Writes to the same post are never in flight together, so a Comment and
//!   a later DeletePost on one post reach the server in order
//! - Retryable failures wait out a backoff delay off the worker pool, then
//!   return to the queue

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::ports::RemoteWritePort;
use crate::reconciler::Reconciler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use verdant_core::{CoreError, MutationQueue};
use verdant_protocol::{MutationId, MutationRecord};

struct CoordinatorInner {
    reconciler: Arc<Reconciler>,
    writer: Arc<dyn RemoteWritePort>,
    retry: RetryConfig,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
    /// Bumped on shutdown; attempts from an older epoch discard their result.
    epoch: AtomicU64,
}

impl CoordinatorInner {
    fn queue(&self) -> &Arc<MutationQueue> {
        self.reconciler.queue()
    }

    /// Starts an attempt for every sendable record while workers are free.
    fn dispatch(self: &Arc<Self>, workers: &mut JoinSet<()>) -> usize {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut started = 0;

        for record in self.queue().pending_batch() {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let record = match self.queue().mark_processing(record.id) {
                Ok(record) => record,
                Err(e) => {
                    debug!(mutation = %record.id, error = %e, "record no longer sendable");
                    continue;
                }
            };
            debug!(mutation = %record.id, kind = %record.kind, post = %record.target_id, "dispatching mutation");
            workers.spawn(Arc::clone(self).attempt(record, permit, epoch));
            started += 1;
        }
        started
    }

    async fn attempt(self: Arc<Self>, record: MutationRecord, permit: OwnedSemaphorePermit, epoch: u64) {
        let outcome = match tokio::time::timeout(self.request_timeout, self.writer.send(&record)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(mutation = %record.id, "discarding result of abandoned attempt");
            return;
        }

        let resolved = match outcome {
            Ok(ack) => self.reconciler.confirm(&record, &ack),
            Err(error) if error.is_retryable() => {
                drop(permit);
                self.retry_later(&record, error, epoch).await
            }
            Err(error) => self.reconciler.reject(&record, &error),
        };
        if let Err(e) = resolved {
            warn!(mutation = %record.id, error = %e, "failed to resolve mutation");
        }
    }

    async fn retry_later(&self, record: &MutationRecord, error: SyncError, epoch: u64) -> SyncResult<()> {
        let failed = self.queue().mark_failed(record.id, error.to_string())?;
        if self.retry.is_exhausted(failed.retry_count) {
            return self.reconciler.park(&failed);
        }

        let delay = self.retry.delay_for_attempt(failed.retry_count);
        warn!(
            mutation = %record.id,
            attempt = failed.retry_count,
            max_retries = self.retry.max_retries,
            ?delay,
            %error,
            "mutation attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(());
        }

        match self.queue().requeue(record.id) {
            Ok(_) => Ok(()),
            // Discarded by the user while waiting.
            Err(CoreError::UnknownMutation(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut workers = JoinSet::new();
        loop {
            self.dispatch(&mut workers);
            tokio::select! {
                _ = self.queue().changed().notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "mutation worker ended abnormally");
                    }
                }
            }
        }
    }
}

/// Sends queued writes to the server with bounded concurrency.
///
/// Each attempt ends in exactly one of:
///
/// | Outcome | Effect |
/// |---|---|
/// | Confirmed | server state applied, record removed |
/// | Retryable error | record Failed, requeued after backoff |
/// | Retryable error, budget used up | record parked, effect reverted |
/// | Permanent error | record removed, effect reverted |
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Creates a stopped coordinator.
    pub fn new(config: &SyncConfig, reconciler: Arc<Reconciler>, writer: Arc<dyn RemoteWritePort>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                reconciler,
                writer,
                retry: config.retry.clone(),
                request_timeout: config.request_timeout,
                permits: Arc::new(Semaphore::new(config.worker_count.max(1))),
                epoch: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts the background dispatch loop. Does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        info!(workers = self.inner.permits.available_permits(), "sync coordinator started");
        *task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
    }

    /// Returns true while the background loop runs.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Sends writes in the current task until nothing is sendable or in
    /// flight.
    ///
    /// Parked records and records waiting behind them stay queued. Must not
    /// be used while the background loop runs.
    pub async fn drain_until_idle(&self) {
        let mut workers = JoinSet::new();
        loop {
            self.inner.dispatch(&mut workers);
            match workers.join_next().await {
                Some(Err(e)) => warn!(error = %e, "mutation worker ended abnormally"),
                Some(Ok(())) => {}
                None => break,
            }
        }
    }

    /// Stops dispatching and abandons in-flight attempts.
    ///
    /// Records that were in flight become Failed; their outcome is unknown and
    /// the resend after the next login is de-duplicated by mutation id.
    /// Returns their ids.
    pub async fn shutdown(&self) -> SyncResult<Vec<MutationId>> {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let task = self.task.lock().take();
        if let Some(task) = task {
            // Dropping the loop's JoinSet aborts its workers.
            task.abort();
            let _ = task.await;
        }

        let abandoned = self.inner.queue().fail_in_flight("cancelled by logout")?;
        if !abandoned.is_empty() {
            info!(mutations = abandoned.len(), "abandoned in-flight mutations");
        }
        Ok(abandoned)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use verdant_core::EntityStore;
    use verdant_protocol::{
        MutationKind, MutationPayload, MutationStatus, Post, PostId, ServerState, Timestamp, UserId,
        WriteAck,
    };

    /// Answers sends from a script; confirms once the script runs out.
    struct ScriptedWriter {
        script: Mutex<VecDeque<SyncError>>,
        sends: AtomicUsize,
    }

    impl ScriptedWriter {
        fn new(script: Vec<SyncError>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sends: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteWritePort for ScriptedWriter {
        async fn send(&self, record: &MutationRecord) -> SyncResult<WriteAck> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.script.lock().pop_front() {
                return Err(error);
            }
            Ok(WriteAck::new(
                record.id,
                Timestamp::from_millis(100),
                ServerState::Likes {
                    like_count: 11,
                    liked_by_me: true,
                },
            ))
        }
    }

    fn setup(writer: Arc<ScriptedWriter>) -> (Arc<EntityStore>, Arc<MutationQueue>, SyncCoordinator) {
        let store = Arc::new(EntityStore::new());
        store.load(vec![Post::new(
            PostId::new("42"),
            UserId::new("author"),
            "yellow rust",
            Timestamp::from_millis(1),
        )
        .with_likes(10, false)]);
        let queue = Arc::new(MutationQueue::new(Arc::clone(&store)));
        let reconciler = Arc::new(Reconciler::new(UserId::new("me"), Arc::clone(&queue)));
        let config = SyncConfig::new("me").with_retry(RetryConfig::immediate());
        let coordinator = SyncCoordinator::new(&config, reconciler, writer);
        (store, queue, coordinator)
    }

    fn like(queue: &MutationQueue) -> MutationId {
        queue
            .enqueue(MutationKind::Like, PostId::new("42"), MutationPayload::Like)
            .unwrap()
    }

    #[tokio::test]
    async fn confirmed_write_leaves_queue() {
        let writer = ScriptedWriter::new(Vec::new());
        let (store, queue, coordinator) = setup(Arc::clone(&writer));
        like(&queue);

        coordinator.drain_until_idle().await;

        assert!(queue.is_empty());
        assert_eq!(store.get(&PostId::new("42")).unwrap().like_count, 11);
        assert_eq!(writer.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let writer = ScriptedWriter::new(vec![
            SyncError::transport_retryable("reset"),
            SyncError::Timeout,
            SyncError::transport_retryable("reset"),
        ]);
        let (store, queue, coordinator) = setup(Arc::clone(&writer));
        let mut events = coordinator.inner.reconciler.subscribe();
        like(&queue);

        coordinator.drain_until_idle().await;

        assert!(queue.is_empty());
        assert_eq!(writer.sends.load(Ordering::SeqCst), 4);
        assert_eq!(store.get(&PostId::new("42")).unwrap().like_count, 11);
        let mut confirmed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, crate::reconciler::SyncEvent::MutationConfirmed { .. }) {
                confirmed += 1;
            }
        }
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_park_and_revert() {
        let writer = ScriptedWriter::new((0..6).map(|_| SyncError::transport_retryable("down")).collect());
        let (store, queue, coordinator) = setup(Arc::clone(&writer));
        let id = like(&queue);

        coordinator.drain_until_idle().await;

        // One attempt plus five retries.
        assert_eq!(writer.sends.load(Ordering::SeqCst), 6);
        let record = queue.get(id).unwrap();
        assert!(record.parked);
        assert_eq!(record.status, MutationStatus::Failed);
        assert_eq!(record.retry_count, 6);
        let post = store.get(&PostId::new("42")).unwrap();
        assert_eq!(post.like_count, 10);
        assert!(!post.liked_by_me);
    }

    #[tokio::test]
    async fn permanent_error_rejects_once() {
        let writer = ScriptedWriter::new(vec![SyncError::rejected(Some(404), "post not found")]);
        let (store, queue, coordinator) = setup(Arc::clone(&writer));
        let mut events = coordinator.inner.reconciler.subscribe();
        like(&queue);

        coordinator.drain_until_idle().await;

        assert!(queue.is_empty());
        assert_eq!(writer.sends.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&PostId::new("42")).unwrap().like_count, 10);
        assert!(matches!(
            events.try_recv().unwrap(),
            crate::reconciler::SyncEvent::MutationRejected { .. }
        ));
    }

    #[tokio::test]
    async fn background_loop_sends_new_writes() {
        let writer = ScriptedWriter::new(Vec::new());
        let (_store, queue, coordinator) = setup(Arc::clone(&writer));
        coordinator.start();
        assert!(coordinator.is_running());

        like(&queue);
        for _ in 0..200 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_empty());

        coordinator.shutdown().await.unwrap();
        assert!(!coordinator.is_running());
    }
}

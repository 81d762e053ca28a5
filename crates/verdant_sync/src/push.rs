//! Push channel listener.
//!
//! Two tasks run per session:
//!
//! - the connection task opens the channel, reconnects with backoff when it
//!   drops, and parses frames into a bounded backlog
//! - the consumer task hands backlog events to the reconciler one at a time
//!
//! When the backlog is full the oldest buffered event is dropped. A dropped
//! like or comment is repaired by the next gap fill or write confirmation.
//! A gap fill also drops buffered events its snapshot already counts.

use crate::config::{PushConfig, RetryConfig, SyncConfig};
use crate::error::SyncResult;
use crate::ports::{CredentialSource, EntityFetchPort, PushConnection, RemotePushPort};
use crate::reconciler::{Reconciler, SyncEvent};
use crate::state::ConnectionState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use verdant_protocol::{InboundMessage, PostId, PostSnapshot, PushEvent};

struct ListenerInner {
    reconciler: Arc<Reconciler>,
    port: Arc<dyn RemotePushPort>,
    fetcher: Arc<dyn EntityFetchPort>,
    config: PushConfig,
    retry: RetryConfig,
    state: watch::Sender<ConnectionState>,
    backlog: Mutex<VecDeque<PushEvent>>,
    backlog_ready: Notify,
    offline: AtomicBool,
    dropped: AtomicU64,
}

impl ListenerInner {
    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected push channel transition");
        }
        debug!(from = %previous, to = %next, "push channel state changed");
        self.reconciler.emit(SyncEvent::ConnectionChanged(next));
    }

    fn set_offline(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::SeqCst) != offline {
            if offline {
                warn!("push channel unreachable, showing offline");
            } else {
                info!("push channel reachable again");
            }
            self.reconciler.emit(SyncEvent::Offline(offline));
        }
    }

    async fn open(&self, credentials: &dyn CredentialSource) -> SyncResult<Box<dyn PushConnection>> {
        let token = credentials.bearer_token().await?;
        self.port.connect(&token).await
    }

    async fn run_connection(self: Arc<Self>, credentials: Arc<dyn CredentialSource>) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            self.set_state(if connected_before {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.open(credentials.as_ref()).await {
                Ok(mut connection) => {
                    failures = 0;
                    self.set_offline(false);
                    self.set_state(ConnectionState::Connected);
                    info!(reconnect = connected_before, "push channel connected");
                    if connected_before {
                        self.gap_fill().await;
                    }
                    connected_before = true;
                    self.read_frames(connection.as_mut()).await;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "push channel connect failed");
                    if failures >= self.config.offline_after_failures {
                        self.set_offline(true);
                    }
                }
            }

            let delay = self.retry.delay_for_attempt(failures.saturating_add(1));
            debug!(?delay, "reconnecting push channel");
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn read_frames(&self, connection: &mut dyn PushConnection) {
        while let Some(frame) = connection.next_frame().await {
            match frame {
                Ok(text) => match InboundMessage::parse(&text).and_then(InboundMessage::into_event) {
                    Ok(event) => self.buffer(event),
                    Err(e) => warn!(error = %e, "dropping malformed push frame"),
                },
                Err(e) => {
                    warn!(error = %e, "push channel failed");
                    return;
                }
            }
        }
        info!("push channel closed by server");
    }

    fn buffer(&self, event: PushEvent) {
        let mut backlog = self.backlog.lock();
        if backlog.len() >= self.config.backlog_capacity {
            if let Some(oldest) = backlog.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = %oldest.id, capacity = self.config.backlog_capacity, "push backlog full, dropping oldest event");
            }
        }
        backlog.push_back(event);
        drop(backlog);
        self.backlog_ready.notify_one();
    }

    async fn run_consumer(self: Arc<Self>) {
        loop {
            let next = self.backlog.lock().pop_front();
            match next {
                Some(event) => {
                    let id = event.id.clone();
                    let outcome = self.reconciler.handle_push(event);
                    debug!(event = %id, ?outcome, "push event handled");
                }
                None => self.backlog_ready.notified().await,
            }
        }
    }

    /// Re-fetches the loaded posts after the channel was down, since events
    /// sent meanwhile were missed.
    async fn gap_fill(&self) {
        let ids: Vec<PostId> = self
            .reconciler
            .store()
            .post_ids()
            .into_iter()
            .filter(|id| !id.is_local())
            .collect();
        if ids.is_empty() {
            return;
        }

        match self.fetcher.fetch_posts(&ids).await {
            Ok(snapshot) => {
                let drained = self.drain_covered(&snapshot);
                if drained > 0 {
                    debug!(events = drained, "dropped buffered events counted by gap fill");
                }
                if let Err(e) = self.reconciler.gap_fill(snapshot) {
                    warn!(error = %e, "gap fill failed");
                }
            }
            Err(e) => warn!(error = %e, posts = ids.len(), "gap fill fetch failed"),
        }
    }

    /// Removes buffered entity events the snapshot already reflects and
    /// remembers them as delivered.
    fn drain_covered(&self, snapshot: &PostSnapshot) -> usize {
        let store = self.reconciler.store();
        let mut backlog = self.backlog.lock();
        let before = backlog.len();
        backlog.retain(|event| {
            let covered = event.family().is_some()
                && event.server_timestamp <= snapshot.server_timestamp
                && event
                    .target_id
                    .as_ref()
                    .is_some_and(|id| snapshot.posts.iter().any(|p| &p.id == id));
            if covered {
                store.acknowledge_event(event);
            }
            !covered
        });
        before - backlog.len()
    }
}

/// Listens on the push channel for the signed-in session.
pub struct PushListener {
    inner: Arc<ListenerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PushListener {
    /// Creates a stopped listener.
    pub fn new(
        config: &SyncConfig,
        reconciler: Arc<Reconciler>,
        port: Arc<dyn RemotePushPort>,
        fetcher: Arc<dyn EntityFetchPort>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ListenerInner {
                reconciler,
                port,
                fetcher,
                config: config.push.clone(),
                retry: config.retry.clone(),
                state,
                backlog: Mutex::new(VecDeque::new()),
                backlog_ready: Notify::new(),
                offline: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connects and starts delivering events. Does nothing if already
    /// started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, credentials: Arc<dyn CredentialSource>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(Arc::clone(&self.inner).run_connection(credentials)));
        tasks.push(tokio::spawn(Arc::clone(&self.inner).run_consumer()));
    }

    /// Disconnects and drops buffered events.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let buffered = {
            let mut backlog = self.inner.backlog.lock();
            let len = backlog.len();
            backlog.clear();
            len
        };
        if buffered > 0 {
            debug!(events = buffered, "dropped buffered push events on stop");
        }
        self.inner.offline.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Returns the current channel state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watches channel state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns true while the offline indicator is raised.
    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Returns the number of events dropped because the backlog was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of buffered events.
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

//! Merges server-pushed events and write outcomes into the entity store.

use crate::error::SyncError;
use crate::state::ConnectionState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use verdant_core::{EntityStore, MutationQueue, RemoteApply};
use verdant_protocol::{
    EventFamily, MutationId, MutationKind, MutationRecord, PostId, PostSnapshot, PushEvent,
    PushPayload, ServerState, Timestamp, UserId, WriteAck,
};

/// Capacity of the UI event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events surfaced to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Another user's action the UI may show as a notification.
    Notification {
        /// Acting user.
        from: UserId,
        /// Related post, if any.
        post_id: Option<PostId>,
        /// Text to show.
        message: String,
    },
    /// The server confirmed a local write.
    MutationConfirmed {
        /// Mutation id.
        id: MutationId,
        /// Kind of write.
        kind: MutationKind,
        /// Post after confirmation (the server id for created posts).
        target_id: PostId,
    },
    /// The server refused a local write; its effect was reverted.
    MutationRejected {
        /// Mutation id.
        id: MutationId,
        /// Kind of write.
        kind: MutationKind,
        /// Target post.
        target_id: PostId,
        /// Server's reason.
        reason: String,
    },
    /// Retries are exhausted; the effect was reverted and the write is
    /// parked until the user retries or discards it.
    MutationFailed {
        /// Mutation id.
        id: MutationId,
        /// Kind of write.
        kind: MutationKind,
        /// Target post.
        target_id: PostId,
        /// Failed attempts.
        attempts: u32,
        /// Last error.
        error: String,
    },
    /// The push channel changed state.
    ConnectionChanged(ConnectionState),
    /// Reconnecting has failed repeatedly (`true`) or recovered (`false`).
    Offline(bool),
    /// Entities were re-fetched after a reconnect.
    GapFilled {
        /// Number of posts merged.
        posts: usize,
    },
}

/// How a push event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Applied to the store.
    Applied,
    /// Held until a local write of the same family resolves.
    Deferred,
    /// Caused by the local user; already reflected optimistically.
    OwnEvent,
    /// Delivered before.
    Duplicate,
    /// Forwarded to the UI as a notification.
    Notified,
    /// Nothing to change (unloaded post, known comment).
    Ignored,
}

#[derive(Default)]
struct MergeState {
    deferred: HashMap<(PostId, EventFamily), Vec<PushEvent>>,
    /// Server time of the last confirmed or fetched like values, per post.
    like_watermarks: HashMap<PostId, Timestamp>,
}

impl MergeState {
    fn covers(&self, event: &PushEvent, target: &PostId) -> bool {
        event.family() == Some(EventFamily::Likes)
            && self
                .like_watermarks
                .get(target)
                .is_some_and(|at| event.server_timestamp <= *at)
    }
}

/// The single merge policy for remote events and local write outcomes.
///
/// # Merge rules
///
/// - Events caused by the local user are dropped
/// - Events touching fields with an unresolved local write of the same
///   family are deferred and applied as deltas once the write resolves
/// - Like counts change only by signed deltas, except that a confirmed write
///   or a gap fill sets the server's values; like events the server had
///   already counted in those values are not added again
/// - Each event (id + server timestamp) changes the store at most once
///
/// # Locking
///
/// The merge state is locked before the queue, and the queue before the
/// store.
pub struct Reconciler {
    local_user: UserId,
    store: Arc<EntityStore>,
    queue: Arc<MutationQueue>,
    state: Mutex<MergeState>,
    events: broadcast::Sender<SyncEvent>,
}

impl Reconciler {
    /// Creates a reconciler for `local_user`.
    pub fn new(local_user: UserId, queue: Arc<MutationQueue>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_user,
            store: Arc::clone(queue.store()),
            queue,
            state: Mutex::new(MergeState::default()),
            events,
        }
    }

    /// Subscribes to UI events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Emits a UI event. Having no subscriber is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Returns the entity store.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Returns the mutation queue.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Handles one validated push event.
    pub fn handle_push(&self, event: PushEvent) -> PushOutcome {
        if event.origin_user_id == self.local_user {
            // Still remembered, so a redelivery is never taken for a new
            // event.
            self.store.acknowledge_event(&event);
            debug!(event = %event.id, "ignoring own push event");
            return PushOutcome::OwnEvent;
        }

        if let PushPayload::Notification { message } = &event.payload {
            return match self.store.apply_remote_event(&event) {
                RemoteApply::Duplicate => PushOutcome::Duplicate,
                _ => {
                    self.emit(SyncEvent::Notification {
                        from: event.origin_user_id.clone(),
                        post_id: event.target_id.clone(),
                        message: message.clone(),
                    });
                    PushOutcome::Notified
                }
            };
        }

        let (Some(target), Some(family)) = (event.target_id.clone(), event.family()) else {
            return PushOutcome::Ignored;
        };

        let mut state = self.state.lock();
        if self.queue.has_active(&target, family) {
            debug!(event = %event.id, post = %target, ?family, "deferring push event behind local write");
            state.deferred.entry((target, family)).or_default().push(event);
            return PushOutcome::Deferred;
        }
        if state.covers(&event, &target) {
            return if self.store.acknowledge_event(&event) {
                PushOutcome::Ignored
            } else {
                PushOutcome::Duplicate
            };
        }

        match self.store.apply_remote_event(&event) {
            RemoteApply::Applied => PushOutcome::Applied,
            RemoteApply::Duplicate => PushOutcome::Duplicate,
            RemoteApply::Ignored => PushOutcome::Ignored,
        }
    }

    /// Returns the number of events waiting behind local writes.
    pub fn deferred_len(&self) -> usize {
        self.state.lock().deferred.values().map(Vec::len).sum()
    }

    /// Resolves a write the server confirmed.
    pub fn confirm(&self, record: &MutationRecord, ack: &WriteAck) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        self.queue.confirm(record.id, &ack.state)?;
        let target_id = match &ack.state {
            ServerState::Post { post } => post.id.clone(),
            ServerState::Likes { .. } => {
                let mark = state
                    .like_watermarks
                    .entry(record.target_id.clone())
                    .or_insert(ack.server_timestamp);
                *mark = (*mark).max(ack.server_timestamp);
                record.target_id.clone()
            }
            _ => record.target_id.clone(),
        };
        if let Some(family) = record.kind.family() {
            self.flush(&mut state, &record.target_id, family);
        }
        drop(state);

        info!(mutation = %record.id, kind = %record.kind, post = %target_id, "mutation confirmed");
        self.emit(SyncEvent::MutationConfirmed {
            id: record.id,
            kind: record.kind,
            target_id,
        });
        Ok(())
    }

    /// Resolves a write the server refused: reverts it and surfaces the
    /// error once.
    pub fn reject(&self, record: &MutationRecord, error: &SyncError) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        self.queue.reject(record.id)?;
        if let Some(family) = record.kind.family() {
            self.flush(&mut state, &record.target_id, family);
        }
        drop(state);

        warn!(mutation = %record.id, kind = %record.kind, post = %record.target_id, %error, "mutation rejected");
        self.emit(SyncEvent::MutationRejected {
            id: record.id,
            kind: record.kind,
            target_id: record.target_id.clone(),
            reason: error.to_string(),
        });
        Ok(())
    }

    /// Parks a write whose retries are exhausted.
    pub fn park(&self, record: &MutationRecord) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        let parked = self.queue.park(record.id)?;
        if let Some(family) = record.kind.family() {
            self.flush(&mut state, &record.target_id, family);
        }
        drop(state);

        self.emit(SyncEvent::MutationFailed {
            id: parked.id,
            kind: parked.kind,
            target_id: parked.target_id,
            attempts: parked.retry_count,
            error: parked.last_error.unwrap_or_default(),
        });
        Ok(())
    }

    /// Applies events deferred behind writes that are now resolved.
    fn flush(&self, state: &mut MergeState, target: &PostId, family: EventFamily) {
        if self.queue.has_active(target, family) {
            return;
        }
        let Some(events) = state.deferred.remove(&(target.clone(), family)) else {
            return;
        };

        let mut applied = 0;
        for event in &events {
            if state.covers(event, target) {
                self.store.acknowledge_event(event);
            } else if self.store.apply_remote_event(event) == RemoteApply::Applied {
                applied += 1;
            }
        }
        debug!(post = %target, ?family, deferred = events.len(), applied, "flushed deferred push events");
    }

    /// Merges re-fetched posts after a reconnect.
    ///
    /// Fetched posts replace the local copies, then the optimistic effect of
    /// every unresolved local write is applied on top again. The snapshot
    /// time becomes the like watermark of every fetched post, so events
    /// already counted in the snapshot are not added again when delivered
    /// late. Deferred events at or before the snapshot are dropped; later
    /// ones stay deferred.
    pub fn gap_fill(&self, snapshot: PostSnapshot) -> Result<usize, SyncError> {
        let PostSnapshot {
            posts,
            server_timestamp: fetched_at,
        } = snapshot;
        let fetched: Vec<PostId> = posts.iter().map(|p| p.id.clone()).collect();
        let mut state = self.state.lock();
        let merged = self.queue.rebase(posts)?;
        for id in &fetched {
            let mark = state
                .like_watermarks
                .entry(id.clone())
                .or_insert(fetched_at);
            *mark = (*mark).max(fetched_at);
        }

        let mut covered = 0;
        state.deferred.retain(|(post, _), events| {
            if !fetched.contains(post) {
                return true;
            }
            events.retain(|event| {
                if event.server_timestamp > fetched_at {
                    return true;
                }
                self.store.acknowledge_event(event);
                covered += 1;
                false
            });
            !events.is_empty()
        });
        drop(state);

        info!(posts = merged, covered, at = %fetched_at, "gap fill merged");
        self.emit(SyncEvent::GapFilled { posts: merged });
        Ok(merged)
    }

    /// Drops deferred events and watermarks (logout).
    pub fn clear(&self) {
        *self.state.lock() = MergeState::default();
    }
}

//! The mutation queue: local writes awaiting server confirmation.

use crate::error::{CoreError, CoreResult};
use crate::journal::{JournalBackend, QueueJournal};
use crate::store::EntityStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use verdant_protocol::{
    EventFamily, MutationId, MutationKind, MutationPayload, MutationRecord, MutationStatus, Post,
    PostId, ServerState, Undo,
};

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of records held at once.
    pub max_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_records: 500 }
    }
}

impl QueueConfig {
    /// Sets the capacity.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }
}

/// Counts of queued records by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// All records.
    pub total: usize,
    /// Waiting to be sent.
    pub pending: usize,
    /// Awaiting a server response.
    pub processing: usize,
    /// Failed and scheduled for retry.
    pub failed: usize,
    /// Retries exhausted, awaiting user action.
    pub parked: usize,
}

struct QueueState {
    /// Records in `seq` order.
    entries: VecDeque<MutationRecord>,
    next_seq: u64,
    journal: Option<QueueJournal>,
}

impl QueueState {
    fn position(&self, id: MutationId) -> CoreResult<usize> {
        self.entries
            .iter()
            .position(|r| r.id == id)
            .ok_or(CoreError::UnknownMutation(id))
    }

    fn persist(&mut self, record: &MutationRecord) -> CoreResult<()> {
        if let Some(journal) = &mut self.journal {
            journal.upsert(record)?;
        }
        Ok(())
    }

    /// Drops the record at `pos`, journaling the removal first.
    fn remove_at(&mut self, pos: usize) -> CoreResult<MutationRecord> {
        let id = self.entries[pos].id;
        if let Some(journal) = &mut self.journal {
            journal.remove(id)?;
        }
        let record = self
            .entries
            .remove(pos)
            .ok_or(CoreError::UnknownMutation(id))?;
        self.maybe_compact();
        Ok(record)
    }

    fn maybe_compact(&mut self) {
        let live = self.entries.len();
        let Some(journal) = &mut self.journal else {
            return;
        };
        if journal.needs_compaction(live) {
            let records: Vec<MutationRecord> = self.entries.iter().cloned().collect();
            if let Err(e) = journal.compact(&records) {
                warn!(error = %e, "journal compaction failed");
            }
        }
    }

    /// Applies a status change to one record after checking `allowed`.
    fn transition(
        &mut self,
        id: MutationId,
        to: &'static str,
        allowed: impl Fn(&MutationRecord) -> bool,
        apply: impl FnOnce(&mut MutationRecord),
    ) -> CoreResult<MutationRecord> {
        let pos = self.position(id)?;
        let current = &self.entries[pos];
        if !allowed(current) {
            return Err(CoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }
        let mut updated = current.clone();
        apply(&mut updated);
        self.persist(&updated)?;
        self.entries[pos] = updated.clone();
        Ok(updated)
    }

    /// Returns true if `record` may be sent now.
    ///
    /// A record is eligible when it is Pending and no older active record for
    /// the same post is still queued, which keeps per-post FIFO order and at
    /// most one request in flight per post.
    fn is_eligible(&self, record: &MutationRecord) -> bool {
        record.status == MutationStatus::Pending
            && record.is_active()
            && !self.entries.iter().any(|other| {
                other.id != record.id
                    && other.target_id == record.target_id
                    && other.is_active()
                    && (other.seq < record.seq || other.status == MutationStatus::Processing)
            })
    }
}

/// The durable, ordered record of local writes.
///
/// Enqueue applies the write's optimistic effect to the [`EntityStore`]
/// before returning. The queue then tracks the write until the server
/// confirms it, rejects it, or the user discards it.
///
/// # Locking
///
/// Operations that touch the store take the queue lock first and the store
/// lock second. Nothing takes them in the other order.
pub struct MutationQueue {
    store: Arc<EntityStore>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl MutationQueue {
    /// Creates an in-memory queue with the default configuration.
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    /// Creates an in-memory queue.
    pub fn with_config(store: Arc<EntityStore>, config: QueueConfig) -> Self {
        Self::build(store, config, None, Vec::new())
    }

    /// Opens a journaled queue and restores its records.
    ///
    /// Records that were Processing when the journal was last written are
    /// restored as Failed: their outcome is unknown, and the server
    /// de-duplicates the resend by mutation id. Optimistic effects are not
    /// applied here; call [`reapply_all`](Self::reapply_all) once the store
    /// is loaded.
    ///
    /// # Errors
    ///
    /// Returns a journal error if the backend cannot be read or was written
    /// by an incompatible version.
    pub fn open(
        store: Arc<EntityStore>,
        config: QueueConfig,
        backend: Box<dyn JournalBackend>,
    ) -> CoreResult<Self> {
        let (mut journal, mut records) = QueueJournal::open(backend)?;
        for record in records.iter_mut() {
            if record.status == MutationStatus::Processing {
                record.status = MutationStatus::Failed;
                record.last_error = Some("interrupted".to_string());
                journal.upsert(record)?;
            }
        }
        info!(records = records.len(), "mutation queue restored");
        Ok(Self::build(store, config, Some(journal), records))
    }

    fn build(
        store: Arc<EntityStore>,
        config: QueueConfig,
        journal: Option<QueueJournal>,
        records: Vec<MutationRecord>,
    ) -> Self {
        let next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(1);
        Self {
            store,
            config,
            state: Mutex::new(QueueState {
                entries: records.into(),
                next_seq,
                journal,
            }),
            changed: Notify::new(),
        }
    }

    /// Returns the entity store this queue writes to.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the notifier signalled whenever a record may have become
    /// eligible for sending.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Queues a write and applies its optimistic effect.
    ///
    /// # Errors
    ///
    /// - `DuplicateInFlight` if an unresolved record for the same logical
    ///   operation exists (parked records count as unresolved)
    /// - `QueueOverflow` if the queue is full of unparked records
    /// - `UnknownEntity` if the target post is not loaded
    /// - `Protocol` if the payload does not match `kind`
    pub fn enqueue(
        &self,
        kind: MutationKind,
        target_id: PostId,
        payload: MutationPayload,
    ) -> CoreResult<MutationId> {
        let mut record = MutationRecord::new(0, kind, target_id, payload)?;
        let mut state = self.state.lock();

        if let Some(existing) = state.entries.iter().find(|r| r.same_operation(&record)) {
            return Err(CoreError::DuplicateInFlight {
                kind,
                target_id: record.target_id,
                existing: existing.id,
            });
        }
        if state.entries.len() >= self.config.max_records {
            self.prune_parked(&mut state)?;
        }

        record.seq = state.next_seq;
        let applied = self.store.apply_optimistic(&record)?;
        record.undo = Some(applied.undo.clone());
        if let Err(e) = state.persist(&record) {
            self.store.rollback(&record.target_id, &applied.undo);
            return Err(e);
        }
        state.next_seq += 1;

        let id = record.id;
        debug!(mutation = %id, %kind, post = %record.target_id, seq = record.seq, "mutation enqueued");
        state.entries.push_back(record);
        drop(state);
        self.changed.notify_one();
        Ok(id)
    }

    /// Makes room by dropping the oldest parked records.
    fn prune_parked(&self, state: &mut QueueState) -> CoreResult<()> {
        while state.entries.len() >= self.config.max_records {
            let Some(pos) = state.entries.iter().position(|r| r.parked) else {
                return Err(CoreError::QueueOverflow {
                    capacity: self.config.max_records,
                });
            };
            let pruned = state.remove_at(pos)?;
            warn!(mutation = %pruned.id, kind = %pruned.kind, "pruned parked mutation on overflow");
        }
        Ok(())
    }

    /// Marks a Pending record as sent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the record is eligible for sending.
    pub fn mark_processing(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        if !state.is_eligible(&state.entries[pos]) {
            return Err(CoreError::InvalidTransition {
                id,
                from: state.entries[pos].status,
                to: "processing",
            });
        }
        state.transition(id, "processing", |_| true, |r| {
            r.status = MutationStatus::Processing;
        })
    }

    /// Records a failed attempt and increments `retry_count`.
    ///
    /// The optimistic effect stays applied.
    pub fn mark_failed(
        &self,
        id: MutationId,
        error: impl Into<String>,
    ) -> CoreResult<MutationRecord> {
        let error = error.into();
        let record = self.state.lock().transition(
            id,
            "failed",
            |r| r.status == MutationStatus::Processing,
            |r| {
                r.status = MutationStatus::Failed;
                r.retry_count += 1;
                r.last_error = Some(error);
            },
        )?;
        debug!(mutation = %id, retries = record.retry_count, "mutation attempt failed");
        Ok(record)
    }

    /// Returns a Failed record to Pending for its next attempt.
    pub fn requeue(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let record = self.state.lock().transition(
            id,
            "pending",
            |r| r.status == MutationStatus::Failed && r.is_active(),
            |r| r.status = MutationStatus::Pending,
        )?;
        self.changed.notify_one();
        Ok(record)
    }

    /// Parks a Failed record whose retries are exhausted.
    ///
    /// The optimistic effect is reverted; the record stays queued as Failed
    /// until the user retries or discards it.
    pub fn park(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let mut undo = None;
        let record = state.transition(
            id,
            "parked",
            |r| r.status == MutationStatus::Failed && r.is_active(),
            |r| {
                undo = r.undo.take();
                r.parked = true;
            },
        )?;
        if let Some(undo) = &undo {
            self.store.rollback(&record.target_id, undo);
        }
        drop(state);
        warn!(mutation = %id, kind = %record.kind, retries = record.retry_count, "mutation parked");
        self.changed.notify_one();
        Ok(record)
    }

    /// Removes a confirmed record. The store keeps its current state.
    pub fn remove(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        let record = state.remove_at(pos)?;
        drop(state);
        self.changed.notify_one();
        Ok(record)
    }

    /// Removes a permanently rejected record and reverts its optimistic
    /// effect.
    pub fn reject(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        let record = state.remove_at(pos)?;
        if let Some(undo) = &record.undo {
            self.store.rollback(&record.target_id, undo);
        }
        drop(state);
        self.changed.notify_one();
        Ok(record)
    }

    /// Re-attempts a parked record.
    ///
    /// The record moves to the back of the queue with a fresh retry budget
    /// and its optimistic effect is applied again. If the target post is not
    /// loaded, the effect is applied later by [`reapply_all`](Self::reapply_all).
    pub fn retry(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        let current = &state.entries[pos];
        if !current.parked {
            return Err(CoreError::InvalidTransition {
                id,
                from: current.status,
                to: "retry",
            });
        }

        let mut updated = current.clone();
        updated.seq = state.next_seq;
        updated.status = MutationStatus::Pending;
        updated.parked = false;
        updated.retry_count = 0;
        updated.last_error = None;
        updated.undo = match self.store.apply_optimistic(&updated) {
            Ok(applied) => Some(applied.undo),
            Err(CoreError::UnknownEntity(post)) => {
                debug!(mutation = %id, %post, "retried mutation targets an unloaded post");
                None
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = state.persist(&updated) {
            if let Some(undo) = &updated.undo {
                self.store.rollback(&updated.target_id, undo);
            }
            return Err(e);
        }

        state.next_seq += 1;
        state.entries.remove(pos);
        state.entries.push_back(updated.clone());
        drop(state);
        info!(mutation = %id, "parked mutation retried");
        self.changed.notify_one();
        Ok(updated)
    }

    /// Drops a record that is not in flight, reverting any effect still
    /// applied.
    pub fn discard(&self, id: MutationId) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        if state.entries[pos].status == MutationStatus::Processing {
            return Err(CoreError::InvalidTransition {
                id,
                from: MutationStatus::Processing,
                to: "discarded",
            });
        }
        let record = state.remove_at(pos)?;
        if let Some(undo) = &record.undo {
            self.store.rollback(&record.target_id, undo);
        }
        drop(state);
        info!(mutation = %id, kind = %record.kind, "mutation discarded");
        self.changed.notify_one();
        Ok(record)
    }

    /// Points every record targeting `old` at `new`.
    ///
    /// Used when a post created under a temporary id is confirmed.
    pub fn retarget(&self, old: &PostId, new: &PostId) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let ids: Vec<MutationId> = state
            .entries
            .iter()
            .filter(|r| &r.target_id == old)
            .map(|r| r.id)
            .collect();
        for id in &ids {
            state.transition(*id, "retarget", |_| true, |r| r.target_id = new.clone())?;
        }
        if !ids.is_empty() {
            debug!(from = %old, to = %new, records = ids.len(), "mutations retargeted");
        }
        Ok(ids.len())
    }

    /// Moves every Processing record to Failed without counting an attempt.
    ///
    /// Used on logout, when in-flight requests are abandoned.
    pub fn fail_in_flight(&self, reason: &str) -> CoreResult<Vec<MutationId>> {
        let mut state = self.state.lock();
        let ids: Vec<MutationId> = state
            .entries
            .iter()
            .filter(|r| r.status == MutationStatus::Processing)
            .map(|r| r.id)
            .collect();
        for id in &ids {
            state.transition(*id, "failed", |_| true, |r| {
                r.status = MutationStatus::Failed;
                r.last_error = Some(reason.to_string());
            })?;
        }
        Ok(ids)
    }

    /// Returns every unparked Failed record to Pending.
    pub fn requeue_failed(&self) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let ids: Vec<MutationId> = state
            .entries
            .iter()
            .filter(|r| r.status == MutationStatus::Failed && r.is_active())
            .map(|r| r.id)
            .collect();
        for id in &ids {
            state.transition(*id, "pending", |_| true, |r| r.status = MutationStatus::Pending)?;
        }
        drop(state);
        if !ids.is_empty() {
            self.changed.notify_one();
        }
        Ok(ids.len())
    }

    /// Re-applies the optimistic effect of every active record.
    ///
    /// Called after the store was loaded from the server, which replaces
    /// optimistic values. Returns the number of records visited.
    pub fn reapply_all(&self) -> CoreResult<usize> {
        let mut state = self.state.lock();
        self.reapply_locked(&mut state, |_| true)
    }

    /// Re-applies the optimistic effect of the active records for one post.
    pub fn reapply_target(&self, target: &PostId) -> CoreResult<usize> {
        let mut state = self.state.lock();
        self.reapply_locked(&mut state, |r| &r.target_id == target)
    }

    /// Merges re-fetched posts into the store and re-applies the optimistic
    /// effect of every active record on top of them.
    ///
    /// Both steps happen under the queue lock, so no enqueue observes the
    /// store between them.
    pub fn rebase(&self, posts: Vec<Post>) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let merged = self.store.refresh(posts);
        self.reapply_locked(&mut state, |_| true)?;
        Ok(merged)
    }

    /// Applies the server's state for a confirmed record and removes it.
    ///
    /// Remaining active records for the same post get their optimistic
    /// effect re-applied on top of the confirmed values. When the server
    /// assigned a new id to a created post, the remaining records follow it.
    pub fn confirm(&self, id: MutationId, server_state: &ServerState) -> CoreResult<MutationRecord> {
        let mut state = self.state.lock();
        let pos = state.position(id)?;
        let target = state.entries[pos].target_id.clone();

        self.store.apply_confirmed(&target, server_state);
        let record = state.remove_at(pos)?;

        let current_target = match server_state {
            ServerState::Post { post } if post.id != target => {
                let followers: Vec<MutationId> = state
                    .entries
                    .iter()
                    .filter(|r| r.target_id == target)
                    .map(|r| r.id)
                    .collect();
                for follower in followers {
                    state.transition(follower, "retarget", |_| true, |r| {
                        r.target_id = post.id.clone();
                    })?;
                }
                post.id.clone()
            }
            _ => target,
        };
        self.reapply_locked(&mut state, |r| r.target_id == current_target)?;
        drop(state);

        debug!(mutation = %id, kind = %record.kind, post = %current_target, "mutation confirmed");
        self.changed.notify_one();
        Ok(record)
    }

    fn reapply_locked(
        &self,
        state: &mut QueueState,
        filter: impl Fn(&MutationRecord) -> bool,
    ) -> CoreResult<usize> {
        let ids: Vec<MutationId> = state
            .entries
            .iter()
            .filter(|r| r.is_active() && filter(r))
            .map(|r| r.id)
            .collect();

        for id in &ids {
            let pos = state.position(*id)?;
            let current = &state.entries[pos];
            let undo = match self.store.apply_optimistic(current) {
                // An effect that is still in place keeps its original
                // reversal.
                Ok(applied) => match (applied.undo, &current.undo) {
                    (Undo::Noop, Some(old)) => Some(old.clone()),
                    (undo, _) => Some(undo),
                },
                Err(CoreError::UnknownEntity(_)) => current.undo.clone(),
                Err(e) => return Err(e),
            };
            if undo != current.undo {
                state.transition(*id, "reapply", |_| true, |r| r.undo = undo)?;
            }
        }
        Ok(ids.len())
    }

    /// Returns true if an active record of `family` targets `target`.
    pub fn has_active(&self, target: &PostId, family: EventFamily) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|r| r.is_active() && &r.target_id == target && r.kind.family() == Some(family))
    }

    /// Returns a lazy cursor over eligible Pending records, oldest first.
    pub fn pending_batch(&self) -> PendingBatch<'_> {
        PendingBatch {
            queue: self,
            cursor: 0,
        }
    }

    /// Returns a copy of one record.
    pub fn get(&self, id: MutationId) -> Option<MutationRecord> {
        self.state.lock().entries.iter().find(|r| r.id == id).cloned()
    }

    /// Returns copies of all records in enqueue order.
    pub fn records(&self) -> Vec<MutationRecord> {
        self.state.lock().entries.iter().cloned().collect()
    }

    /// Returns the number of queued records.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns counts of records by state.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            total: state.entries.len(),
            ..QueueStats::default()
        };
        for record in &state.entries {
            if record.parked {
                stats.parked += 1;
                continue;
            }
            match record.status {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::Processing => stats.processing += 1,
                MutationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Rewrites the journal to hold only the live records.
    pub fn compact(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        let records: Vec<MutationRecord> = state.entries.iter().cloned().collect();
        if let Some(journal) = &mut state.journal {
            journal.compact(&records)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A lazy, restartable cursor over sendable records.
///
/// Each step looks at the queue as it is at that moment, so records enqueued
/// or unblocked while iterating are picked up, and records already sent are
/// skipped. Records come out in enqueue order; a record is yielded only when
/// it is the oldest active record for its post.
pub struct PendingBatch<'a> {
    queue: &'a MutationQueue,
    cursor: u64,
}

impl PendingBatch<'_> {
    /// Starts again from the oldest record.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for PendingBatch<'_> {
    type Item = MutationRecord;

    fn next(&mut self) -> Option<MutationRecord> {
        let state = self.queue.state.lock();
        let record = state
            .entries
            .iter()
            .filter(|r| r.seq >= self.cursor)
            .find(|r| state.is_eligible(r))?;
        self.cursor = record.seq + 1;
        Some(record.clone())
    }
}

//! # Verdant Core
//!
//! Local state of the Verdant client sync core.
//!
//! This crate provides:
//! - [`EntityStore`]: the single source of truth for posts, comments and like
//!   state shown to the UI
//! - [`MutationQueue`]: the durable, ordered record of local writes awaiting
//!   server confirmation, applying each write optimistically on enqueue
//! - [`QueueJournal`]: append-only persistence of the queue over a
//!   [`JournalBackend`] (in memory or file)
//!
//! ## Key Invariants
//!
//! - Every enqueue applies its optimistic effect before returning
//! - At most one unresolved record per logical operation
//! - Per-post FIFO: a record is dispatchable only when no older active record
//!   for the same post is unresolved
//! - Repeated deliveries of one push event change the store at most once
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use verdant_core::{EntityStore, MutationQueue};
//! use verdant_protocol::{MutationKind, MutationPayload, Post, PostId, Timestamp, UserId};
//!
//! let store = Arc::new(EntityStore::new());
//! store.load(vec![Post::new(PostId::new("42"), UserId::new("u1"), "rust on wheat?", Timestamp::now())]);
//!
//! let queue = MutationQueue::new(Arc::clone(&store));
//! queue.enqueue(MutationKind::Like, PostId::new("42"), MutationPayload::Like).unwrap();
//!
//! let post = store.get(&PostId::new("42")).unwrap();
//! assert_eq!(post.like_count, 1);
//! assert!(post.liked_by_me);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod journal;
mod queue;
mod store;

pub use error::{CoreError, CoreResult};
pub use journal::{
    FileJournalBackend, JournalBackend, JournalError, JournalRecord, JournalResult,
    MemoryJournalBackend, QueueJournal, JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use queue::{MutationQueue, PendingBatch, QueueConfig, QueueStats};
pub use store::{EntityStore, OptimisticApply, RemoteApply};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! CLI command implementations.

pub mod compact;
pub mod discard;
pub mod inspect;
pub mod retry;

use std::path::Path;
use std::sync::Arc;
use verdant_core::{EntityStore, FileJournalBackend, MutationQueue, QueueConfig};
use verdant_protocol::MutationId;

/// Opens the queue stored in a journal file.
///
/// The store is left empty, so optimistic effects are not replayed; the app
/// recomputes them at its next login.
pub(crate) fn open_queue(path: &Path) -> Result<MutationQueue, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {:?}", path).into());
    }
    let backend = FileJournalBackend::open(path)?;
    let queue = MutationQueue::open(
        Arc::new(EntityStore::new()),
        QueueConfig::default(),
        Box::new(backend),
    )?;
    Ok(queue)
}

pub(crate) fn parse_id(id: &str) -> Result<MutationId, Box<dyn std::error::Error>> {
    MutationId::parse(id).ok_or_else(|| format!("Invalid mutation id: {id}").into())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use verdant_core::{EntityStore, FileJournalBackend, MutationQueue, QueueConfig};
    use verdant_protocol::{MutationId, MutationKind, MutationPayload, Post, PostId, Timestamp, UserId};

    fn post(id: &str) -> Post {
        Post::new(PostId::new(id), UserId::new("author"), "blight", Timestamp::from_millis(1))
    }

    /// Writes a journal holding one pending like and one parked like.
    pub fn journal() -> (TempDir, PathBuf, MutationId, MutationId) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.vmq");
        let backend = FileJournalBackend::open(&path).unwrap();
        let store = Arc::new(EntityStore::new());
        store.load(vec![post("p1"), post("p2")]);
        let queue = MutationQueue::open(
            store,
            QueueConfig::default(),
            Box::new(backend),
        )
        .unwrap();

        let pending = queue
            .enqueue(MutationKind::Like, PostId::new("p1"), MutationPayload::Like)
            .unwrap();
        let parked = queue
            .enqueue(MutationKind::Like, PostId::new("p2"), MutationPayload::Like)
            .unwrap();
        queue.mark_processing(parked).unwrap();
        queue.mark_failed(parked, "HTTP 503").unwrap();
        queue.park(parked).unwrap();
        (dir, path, pending, parked)
    }
}

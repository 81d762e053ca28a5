//! Append-only persistence for the mutation queue.
//!
//! Every queue change is written as a framed record before the queue call
//! returns. Replaying the journal on open rebuilds the queue as it was at the
//! last write, so pending mutations survive a restart.

mod backend;
mod error;
mod file;
mod memory;
mod record;

pub use backend::JournalBackend;
pub use error::{JournalError, JournalResult};
pub use file::FileJournalBackend;
pub use memory::MemoryJournalBackend;
pub use record::{JournalRecord, JOURNAL_MAGIC, JOURNAL_VERSION};

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use verdant_protocol::{MutationId, MutationRecord};

/// Minimum number of journal records before compaction is considered.
const COMPACT_MIN_RECORDS: usize = 64;

/// The queue journal over a byte backend.
pub struct QueueJournal {
    backend: Box<dyn JournalBackend>,
    /// Records in the journal, live or superseded.
    written: usize,
}

impl QueueJournal {
    /// Opens a journal and replays it.
    ///
    /// Returns the journal and the live records in enqueue order. A torn or
    /// corrupt tail (an interrupted append) is cut off with a warning; the
    /// records before it are kept.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` for a journal written by an incompatible
    /// build, or an I/O error from the backend.
    pub fn open(backend: Box<dyn JournalBackend>) -> JournalResult<(Self, Vec<MutationRecord>)> {
        let mut backend = backend;
        let bytes = backend.read_all()?;

        let mut by_seq: BTreeMap<u64, MutationRecord> = BTreeMap::new();
        let mut seq_of: HashMap<MutationId, u64> = HashMap::new();
        let mut written = 0;
        let mut offset = 0;

        loop {
            match JournalRecord::decode_at(&bytes, offset) {
                Ok(Some((record, next))) => {
                    written += 1;
                    offset = next;
                    match record {
                        JournalRecord::Upsert(record) => {
                            if let Some(old_seq) = seq_of.insert(record.id, record.seq) {
                                by_seq.remove(&old_seq);
                            }
                            by_seq.insert(record.seq, record);
                        }
                        JournalRecord::Remove(id) => {
                            if let Some(seq) = seq_of.remove(&id) {
                                by_seq.remove(&seq);
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(JournalError::Corrupted { offset: at, message }) => {
                    warn!(offset = at, %message, "truncating torn journal tail");
                    backend.truncate(at)?;
                    backend.sync()?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let records: Vec<MutationRecord> = by_seq.into_values().collect();
        debug!(
            journal_records = written,
            live = records.len(),
            "mutation journal replayed"
        );
        Ok((Self { backend, written }, records))
    }

    /// Writes the current state of a record.
    pub fn upsert(&mut self, record: &MutationRecord) -> JournalResult<()> {
        self.write(&JournalRecord::Upsert(record.clone()))
    }

    /// Records that a mutation left the queue.
    pub fn remove(&mut self, id: MutationId) -> JournalResult<()> {
        self.write(&JournalRecord::Remove(id))
    }

    fn write(&mut self, record: &JournalRecord) -> JournalResult<()> {
        let bytes = record.encode()?;
        self.backend.append(&bytes)?;
        self.backend.sync()?;
        self.written += 1;
        Ok(())
    }

    /// Returns true when superseded records dominate the journal.
    pub fn needs_compaction(&self, live: usize) -> bool {
        self.written >= COMPACT_MIN_RECORDS && self.written > live.saturating_mul(4)
    }

    /// Rewrites the journal to hold only `live`.
    ///
    /// The backend swaps the contents atomically, so a failure at any point
    /// leaves the previous journal in place.
    pub fn compact(&mut self, live: &[MutationRecord]) -> JournalResult<()> {
        let mut bytes = Vec::new();
        for record in live {
            bytes.extend(JournalRecord::Upsert(record.clone()).encode()?);
        }
        let before = self.backend.size()?;
        self.backend.replace(&bytes)?;
        self.written = live.len();
        debug!(before, after = bytes.len(), live = live.len(), "mutation journal compacted");
        Ok(())
    }

    /// Returns the number of records in the journal, live or superseded.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> JournalResult<u64> {
        self.backend.size()
    }
}

impl std::fmt::Debug for QueueJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueJournal")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_protocol::{MutationKind, MutationPayload, MutationStatus, PostId};

    fn like(seq: u64, post: &str) -> MutationRecord {
        MutationRecord::new(seq, MutationKind::Like, PostId::new(post), MutationPayload::Like).unwrap()
    }

    #[test]
    fn replay_applies_upserts_and_removes() {
        let backend = MemoryJournalBackend::new();
        let (mut journal, records) = QueueJournal::open(Box::new(backend.clone())).unwrap();
        assert!(records.is_empty());

        let a = like(1, "a");
        let mut b = like(2, "b");
        let c = like(3, "c");
        journal.upsert(&a).unwrap();
        journal.upsert(&b).unwrap();
        journal.upsert(&c).unwrap();
        b.status = MutationStatus::Processing;
        journal.upsert(&b).unwrap();
        journal.remove(a.id).unwrap();
        drop(journal);

        let (journal, records) = QueueJournal::open(Box::new(backend)).unwrap();
        assert_eq!(journal.written(), 5);
        assert_eq!(records, vec![b, c]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = MemoryJournalBackend::new();
        let (mut journal, _) = QueueJournal::open(Box::new(backend.clone())).unwrap();
        let a = like(1, "a");
        journal.upsert(&a).unwrap();
        let good_len = backend.data().len();
        journal.upsert(&like(2, "b")).unwrap();
        drop(journal);

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 4);
        let torn = MemoryJournalBackend::with_data(bytes);

        let (_, records) = QueueJournal::open(Box::new(torn.clone())).unwrap();
        assert_eq!(records, vec![a]);
        assert_eq!(torn.data().len(), good_len);
    }

    #[test]
    fn compaction_keeps_live_records() {
        let backend = MemoryJournalBackend::new();
        let (mut journal, _) = QueueJournal::open(Box::new(backend.clone())).unwrap();
        let keep = like(1, "keep");
        journal.upsert(&keep).unwrap();
        for seq in 2..100 {
            let r = like(seq, "churn");
            journal.upsert(&r).unwrap();
            journal.remove(r.id).unwrap();
        }
        assert!(journal.needs_compaction(1));

        let before = backend.data().len();
        journal.compact(std::slice::from_ref(&keep)).unwrap();
        assert!(backend.data().len() < before);
        assert!(!journal.needs_compaction(1));
        drop(journal);

        let (_, records) = QueueJournal::open(Box::new(backend)).unwrap();
        assert_eq!(records, vec![keep]);
    }

    /// Memory backend whose `replace` always fails.
    struct NoReplace(MemoryJournalBackend);

    impl JournalBackend for NoReplace {
        fn read_all(&self) -> JournalResult<Vec<u8>> {
            self.0.read_all()
        }

        fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
            self.0.append(data)
        }

        fn sync(&mut self) -> JournalResult<()> {
            self.0.sync()
        }

        fn truncate(&mut self, len: u64) -> JournalResult<()> {
            self.0.truncate(len)
        }

        fn replace(&mut self, _data: &[u8]) -> JournalResult<()> {
            Err(std::io::Error::other("disk full").into())
        }

        fn size(&self) -> JournalResult<u64> {
            self.0.size()
        }
    }

    #[test]
    fn failed_compaction_keeps_records() {
        let backend = MemoryJournalBackend::new();
        let (mut journal, _) =
            QueueJournal::open(Box::new(NoReplace(backend.clone()))).unwrap();
        let keep = like(1, "keep");
        journal.upsert(&keep).unwrap();
        let before = backend.data();

        assert!(journal.compact(std::slice::from_ref(&keep)).is_err());
        assert_eq!(backend.data(), before);

        // Appends after the failure still land on the intact journal.
        let next = like(2, "next");
        journal.upsert(&next).unwrap();
        drop(journal);

        let (_, records) = QueueJournal::open(Box::new(backend)).unwrap();
        assert_eq!(records, vec![keep, next]);
    }

    #[test]
    fn corrupt_last_record_is_cut_off() {
        let backend = MemoryJournalBackend::new();
        let (mut journal, _) = QueueJournal::open(Box::new(backend.clone())).unwrap();
        let a = like(1, "a");
        journal.upsert(&a).unwrap();
        let good_len = backend.data().len();
        journal.upsert(&like(2, "b")).unwrap();
        drop(journal);

        let mut bytes = backend.data();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        let corrupt = MemoryJournalBackend::with_data(bytes);

        let (_, records) = QueueJournal::open(Box::new(corrupt.clone())).unwrap();
        assert_eq!(records, vec![a]);
        assert_eq!(corrupt.data().len(), good_len);
    }

    #[test]
    fn unsupported_version_fails_open() {
        let mut bytes = JournalRecord::Upsert(like(1, "a")).encode().unwrap();
        bytes[4] = 7;
        let backend = MemoryJournalBackend::with_data(bytes);
        assert!(matches!(
            QueueJournal::open(Box::new(backend)),
            Err(JournalError::UnsupportedVersion { found: 7, .. })
        ));
    }
}

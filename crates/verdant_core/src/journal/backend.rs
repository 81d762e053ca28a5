//! Journal backend trait definition.

use super::error::JournalResult;

/// A byte store holding the mutation journal.
///
/// Backends are opaque: they know nothing about record framing. The journal
/// owns all format interpretation.
///
/// # Invariants
///
/// - `append` returns the offset where the data starts
/// - `read_all` returns every byte appended and not truncated
/// - after `sync` returns, appended data survives process termination
/// - `replace` is atomic: afterwards the journal holds either the old bytes
///   or exactly the new ones, never a mix or nothing
pub trait JournalBackend: Send {
    /// Reads the whole journal.
    fn read_all(&self) -> JournalResult<Vec<u8>>;

    /// Appends bytes at the end and returns their offset.
    fn append(&mut self, data: &[u8]) -> JournalResult<u64>;

    /// Makes appended data durable.
    fn sync(&mut self) -> JournalResult<()>;

    /// Cuts the journal to `len` bytes.
    fn truncate(&mut self, len: u64) -> JournalResult<()>;

    /// Replaces the whole journal with `data` and makes it durable.
    ///
    /// On error the previous contents are left in place.
    fn replace(&mut self, data: &[u8]) -> JournalResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> JournalResult<u64>;
}

//! In-memory journal backend.

use super::backend::JournalBackend;
use super::error::JournalResult;
use parking_lot::Mutex;
use std::sync::Arc;

/// A journal backend keeping its bytes in memory.
///
/// Clones share the same buffer, so a test can drop a queue and reopen a new
/// one over the same bytes to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournalBackend {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryJournalBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding existing bytes.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Returns a copy of the stored bytes.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl JournalBackend for MemoryJournalBackend {
    fn read_all(&self) -> JournalResult<Vec<u8>> {
        Ok(self.data.lock().clone())
    }

    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        let mut buf = self.data.lock();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn sync(&mut self) -> JournalResult<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> JournalResult<()> {
        let mut buf = self.data.lock();
        let len = usize::try_from(len).unwrap_or(usize::MAX).min(buf.len());
        buf.truncate(len);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> JournalResult<()> {
        *self.data.lock() = data.to_vec();
        Ok(())
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let mut a = MemoryJournalBackend::new();
        let b = a.clone();
        assert_eq!(a.append(b"abc").unwrap(), 0);
        assert_eq!(a.append(b"de").unwrap(), 3);
        assert_eq!(b.read_all().unwrap(), b"abcde");

        a.truncate(2).unwrap();
        assert_eq!(b.size().unwrap(), 2);
    }
}

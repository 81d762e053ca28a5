//! File-backed journal.

use super::backend::JournalBackend;
use super::error::{JournalError, JournalResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A journal backend stored in a single file.
///
/// The file is locked exclusively for the lifetime of the backend, so two
/// app instances never replay or append to the same queue.
///
/// # Durability
///
/// - `append` writes through to the OS
/// - `sync` calls `File::sync_all()`
/// - `replace` writes a temporary file next to the journal, syncs it, locks
///   it, then renames it over the journal and syncs the directory
#[derive(Debug)]
pub struct FileJournalBackend {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileJournalBackend {
    /// Opens or creates the journal file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another handle holds the file, or an I/O error.
    pub fn open(path: &Path) -> JournalResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(JournalError::Locked);
        }

        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    /// Returns the path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the temporary file used by `replace`.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_temp(&self, temp_path: &Path, data: &[u8]) -> JournalResult<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        if file.try_lock_exclusive().is_err() {
            return Err(JournalError::Locked);
        }
        Ok(file)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> JournalResult<()> {
        if let Some(parent) = self.path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> JournalResult<()> {
        // NTFS journals metadata; directories cannot be fsynced.
        Ok(())
    }
}

impl JournalBackend for FileJournalBackend {
    fn read_all(&self) -> JournalResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> JournalResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> JournalResult<()> {
        let len = len.min(self.size);
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size = len;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> JournalResult<()> {
        let temp_path = self.temp_path();
        let file = match self.write_temp(&temp_path, data) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        // The old handle now points at the unlinked file; dropping it
        // releases its lock while the new file already holds one.
        self.file = file;
        self.size = data.len() as u64;
        self.sync_directory()
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue").join("mutations.journal");

        {
            let mut backend = FileJournalBackend::open(&path).unwrap();
            backend.append(b"hello ").unwrap();
            backend.append(b"queue").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileJournalBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_all().unwrap(), b"hello queue");
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mutations.journal");
        let mut backend = FileJournalBackend::open(&path).unwrap();
        backend.append(b"0123456789").unwrap();
        backend.truncate(4).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"0123");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4);
    }

    #[test]
    fn replace_swaps_contents_and_keeps_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mutations.journal");
        let mut backend = FileJournalBackend::open(&path).unwrap();
        backend.append(b"old contents").unwrap();

        backend.replace(b"new").unwrap();
        assert_eq!(backend.size().unwrap(), 3);
        assert_eq!(backend.read_all().unwrap(), b"new");
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!backend.temp_path().exists());

        backend.append(b"er").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"newer");
        assert!(matches!(
            FileJournalBackend::open(&path),
            Err(JournalError::Locked)
        ));
    }

    #[test]
    fn failed_replace_keeps_old_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mutations.journal");
        let mut backend = FileJournalBackend::open(&path).unwrap();
        backend.append(b"keep me").unwrap();

        // A directory where the temporary file goes makes the write fail.
        fs::create_dir(backend.temp_path()).unwrap();
        assert!(backend.replace(b"lost").is_err());

        assert_eq!(backend.read_all().unwrap(), b"keep me");
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn lock_prevents_second_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mutations.journal");
        let _first = FileJournalBackend::open(&path).unwrap();
        assert!(matches!(
            FileJournalBackend::open(&path),
            Err(JournalError::Locked)
        ));
    }
}

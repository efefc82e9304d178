//! File-backed storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage over a plain file.
///
/// Backs the tar containers and any other grow-only file the engine
/// keeps. The handle and the tracked length live under a single lock,
/// so the length can never run ahead of bytes actually handed to the
/// OS: an offset returned by `append` is immediately readable, even
/// before a flush.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    len: u64,
}

impl FileBackend {
    /// Opens the file at `path`, creating it when absent. An existing
    /// file is picked up at its current length; nothing is rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner { file, len }),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        // The seek moves the shared cursor, so reads take the write
        // half of the lock too.
        let mut inner = self.inner.write();
        let end = offset.saturating_add(len as u64);
        if end > inner.len {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: inner.len,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        inner.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let inner = self.inner.get_mut();
        let offset = inner.len;
        if data.is_empty() {
            return Ok(offset);
        }

        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        inner.len += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.read().len)
    }

    fn truncate(&mut self, size: u64) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        if size >= inner.len {
            return Ok(());
        }
        inner.file.set_len(size)?;
        inner.len = size;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn open(dir: &TempDir) -> FileBackend {
        FileBackend::open(&dir.path().join("data00000.tar")).unwrap()
    }

    #[test]
    fn appended_blocks_read_back_at_their_offsets() {
        let dir = tempdir().unwrap();
        let mut backend = open(&dir);

        let header = backend.append(&[b'h'; 512]).unwrap();
        let data = backend.append(&[b'd'; 512]).unwrap();
        assert_eq!((header, data), (0, 512));
        assert_eq!(backend.size().unwrap(), 1024);

        assert_eq!(backend.read_at(data, 512).unwrap(), vec![b'd'; 512]);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"hhhh");
    }

    #[test]
    fn reopening_resumes_at_the_existing_length() {
        let dir = tempdir().unwrap();
        {
            let mut backend = open(&dir);
            backend.append(b"carried over").unwrap();
            backend.sync().unwrap();
        }

        let mut backend = open(&dir);
        assert_eq!(backend.size().unwrap(), 12);
        assert_eq!(backend.append(b"!").unwrap(), 12);
        assert_eq!(backend.read_at(0, 13).unwrap(), b"carried over!");
    }

    #[test]
    fn reads_beyond_the_length_are_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = open(&dir);
        backend.append(&[0u8; 10]).unwrap();

        assert!(matches!(
            backend.read_at(8, 4),
            Err(StorageError::ReadPastEnd { size: 10, .. })
        ));
        assert!(backend.read_at(10, 0).unwrap().is_empty());
    }

    #[test]
    fn truncate_discards_the_tail_only() {
        let dir = tempdir().unwrap();
        let mut backend = open(&dir);
        backend.append(&[1u8; 512]).unwrap();
        backend.append(&[2u8; 100]).unwrap();

        backend.truncate(512).unwrap();
        assert_eq!(backend.size().unwrap(), 512);
        assert_eq!(backend.read_at(0, 512).unwrap(), vec![1u8; 512]);
        assert!(backend.read_at(512, 1).is_err());

        // Truncating upward must not grow or zero-fill the file.
        backend.truncate(4096).unwrap();
        assert_eq!(backend.size().unwrap(), 512);

        // Appends after a rewind land at the new end.
        assert_eq!(backend.append(&[3u8; 16]).unwrap(), 512);
        backend.sync().unwrap();
        drop(backend);

        let backend = open(&dir);
        assert_eq!(backend.size().unwrap(), 528);
        assert_eq!(backend.read_at(512, 16).unwrap(), vec![3u8; 16]);
    }
}

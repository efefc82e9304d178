//! Memory-mapped file storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A storage backend that serves reads from a memory-mapped view.
///
/// Appends go through the file handle like [`super::FileBackend`]; reads are
/// served from an `mmap` of the file that is refreshed lazily whenever a
/// read lands beyond the currently mapped length. The file only shrinks
/// through `truncate`, which drops the view first, so an existing mapping
/// stays valid for every offset it covers.
///
/// The mapping is read-only, so readers can run concurrently with appends
/// without tearing: a reader either sees a fully written byte range or
/// triggers a remap that picks up the new length.
#[derive(Debug)]
pub struct MmapBackend {
    path: PathBuf,
    file: RwLock<File>,
    map: RwLock<Option<Mmap>>,
    size: RwLock<u64>,
}

impl MmapBackend {
    /// Opens or creates a memory-mapped backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, created, or mapped.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        let backend = Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            map: RwLock::new(None),
            size: RwLock::new(size),
        };

        if size > 0 {
            backend.remap()?;
        }

        Ok(backend)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-maps the file at its current length.
    ///
    /// A zero-length file cannot be mapped; the view stays `None` until
    /// the first append is flushed through.
    #[allow(unsafe_code)]
    fn remap(&self) -> StorageResult<()> {
        let file = self.file.write();
        let mut map = self.map.write();
        if file.metadata()?.len() == 0 {
            *map = None;
            return Ok(());
        }
        // SAFETY: the mapping is read-only and the underlying file only
        // shrinks through `truncate`, which drops the previous view
        // before calling `set_len`, so the mapped range is never mutated
        // or truncated underneath us.
        let view = unsafe { Mmap::map(&*file)? };
        *map = Some(view);
        Ok(())
    }
}

impl StorageBackend for MmapBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        {
            let map = self.map.read();
            if let Some(view) = map.as_ref() {
                if end as usize <= view.len() {
                    return Ok(view[offset as usize..end as usize].to_vec());
                }
            }
        }

        // The mapped view is stale; refresh it to cover the appended tail.
        self.remap()?;

        let map = self.map.read();
        match map.as_ref() {
            Some(view) if end as usize <= view.len() => {
                Ok(view[offset as usize..end as usize].to_vec())
            }
            _ => Err(StorageError::Corrupted(format!(
                "mapped view of {} is shorter than expected end offset {}",
                self.path.display(),
                end
            ))),
        }
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size += data.len() as u64;

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn truncate(&mut self, size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut current = self.size.write();
        if size >= *current {
            return Ok(());
        }

        // Drop the view before shrinking so no mapping outlives the
        // bytes it covers; the next read remaps at the new length.
        *self.map.write() = None;
        file.set_len(size)?;
        *current = size;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        {
            let file = self.file.write();
            file.sync_all()?;
        }
        Ok(())
    }
}

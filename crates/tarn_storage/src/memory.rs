//! In-memory storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// Storage over a plain byte vector.
///
/// Used by tests that exercise container and record logic without a
/// store directory. [`with_data`](InMemoryBackend::with_data) loads a
/// prebuilt image the way a reopen would find it on disk, which makes
/// it easy to stage recovery scenarios such as a torn tail.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend over a prebuilt image.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let data = self.data.get_mut();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, size: u64) -> StorageResult<()> {
        let data = self.data.get_mut();
        if (size as usize) < data.len() {
            data.truncate(size as usize);
        }
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_grow_the_image() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(&[b'a'; 512]).unwrap(), 0);
        assert_eq!(backend.append(&[b'b'; 512]).unwrap(), 512);
        assert_eq!(backend.size().unwrap(), 1024);
        assert_eq!(backend.read_at(512, 512).unwrap(), vec![b'b'; 512]);
    }

    #[test]
    fn preloaded_image_reads_like_a_reopened_file() {
        let mut backend = InMemoryBackend::with_data(b"existing image".to_vec());
        assert_eq!(backend.size().unwrap(), 14);
        assert_eq!(backend.read_at(9, 5).unwrap(), b"image");
        assert_eq!(backend.append(b"+tail").unwrap(), 14);
        assert_eq!(backend.data(), b"existing image+tail");
    }

    #[test]
    fn truncate_rewinds_a_torn_tail() {
        let mut backend = InMemoryBackend::with_data(vec![7u8; 700]);

        backend.truncate(512).unwrap();
        assert_eq!(backend.size().unwrap(), 512);
        assert!(backend.read_at(512, 1).is_err());

        backend.truncate(4096).unwrap();
        assert_eq!(backend.size().unwrap(), 512);
    }

    #[test]
    fn out_of_range_reads_are_rejected() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"short").unwrap();

        assert!(matches!(
            backend.read_at(10, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }
}

//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for Tarn.
///
/// Storage backends are **opaque byte stores**. They provide simple operations
/// for reading, appending, and flushing data. Tarn owns all file format
/// interpretation - backends do not understand tar entries, segments, or
/// journal lines.
///
/// Backends are append-only in steady state: once written, a byte range
/// never changes, which is what allows concurrent readers over a file
/// that is still growing. The one exception is
/// [`truncate`](StorageBackend::truncate), which rewinds past a torn
/// tail during crash recovery before any new data is appended.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` ensures all appended data is durable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - Buffered persistent storage
/// - [`super::MmapBackend`] - Persistent storage with memory-mapped reads
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The offset is beyond the current size
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes all pending writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the storage to `size` bytes.
    ///
    /// Used only to drop a torn tail left behind by a crash mid-append;
    /// data below `size` is never rewritten. Truncating to the current
    /// size or beyond is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn truncate(&mut self, size: u64) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush` - after this returns
    /// successfully, all previously appended data is guaranteed to survive
    /// process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;
}

//! # Tarn Storage
//!
//! Storage backend trait and implementations for the Tarn segment store.
//!
//! This crate provides the lowest-level storage abstraction for Tarn.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple append-only byte stores (read, append, flush,
//!   sync); `truncate` exists only to rewind a torn tail after a crash
//! - No knowledge of Tarn file formats, tar containers, or journals
//! - Must be `Send + Sync` for concurrent access
//! - Tarn core owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - Buffered persistent storage using OS file APIs
//! - [`MmapBackend`] - Persistent storage with memory-mapped reads
//!
//! ## Example
//!
//! ```rust
//! use tarn_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod mmap;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use mmap::MmapBackend;

//! Error types for Tarn core.

use crate::types::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tarn core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tarn_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment referenced by a record could not be located in any
    /// container file. This indicates a corrupted or dangling reference
    /// and is never retried.
    #[error("segment not found: {id}")]
    SegmentNotFound {
        /// The missing segment identifier.
        id: SegmentId,
    },

    /// A segment or record is corrupted or invalid.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A record identifier could not be parsed.
    #[error("invalid record id: {value}")]
    InvalidRecordId {
        /// The unparseable text.
        value: String,
    },

    /// The commit hook rejected the change. No durable write occurred.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Reason for the rejection.
        message: String,
    },

    /// A merge attempt gave up without publishing. Shared state is
    /// untouched; the branch keeps its local changes.
    #[error("merge aborted: {message}")]
    MergeAborted {
        /// Reason the merge was abandoned.
        message: String,
    },

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The store has been closed.
    #[error("store is closed")]
    StoreClosed,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates a commit failure error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates a merge aborted error.
    pub fn merge_aborted(message: impl Into<String>) -> Self {
        Self::MergeAborted {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

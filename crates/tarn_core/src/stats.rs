//! Store statistics and telemetry.
//!
//! All counters are atomic and can be read while operations are in
//! progress. Tests use them to assert properties like "rebase onto an
//! unchanged head writes nothing".

use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics and metrics.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Total number of segments appended to tar files.
    segments_written: AtomicU64,
    /// Total number of segments loaded from tar files.
    segments_read: AtomicU64,
    /// Total number of segment reads served from the cache.
    cache_hits: AtomicU64,
    /// Total number of node records written.
    nodes_written: AtomicU64,
    /// Total number of journal lines appended.
    journal_writes: AtomicU64,
    /// Total number of background flush cycles that failed.
    flush_failures: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_segment_write(&self) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_read(&self) {
        self.segments_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_node_write(&self) {
        self.nodes_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_journal_write(&self) {
        self.journal_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of segments appended to tar files.
    pub fn segments_written(&self) -> u64 {
        self.segments_written.load(Ordering::Relaxed)
    }

    /// Returns the total number of segments loaded from tar files.
    pub fn segments_read(&self) -> u64 {
        self.segments_read.load(Ordering::Relaxed)
    }

    /// Returns the total number of cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the total number of node records written.
    pub fn nodes_written(&self) -> u64 {
        self.nodes_written.load(Ordering::Relaxed)
    }

    /// Returns the total number of journal lines appended.
    pub fn journal_writes(&self) -> u64 {
        self.journal_writes.load(Ordering::Relaxed)
    }

    /// Returns the total number of failed background flush cycles.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            segments_written: self.segments_written(),
            segments_read: self.segments_read(),
            cache_hits: self.cache_hits(),
            nodes_written: self.nodes_written(),
            journal_writes: self.journal_writes(),
            flush_failures: self.flush_failures(),
        }
    }
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of segments appended to tar files.
    pub segments_written: u64,
    /// Total number of segments loaded from tar files.
    pub segments_read: u64,
    /// Total number of cache hits.
    pub cache_hits: u64,
    /// Total number of node records written.
    pub nodes_written: u64,
    /// Total number of journal lines appended.
    pub journal_writes: u64,
    /// Total number of failed background flush cycles.
    pub flush_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = StoreStats::new();
        assert_eq!(stats.segments_written(), 0);
        assert_eq!(stats.nodes_written(), 0);
        assert_eq!(stats.flush_failures(), 0);
    }

    #[test]
    fn record_operations() {
        let stats = StoreStats::new();

        stats.record_segment_write();
        stats.record_segment_write();
        stats.record_node_write();
        stats.record_cache_hit();

        assert_eq!(stats.segments_written(), 2);
        assert_eq!(stats.nodes_written(), 1);
        assert_eq!(stats.cache_hits(), 1);
    }

    #[test]
    fn snapshot() {
        let stats = StoreStats::new();
        stats.record_journal_write();
        stats.record_flush_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.journal_writes, 1);
        assert_eq!(snap.flush_failures, 1);
        assert_eq!(snap.segments_written, 0);
    }
}

//! Store configuration.

use std::time::Duration;

/// Configuration for opening a [`crate::FileStore`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of a single tar container file before a new one is
    /// started.
    pub max_file_size: u64,

    /// Approximate byte budget for the in-memory segment cache.
    pub cache_size: u64,

    /// Target size of an in-progress data segment before the writer rolls
    /// over to a fresh one.
    pub segment_size: usize,

    /// Upper bound on the optimistic merge phase's exponential backoff.
    /// Once a round's backoff reaches this value the merge falls back to
    /// the pessimistic protocol.
    pub maximum_backoff: Duration,

    /// Whether tar container files are accessed through memory mapping
    /// instead of buffered reads.
    pub memory_mapping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024 * 1024, // 256 MB
            cache_size: 256 * 1024 * 1024,    // 256 MB
            segment_size: 256 * 1024,         // 256 KB
            maximum_backoff: Duration::from_secs(10),
            memory_mapping: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum tar container file size.
    #[must_use]
    pub const fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the segment cache byte budget.
    #[must_use]
    pub const fn cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    /// Sets the writer's target segment size.
    #[must_use]
    pub const fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the optimistic merge backoff ceiling.
    #[must_use]
    pub const fn maximum_backoff(mut self, backoff: Duration) -> Self {
        self.maximum_backoff = backoff;
        self
    }

    /// Sets whether tar files are memory-mapped.
    #[must_use]
    pub const fn memory_mapping(mut self, value: bool) -> Self {
        self.memory_mapping = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_file_size, 256 * 1024 * 1024);
        assert!(!config.memory_mapping);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_file_size(1024)
            .memory_mapping(true)
            .maximum_backoff(Duration::from_millis(50));

        assert_eq!(config.max_file_size, 1024);
        assert!(config.memory_mapping);
        assert_eq!(config.maximum_backoff, Duration::from_millis(50));
    }
}

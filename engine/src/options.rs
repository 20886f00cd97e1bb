//! Collection and store options.

use std::time::Duration;

/// Smallest accepted polling interval for the file watcher.
pub const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Highest supported compression level.
pub const MAX_COMPRESSION_LEVEL: u8 = 2;

/// Tunables shared by a store and every collection it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Reload shards that change on disk behind our back
    pub watch_files: bool,
    /// Polling interval for the watcher (never below [`MIN_WATCH_INTERVAL`])
    pub watch_interval: Duration,
    /// 0 writes pretty JSON; 1 and 2 write compact JSON without empty arrays/objects
    pub compression_level: u8,
    /// Advisory chunk size for bulk callers; not enforced by the store
    pub batch_size: usize,
    /// Soft byte cap per shard file
    pub max_file_size: u64,
    /// Soft document cap per shard file
    pub max_documents_per_file: usize,
    /// Quiet period after the last mutation before shards are written
    pub flush_delay: Duration,
    /// Quiet period before the store forwards buffered collection changes
    pub change_debounce: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            watch_files: true,
            watch_interval: Duration::from_millis(500),
            compression_level: 0,
            batch_size: 1000,
            max_file_size: 5 * 1024 * 1024,
            max_documents_per_file: 10_000,
            flush_delay: Duration::from_millis(100),
            change_debounce: Duration::from_millis(50),
        }
    }
}

impl Options {
    pub fn with_watch_files(mut self, enabled: bool) -> Self {
        self.watch_files = enabled;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval.max(MIN_WATCH_INTERVAL);
        self
    }

    pub fn with_compression_level(mut self, level: u8) -> Self {
        self.compression_level = level.min(MAX_COMPRESSION_LEVEL);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_max_documents_per_file(mut self, count: usize) -> Self {
        self.max_documents_per_file = count.max(1);
        self
    }

    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn with_change_debounce(mut self, delay: Duration) -> Self {
        self.change_debounce = delay;
        self
    }

    /// Clamp out-of-range values set directly on the struct.
    pub fn normalized(mut self) -> Self {
        self.watch_interval = self.watch_interval.max(MIN_WATCH_INTERVAL);
        self.compression_level = self.compression_level.min(MAX_COMPRESSION_LEVEL);
        self.batch_size = self.batch_size.max(1);
        self.max_documents_per_file = self.max_documents_per_file.max(1);
        self
    }

    /// Whether shard files are written compactly.
    pub fn compact(&self) -> bool {
        self.compression_level > 0
    }
}

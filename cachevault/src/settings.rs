//! Database configuration.

use std::time::Duration;

/// Hard cap on a single stored blob; the binlog size field is 24 bits.
pub const DATA_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Hard cap on records per bundle; the binlog count field is 24 bits.
pub const BUNDLED_RECORDS_LIMIT: usize = 256 * 1024;

/// Tuning knobs for a cache database.
///
/// `track_estimated_time` is frozen into the binlog header at creation
/// time: reopening an existing database with the opposite setting makes
/// its binlog unreadable and a fresh version is started.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upper bound on a single blob; larger puts are rejected.
    pub max_data_size: usize,
    /// Flush threshold for the remove and access staging buffers.
    pub max_bundled_records: usize,
    /// If non-zero, size-prune once the total stored bytes exceed this.
    pub total_size_limit: i64,
    /// If non-zero, expire entries unused for this many logical seconds.
    pub total_time_limit: u64,
    /// Record last-use times and write timed record variants.
    pub track_estimated_time: bool,
    /// Delay between deciding to prune and actually pruning.
    pub prune_timeout: Duration,
    /// Cap on the sleep between "nothing to prune yet" checks.
    pub max_prune_check_timeout: Duration,
    /// Staging buffer flush delay; also the clock bucketing threshold.
    pub write_bundle_delay: Duration,
    /// Compact once the binlog carries at least this many excess bytes.
    pub compact_after_excess: u64,
    /// If non-zero, additionally require
    /// `excess * compact_after_full_size >= compact_after_excess * binlog size`.
    pub compact_after_full_size: u64,
    /// Chunk size for binlog replay and compaction catch-up reads.
    pub read_block_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_data_size: 8 * 1024 * 1024,
            max_bundled_records: 16 * 1024,
            total_size_limit: 0,
            total_time_limit: 0,
            track_estimated_time: true,
            prune_timeout: Duration::from_secs(5),
            max_prune_check_timeout: Duration::from_secs(60 * 60),
            write_bundle_delay: Duration::from_secs(15),
            compact_after_excess: 8 * 1024 * 1024,
            compact_after_full_size: 0,
            read_block_size: 8 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Set the maximum size of a single blob.
    pub fn with_max_data_size(mut self, size: usize) -> Self {
        self.max_data_size = size;
        self
    }

    /// Set the staging buffer flush threshold.
    pub fn with_max_bundled_records(mut self, count: usize) -> Self {
        self.max_bundled_records = count;
        self
    }

    /// Set the total byte budget (0 disables size pruning).
    pub fn with_total_size_limit(mut self, limit: i64) -> Self {
        self.total_size_limit = limit;
        self
    }

    /// Set the age budget in logical seconds (0 disables time pruning).
    pub fn with_total_time_limit(mut self, limit: u64) -> Self {
        self.total_time_limit = limit;
        self
    }

    /// Enable or disable last-use time tracking.
    pub fn with_track_estimated_time(mut self, track: bool) -> Self {
        self.track_estimated_time = track;
        self
    }

    /// Set the delay before a scheduled prune runs.
    pub fn with_prune_timeout(mut self, timeout: Duration) -> Self {
        self.prune_timeout = timeout;
        self
    }

    /// Set the staging buffer flush delay.
    pub fn with_write_bundle_delay(mut self, delay: Duration) -> Self {
        self.write_bundle_delay = delay;
        self
    }

    /// Set the excess byte threshold for compaction.
    pub fn with_compact_after_excess(mut self, excess: u64) -> Self {
        self.compact_after_excess = excess;
        self
    }

    /// Set the full-size ratio gate for compaction (0 disables it).
    pub fn with_compact_after_full_size(mut self, full_size: u64) -> Self {
        self.compact_after_full_size = full_size;
        self
    }

    /// Set the replay and catch-up read chunk size.
    pub fn with_read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = size;
        self
    }

    /// Check the settings for internal consistency.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_data_size == 0 || self.max_data_size >= DATA_SIZE_LIMIT {
            return Err(format!(
                "max_data_size must be in 1..{}, got {}",
                DATA_SIZE_LIMIT, self.max_data_size
            ));
        }
        if self.max_bundled_records == 0 || self.max_bundled_records >= BUNDLED_RECORDS_LIMIT {
            return Err(format!(
                "max_bundled_records must be in 1..{}, got {}",
                BUNDLED_RECORDS_LIMIT, self.max_bundled_records
            ));
        }
        if self.total_size_limit != 0 && self.total_size_limit <= self.max_data_size as i64 {
            return Err(format!(
                "total_size_limit ({}) must exceed max_data_size ({})",
                self.total_size_limit, self.max_data_size
            ));
        }
        if self.read_block_size == 0 {
            return Err("read_block_size must be non-zero".to_string());
        }
        Ok(())
    }
}

//! Snapshots of database state for monitoring and tooling.

use crate::key::Key;

/// A point-in-time view of the database aggregates.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    /// Whether the database currently has an open binlog.
    pub is_open: bool,
    /// Active version directory number.
    pub version: i32,
    /// Number of entries in the index.
    pub entries: usize,
    /// Total stored value bytes.
    pub total_size: i64,
    /// Binlog payload size in bytes (0 when closed).
    pub binlog_size: u64,
    /// Binlog bytes a compaction would reclaim.
    pub binlog_excess_length: i64,
    /// Smallest non-zero last-use time across the index.
    pub minimal_entry_time: u64,
}

/// Entry metadata returned by batch lookups, without touching value files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: Key,
    pub tag: u8,
    pub size: i32,
    pub checksum: u32,
    pub use_time: u64,
}

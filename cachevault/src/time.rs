//! The estimated-relative clock used for age-based eviction.
//!
//! Entry ages are measured on a logical clock that only moves forward.
//! Each persisted time point pairs the wall-clock seconds at which it was
//! taken with a monotone `relative` value; advancing the clock adds the
//! wall-clock delta but never subtracts, so DST shifts and manual clock
//! adjustments cannot reorder entries.

use std::time::{SystemTime, UNIX_EPOCH};

/// A point on the estimated-relative clock.
///
/// `relative` values from two points taken on the same database are
/// comparable even when the wall clock jumped between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimatedTimePoint {
    /// Wall-clock seconds (POSIX) at the moment the point was taken.
    pub system: i32,
    /// Monotone logical seconds.
    pub relative: u64,
}

impl EstimatedTimePoint {
    /// Advance `relative` by the wall-clock time elapsed since this point.
    ///
    /// Backwards wall-clock jumps contribute zero, so the result never
    /// decreases.
    pub fn count_relative(&self, now: i32) -> u64 {
        let delta = (i64::from(now) - i64::from(self.system)).max(0);
        self.relative + delta as u64
    }
}

/// Current POSIX time in seconds, clamped to at least 1.
pub(crate) fn unixtime() -> i32 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    (seconds.min(i32::MAX as u64) as i32).max(1)
}

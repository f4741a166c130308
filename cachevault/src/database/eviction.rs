//! Stale-entry collection for the two eviction passes.
//!
//! Time-prune marks every entry older than the age budget in one scan of
//! the map, recounting the minimal-time aggregates over the survivors as
//! it goes. Size-prune then collects approximately the oldest entries
//! whose sizes add up to the byte overshoot, using a bounded candidate
//! set ordered newest-first so the marginal (newest) candidate can be
//! discarded whenever the remaining ones still cover the target.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::Index;
use crate::key::Key;

use super::object::DatabaseObject;

impl DatabaseObject {
    /// Mark entries whose last use is older than the age budget.
    pub(super) fn collect_time_prune(
        &mut self,
        stale: &mut BTreeSet<Key>,
        stale_total_size: &mut i64,
    ) {
        if self.settings().total_time_limit == 0 {
            return;
        }
        let before = self.prune_before_time();
        let minimal = self.index().minimal_entry_time();
        if minimal == 0 || minimal > before {
            return;
        }

        let mut new_minimal = 0u64;
        let mut new_count = 0i64;
        for (key, entry) in self.index().entries() {
            if entry.use_time <= before {
                stale.insert(*key);
                *stale_total_size += i64::from(entry.size);
            } else if new_minimal == 0 || entry.use_time < new_minimal {
                new_minimal = entry.use_time;
                new_count = 1;
            } else if entry.use_time == new_minimal {
                new_count += 1;
            }
        }
        self.index_mut().set_minimal_time(new_minimal, new_count);
    }

    /// Mark the approximately-oldest entries covering the size overshoot.
    pub(super) fn collect_size_prune(
        &mut self,
        stale: &mut BTreeSet<Key>,
        stale_total_size: &mut i64,
    ) {
        collect_size_prune_over(
            self.index(),
            self.settings().total_size_limit,
            stale,
            stale_total_size,
        );
    }
}

fn collect_size_prune_over(
    index: &Index,
    total_size_limit: i64,
    stale: &mut BTreeSet<Key>,
    stale_total_size: &mut i64,
) {
    let remove_size = if total_size_limit > 0 {
        index.total_size() - *stale_total_size - total_size_limit
    } else {
        0
    };
    if remove_size <= 0 {
        return;
    }

    // Candidates keyed ascending by (use_time, key): the last element is
    // the newest of the collected, the first to give back its slot.
    let mut oldest: BTreeMap<(u64, Key), i64> = BTreeMap::new();
    let mut oldest_total_size = 0i64;

    for (key, entry) in index.entries() {
        if stale.contains(key) {
            continue;
        }
        let add = if oldest_total_size < remove_size {
            true
        } else {
            match oldest.last_key_value() {
                Some((&(newest_time, _), _)) => entry.use_time < newest_time,
                None => true,
            }
        };
        if !add {
            continue;
        }
        while let Some((&(newest_time, newest_key), &newest_size)) = oldest.last_key_value() {
            let total_after_add = oldest_total_size + i64::from(entry.size);
            if entry.use_time <= newest_time && total_after_add - remove_size >= newest_size {
                oldest.remove(&(newest_time, newest_key));
                oldest_total_size -= newest_size;
            } else {
                break;
            }
        }
        oldest.insert((entry.use_time, *key), i64::from(entry.size));
        oldest_total_size += i64::from(entry.size);
    }

    for ((_, key), _) in oldest {
        stale.insert(key);
    }
    *stale_total_size += oldest_total_size;
}

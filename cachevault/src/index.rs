//! The in-memory index.
//!
//! Maps keys to entry metadata and keeps three aggregates in lockstep with
//! every mutation: the total stored bytes, the smallest non-zero last-use
//! time, and how many entries carry that minimum. The multiplicity makes
//! most updates O(1); a full recount happens only when the last entry at
//! the minimum goes away.

use std::collections::HashMap;

use crate::key::{Key, PlaceId};

/// Metadata for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) place: PlaceId,
    pub(crate) tag: u8,
    pub(crate) checksum: u32,
    pub(crate) size: i32,
    /// Relative time of last store or access; 0 when time tracking is off.
    pub(crate) use_time: u64,
}

/// The key map plus its aggregates.
#[derive(Debug, Default)]
pub(crate) struct Index {
    map: HashMap<Key, Entry>,
    total_size: i64,
    minimal_entry_time: u64,
    entries_with_minimal_time_count: i64,
}

impl Index {
    pub(crate) fn get(&self, key: &Key) -> Option<&Entry> {
        self.map.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Key, &Entry)> {
        self.map.iter()
    }

    pub(crate) fn total_size(&self) -> i64 {
        self.total_size
    }

    /// Smallest non-zero `use_time`, or 0 when empty or untracked.
    pub(crate) fn minimal_entry_time(&self) -> u64 {
        self.minimal_entry_time
    }

    #[cfg(test)]
    pub(crate) fn entries_with_minimal_time_count(&self) -> i64 {
        self.entries_with_minimal_time_count
    }

    /// Insert or overwrite an entry; returns whether a previous entry was
    /// replaced.
    pub(crate) fn insert(&mut self, key: Key, entry: Entry) -> bool {
        let new_size = i64::from(entry.size);
        let new_time = entry.use_time;
        match self.map.insert(key, entry) {
            Some(old) => {
                self.total_size += new_size - i64::from(old.size);
                self.use_time_changed(old.use_time, new_time);
                true
            }
            None => {
                self.total_size += new_size;
                self.use_time_changed(0, new_time);
                false
            }
        }
    }

    /// Remove an entry, returning its metadata.
    pub(crate) fn erase(&mut self, key: &Key) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        self.total_size -= i64::from(entry.size);
        self.use_time_changed(entry.use_time, 0);
        Some(entry)
    }

    /// Refresh the last-use time of an entry if it exists.
    pub(crate) fn set_use_time(&mut self, key: &Key, use_time: u64) {
        let Some(old) = self.map.get(key).map(|entry| entry.use_time) else {
            return;
        };
        if let Some(entry) = self.map.get_mut(key) {
            entry.use_time = use_time;
        }
        self.use_time_changed(old, use_time);
    }

    /// Replace the minimal-time aggregates after an external recount.
    pub(crate) fn set_minimal_time(&mut self, minimal: u64, count: i64) {
        self.minimal_entry_time = minimal;
        self.entries_with_minimal_time_count = count;
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.total_size = 0;
        self.minimal_entry_time = 0;
        self.entries_with_minimal_time_count = 0;
    }

    /// Adjust the minimal-time aggregates for one entry whose `use_time`
    /// moved from `old` to `new`; 0 on either side means absent.
    fn use_time_changed(&mut self, old: u64, new: u64) {
        if old == new {
            return;
        }
        if self.minimal_entry_time != 0 && old == self.minimal_entry_time {
            self.entries_with_minimal_time_count -= 1;
        }
        if new != 0 && (self.minimal_entry_time == 0 || new < self.minimal_entry_time) {
            self.minimal_entry_time = new;
            self.entries_with_minimal_time_count = 1;
        } else if new != 0 && new == self.minimal_entry_time {
            self.entries_with_minimal_time_count += 1;
        } else if self.entries_with_minimal_time_count == 0 {
            self.recount_minimal_time();
        }
    }

    fn recount_minimal_time(&mut self) {
        let mut minimal = 0u64;
        let mut count = 0i64;
        for entry in self.map.values() {
            if entry.use_time == 0 {
                continue;
            }
            if minimal == 0 || entry.use_time < minimal {
                minimal = entry.use_time;
                count = 1;
            } else if entry.use_time == minimal {
                count += 1;
            }
        }
        self.minimal_entry_time = minimal;
        self.entries_with_minimal_time_count = count;
    }
}

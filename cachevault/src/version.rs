//! Version file handling.
//!
//! The base directory holds numbered version subdirectories and a small
//! `version` file naming the active one. Recovery from an unreadable
//! binlog allocates the lowest unused number and repoints the file; the
//! cleaner later sweeps abandoned directories.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const VERSION_FILENAME: &str = "version";

pub(crate) fn version_path(base: &Path) -> PathBuf {
    base.join(VERSION_FILENAME)
}

/// Read the active version; `None` when missing or malformed.
pub(crate) fn read_version(base: &Path) -> Option<i32> {
    let bytes = fs::read(version_path(base)).ok()?;
    if bytes.len() != 4 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes);
    let version = i32::from_le_bytes(raw);
    (version >= 0).then_some(version)
}

/// Write the active version, creating the base directory if needed.
pub(crate) fn write_version(base: &Path, version: i32) -> io::Result<()> {
    fs::create_dir_all(base)?;
    fs::write(version_path(base), version.to_le_bytes())
}

/// Lowest non-negative integer with no directory of that name yet.
pub(crate) fn find_available_version(base: &Path) -> i32 {
    let mut taken = BTreeSet::new();
    if let Ok(entries) = fs::read_dir(base) {
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            {
                taken.insert(version);
            }
        }
    }
    let mut available = 0;
    for version in taken {
        if version != available {
            break;
        }
        available += 1;
    }
    available
}

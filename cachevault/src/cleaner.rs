//! Background sweeper for abandoned version directories.
//!
//! After a database recovers by switching to a fresh version, the previous
//! version directory (binlog plus value files) stays behind. The cleaner
//! runs once per open, off the database task, and deletes every version
//! directory except the active one. It respects cancellation so `close`
//! does not wait on a half-finished sweep.

use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::version::VERSION_FILENAME;

/// Result of one sweep.
#[derive(Debug, Clone, Default)]
pub(crate) struct CleanResult {
    pub(crate) directories_removed: usize,
    pub(crate) failures: usize,
}

/// Delete all non-active version directories under `base`.
///
/// Runs on a blocking thread; returns early when `cancel` fires.
pub(crate) async fn run(base: PathBuf, active_version: i32, cancel: CancellationToken) -> CleanResult {
    let result = tokio::task::spawn_blocking(move || sweep(&base, active_version, &cancel))
        .await
        .unwrap_or_default();
    if result.directories_removed > 0 || result.failures > 0 {
        info!(
            removed = result.directories_removed,
            failures = result.failures,
            "stale version sweep finished"
        );
    }
    result
}

fn sweep(base: &Path, active_version: i32, cancel: &CancellationToken) -> CleanResult {
    let mut result = CleanResult::default();
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(error) => {
            debug!(base = %base.display(), %error, "cannot scan base directory");
            return result;
        }
    };

    let active_name = active_version.to_string();
    for entry in entries.flatten() {
        if cancel.is_cancelled() {
            break;
        }
        let path = entry.path();
        let name = entry.file_name();
        if !path.is_dir() {
            continue;
        }
        if name == active_name.as_str() || name == VERSION_FILENAME {
            continue;
        }
        // Only numbered directories belong to the database.
        let is_version_dir = name
            .to_str()
            .map(|text| text.parse::<i32>().is_ok())
            .unwrap_or(false);
        if !is_version_dir {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed stale version directory");
                result.directories_removed += 1;
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to remove stale version directory");
                result.failures += 1;
            }
        }
    }
    result
}

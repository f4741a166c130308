//! Error types surfaced by the cache database.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors reported to callers of the database.
///
/// Every variant carries the filesystem path the failure relates to, so
/// callers can distinguish binlog problems from value-file problems.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure while touching a database file.
    #[error("cache I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The binlog exists but does not decrypt with the supplied key.
    #[error("wrong encryption key for {}", .path.display())]
    WrongKey { path: PathBuf },

    /// Another process (or handle) holds the binlog lock.
    #[error("failed to lock {}", .path.display())]
    LockFailed { path: PathBuf },
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// An I/O error described by a message rather than an OS error.
    pub(crate) fn io_other(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Io {
            path: path.into(),
            source: io::Error::new(io::ErrorKind::Other, message.into()),
        }
    }

    /// The path this error relates to.
    pub fn path(&self) -> &Path {
        match self {
            Error::Io { path, .. } => path,
            Error::WrongKey { path } => path,
            Error::LockFailed { path } => path,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

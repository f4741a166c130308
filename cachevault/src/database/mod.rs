//! The public database handle.
//!
//! A [`Database`] is a cheap clonable handle to a single-owner task that
//! holds all mutable state. Every public operation posts a command onto
//! the task's queue and completes through a oneshot reply, so operations
//! execute strictly one at a time in arrival order; there are no locks
//! because there is no shared state. Background jobs (the version-dir
//! cleaner and the binlog compactor) message back through a weak sender:
//! when the database is gone their completions are dropped.

mod eviction;
mod object;

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};
use crate::key::{Key, TaggedValue};
use crate::settings::Settings;
use crate::stats::{DatabaseStats, RawEntry};

use object::DatabaseObject;

/// An embedded, encrypted key/value cache.
///
/// All methods are async but internally serialised: a `put` observed to
/// complete is durable in the binlog before the next queued operation
/// runs. Dropping the last handle shuts the task down after flushing
/// staged records.
#[derive(Clone)]
pub struct Database {
    tx: mpsc::UnboundedSender<Command>,
    base: PathBuf,
}

pub(crate) enum Command {
    Open {
        key: EncryptionKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Put {
        key: Key,
        value: TaggedValue,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        key: Key,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Remove {
        key: Key,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<DatabaseStats>,
    },
    GetManyRaw {
        keys: Vec<Key>,
        reply: oneshot::Sender<Vec<RawEntry>>,
    },
    CompactorFinished {
        generation: u64,
        result: io::Result<u64>,
    },
    CleanerFinished,
}

impl Database {
    /// Create a database rooted at `base`.
    ///
    /// Nothing touches the filesystem until [`open`](Self::open). Must be
    /// called within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `settings` fail [`Settings::validate`].
    pub fn new(base: impl Into<PathBuf>, settings: Settings) -> Self {
        if let Err(problem) = settings.validate() {
            panic!("invalid cache settings: {problem}");
        }
        let base = base.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = DatabaseObject::new(base.clone(), settings, tx.downgrade());
        tokio::spawn(object::run(rx, state));
        Self { tx, base }
    }

    /// Open or create the database with the given key.
    ///
    /// An unreadable binlog (corruption, format change) silently starts a
    /// fresh version; `WrongKey` and `LockFailed` are reported instead so
    /// a mistyped key never wipes data.
    pub async fn open(&self, key: EncryptionKey) -> Result<()> {
        self.request(|reply| Command::Open { key, reply })
            .await
            .unwrap_or_else(|| Err(self.terminated()))
    }

    /// Store a value. An empty value removes the key.
    pub async fn put(&self, key: Key, value: impl Into<TaggedValue>) -> Result<()> {
        let value = value.into();
        self.request(|reply| Command::Put { key, value, reply })
            .await
            .unwrap_or_else(|| Err(self.terminated()))
    }

    /// Fetch a value; misses and corrupt values both read as `None`.
    pub async fn get(&self, key: Key) -> Option<Vec<u8>> {
        self.request(|reply| Command::Get { key, reply })
            .await
            .flatten()
    }

    /// Remove a key; removing an absent key is a no-op.
    pub async fn remove(&self, key: Key) {
        self.request(|reply| Command::Remove { key, reply }).await;
    }

    /// Flush staged records, stop background jobs and release the key.
    pub async fn close(&self) {
        self.request(|reply| Command::Close { reply }).await;
    }

    /// Point the database at a fresh empty version.
    ///
    /// Only legal while closed; the old version directory is swept by the
    /// cleaner on the next open.
    pub async fn clear(&self) -> Result<()> {
        self.request(|reply| Command::Clear { reply })
            .await
            .unwrap_or_else(|| Err(self.terminated()))
    }

    /// Snapshot the database aggregates.
    pub async fn stats(&self) -> DatabaseStats {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    /// Look up entry metadata for many keys without reading value files
    /// or refreshing access times. Unknown keys are skipped.
    pub async fn get_many_raw(&self, keys: Vec<Key>) -> Vec<RawEntry> {
        self.request(|reply| Command::GetManyRaw { keys, reply })
            .await
            .unwrap_or_default()
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Option<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(build(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    fn terminated(&self) -> Error {
        Error::io_other(&self.base, "database task terminated")
    }
}

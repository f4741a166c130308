//! cachevault - an embedded, encrypted key/value cache.
//!
//! Binary blobs are stored under fixed-width opaque keys, encrypted at
//! rest with caller-supplied key material. An append-only binlog is the
//! ground truth of the index: it is replayed on open to rebuild the
//! in-memory map and is the durability boundary for every mutation.
//! Size- and age-based eviction run in the background, and the binlog is
//! compacted online once superseded records outweigh the live ones.
//!
//! # Example
//!
//! ```ignore
//! use cachevault::{Database, EncryptionKey, Key, Settings};
//!
//! let settings = Settings::default().with_total_size_limit(64 * 1024 * 1024);
//! let db = Database::new("/var/cache/app", settings);
//! db.open(EncryptionKey::new(key_material)).await?;
//!
//! db.put(Key::new(1, 2), b"payload".to_vec()).await?;
//! let value = db.get(Key::new(1, 2)).await;
//! db.close().await;
//! ```

mod binlog;
mod cleaner;
mod compactor;
mod crypto;
mod database;
mod error;
mod index;
mod key;
mod settings;
mod stats;
mod time;
mod version;

pub use crypto::EncryptionKey;
pub use database::Database;
pub use error::{Error, Result};
pub use key::{Key, TaggedValue};
pub use settings::{Settings, BUNDLED_RECORDS_LIMIT, DATA_SIZE_LIMIT};
pub use stats::{DatabaseStats, RawEntry};
pub use time::EstimatedTimePoint;

/// Version of the cachevault library, injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

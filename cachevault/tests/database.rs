//! End-to-end database tests: durability, eviction, compaction, recovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cachevault::{Database, EncryptionKey, Error, Key, Settings, TaggedValue};
use tempfile::TempDir;

fn key_material(fill: u8) -> EncryptionKey {
    EncryptionKey::new(vec![fill; EncryptionKey::SIZE])
}

fn fast_settings() -> Settings {
    Settings::default()
        .with_write_bundle_delay(Duration::from_millis(100))
        .with_prune_timeout(Duration::from_millis(100))
}

fn binlog_path(base: &Path, version: i32) -> PathBuf {
    base.join(version.to_string()).join("binlog")
}

async fn open_with_retry(db: &Database, key: &EncryptionKey) {
    for _ in 0..50 {
        match db.open(key.clone()).await {
            Ok(()) => return,
            Err(Error::LockFailed { .. }) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(error) => panic!("open failed: {error}"),
        }
    }
    panic!("database stayed locked");
}

// ─────────────────────────────────────────────────────────────────────────
// Basic operations
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_then_get_returns_value() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"testbytetestbyt".to_vec()).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"testbytetestbyt".to_vec()));
    assert_eq!(db.get(Key::new(1, 1)).await, None);

    db.close().await;
}

#[tokio::test]
async fn values_survive_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    let key = key_material(1);

    db.open(key.clone()).await.unwrap();
    db.put(Key::new(0, 1), b"first".to_vec()).await.unwrap();
    db.put(Key::new(1, 0), b"second".to_vec()).await.unwrap();
    db.close().await;

    db.open(key).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"first".to_vec()));
    assert_eq!(db.get(Key::new(1, 0)).await, Some(b"second".to_vec()));

    let stats = db.stats().await;
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.total_size, 11);
    db.close().await;
}

#[tokio::test]
async fn empty_value_removes_the_key() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"value".to_vec()).await.unwrap();
    db.put(Key::new(0, 1), Vec::new()).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, None);

    db.close().await;
}

#[tokio::test]
async fn remove_deletes_value_permanently() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    let key = key_material(1);

    db.open(key.clone()).await.unwrap();
    db.put(Key::new(0, 1), b"first".to_vec()).await.unwrap();
    db.put(Key::new(1, 0), b"second".to_vec()).await.unwrap();
    db.remove(Key::new(0, 1)).await;
    assert_eq!(db.get(Key::new(0, 1)).await, None);
    assert_eq!(db.get(Key::new(1, 0)).await, Some(b"second".to_vec()));
    db.close().await;

    db.open(key).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, None);
    assert_eq!(db.get(Key::new(1, 0)).await, Some(b"second".to_vec()));
    db.close().await;
}

#[tokio::test]
async fn double_remove_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"value".to_vec()).await.unwrap();
    db.remove(Key::new(0, 1)).await;
    db.remove(Key::new(0, 1)).await;
    db.remove(Key::new(9, 9)).await;
    assert_eq!(db.get(Key::new(0, 1)).await, None);

    db.close().await;
}

#[tokio::test]
async fn put_after_remove_stores_the_new_value() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"old".to_vec()).await.unwrap();
    db.remove(Key::new(0, 1)).await;
    db.put(Key::new(0, 1), b"new".to_vec()).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"new".to_vec()));

    db.close().await;
}

#[tokio::test]
async fn oversized_value_is_rejected() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::default().with_max_data_size(100);
    let db = Database::new(dir.path(), settings);
    db.open(key_material(1)).await.unwrap();

    let result = db.put(Key::new(0, 1), vec![0u8; 200]).await;
    assert!(matches!(result, Err(Error::Io { .. })));
    assert_eq!(db.get(Key::new(0, 1)).await, None);

    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Duplicate suppression
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_reput_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"stable value".to_vec()).await.unwrap();
    let after_first = db.stats().await.binlog_size;

    db.put(Key::new(0, 1), b"stable value".to_vec()).await.unwrap();
    let after_second = db.stats().await.binlog_size;
    assert_eq!(after_second, after_first);

    db.put(Key::new(0, 1), b"changed value".to_vec()).await.unwrap();
    let after_change = db.stats().await.binlog_size;
    assert!(after_change > after_second);
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"changed value".to_vec()));

    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Keys, locks, recovery
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_key_is_reported_not_wiped() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());

    db.open(key_material(1)).await.unwrap();
    db.put(Key::new(0, 1), b"secret".to_vec()).await.unwrap();
    db.close().await;

    let result = db.open(key_material(2)).await;
    assert!(matches!(result, Err(Error::WrongKey { .. })));

    // The data is intact under the right key.
    db.open(key_material(1)).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"secret".to_vec()));
    db.close().await;
}

#[tokio::test]
async fn second_database_cannot_lock_the_same_binlog() {
    let dir = TempDir::new().unwrap();
    let first = Database::new(dir.path(), Settings::default());
    first.open(key_material(1)).await.unwrap();

    let second = Database::new(dir.path(), Settings::default());
    let result = second.open(key_material(1)).await;
    assert!(matches!(result, Err(Error::LockFailed { .. })));

    first.close().await;
}

#[tokio::test]
async fn dropping_the_handle_keeps_puts_durable() {
    let dir = TempDir::new().unwrap();
    let key = key_material(1);
    {
        let db = Database::new(dir.path(), Settings::default());
        db.open(key.clone()).await.unwrap();
        db.put(Key::new(0, 1), b"survives".to_vec()).await.unwrap();
        drop(db);
    }

    let db = Database::new(dir.path(), Settings::default());
    open_with_retry(&db, &key).await;
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"survives".to_vec()));
    db.close().await;
}

#[tokio::test]
async fn corrupt_value_reads_as_miss_and_reput_recovers() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), b"fragile".to_vec()).await.unwrap();

    // Corrupt the value file behind the database's back.
    let version_dir = dir.path().join("0");
    let mut value_file = None;
    for entry in walkdir(&version_dir) {
        let is_binlog = entry
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name == "binlog")
            .unwrap_or(false);
        if !is_binlog {
            value_file = Some(entry);
        }
    }
    let value_file = value_file.expect("value file exists");
    let mut bytes = std::fs::read(&value_file).unwrap();
    for byte in bytes.iter_mut() {
        *byte ^= 0xFF;
    }
    std::fs::write(&value_file, bytes).unwrap();

    assert_eq!(db.get(Key::new(0, 1)).await, None);

    db.put(Key::new(0, 1), b"restored".to_vec()).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"restored".to_vec()));

    db.close().await;
}

#[tokio::test]
async fn torn_binlog_tail_is_dropped_on_reopen() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    let key = key_material(1);

    db.open(key.clone()).await.unwrap();
    db.put(Key::new(0, 1), b"kept".to_vec()).await.unwrap();
    db.put(Key::new(1, 0), b"also kept".to_vec()).await.unwrap();
    db.close().await;

    // Append a few garbage bytes, as if a record write was interrupted.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(binlog_path(dir.path(), 0))
        .unwrap();
    file.write_all(&[0xFF; 7]).unwrap();
    drop(file);

    db.open(key).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"kept".to_vec()));
    assert_eq!(db.get(Key::new(1, 0)).await, Some(b"also kept".to_vec()));
    db.close().await;
}

#[tokio::test]
async fn truncated_binlog_loses_only_the_last_record() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    let key = key_material(1);

    db.open(key.clone()).await.unwrap();
    db.put(Key::new(0, 1), b"early".to_vec()).await.unwrap();
    db.put(Key::new(1, 0), b"late".to_vec()).await.unwrap();
    db.close().await;

    // Cut the last 4 bytes: the second store record becomes torn.
    let path = binlog_path(dir.path(), 0);
    let length = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(length - 4).unwrap();
    drop(file);

    db.open(key).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, Some(b"early".to_vec()));
    assert_eq!(db.get(Key::new(1, 0)).await, None);
    db.close().await;
}

#[tokio::test]
async fn clear_starts_a_fresh_version() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    let key = key_material(1);

    db.open(key.clone()).await.unwrap();
    db.put(Key::new(0, 1), b"old world".to_vec()).await.unwrap();
    db.close().await;

    db.clear().await.unwrap();
    db.open(key).await.unwrap();
    assert_eq!(db.get(Key::new(0, 1)).await, None);
    assert_eq!(db.stats().await.version, 1);

    // The abandoned version directory is swept in the background.
    for _ in 0..40 {
        if !dir.path().join("0").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!dir.path().join("0").exists());
    db.close().await;
}

#[tokio::test]
async fn clear_while_open_is_an_error() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();
    assert!(db.clear().await.is_err());
    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Raw metadata and tags
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_many_raw_returns_metadata_without_touching_values() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), TaggedValue::new(b"aaaa".to_vec(), 7))
        .await
        .unwrap();
    db.put(Key::new(1, 0), TaggedValue::new(b"bbbbbb".to_vec(), 9))
        .await
        .unwrap();

    let raw = db
        .get_many_raw(vec![Key::new(0, 1), Key::new(5, 5), Key::new(1, 0)])
        .await;
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0].key, Key::new(0, 1));
    assert_eq!(raw[0].tag, 7);
    assert_eq!(raw[0].size, 4);
    assert_eq!(raw[1].key, Key::new(1, 0));
    assert_eq!(raw[1].tag, 9);
    assert_eq!(raw[1].size, 6);

    db.close().await;
}

#[tokio::test]
async fn tag_change_defeats_suppression() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path(), Settings::default());
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(0, 1), TaggedValue::new(b"same bytes".to_vec(), 1))
        .await
        .unwrap();
    let before = db.stats().await.binlog_size;
    db.put(Key::new(0, 1), TaggedValue::new(b"same bytes".to_vec(), 2))
        .await
        .unwrap();
    assert!(db.stats().await.binlog_size > before);

    let raw = db.get_many_raw(vec![Key::new(0, 1)]).await;
    assert_eq!(raw[0].tag, 2);

    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Eviction
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn size_limit_evicts_the_oldest_entry() {
    let dir = TempDir::new().unwrap();
    let settings = fast_settings()
        .with_total_size_limit(1000)
        .with_max_data_size(500);
    let db = Database::new(dir.path(), settings);
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(1, 1), vec![0x41; 300]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    db.put(Key::new(2, 2), vec![0x42; 300]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    db.put(Key::new(3, 3), vec![0x43; 500]).await.unwrap();

    // 1100 bytes against a 1000-byte budget: the oldest entry goes.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(db.get(Key::new(1, 1)).await, None);
    assert_eq!(db.get(Key::new(2, 2)).await, Some(vec![0x42; 300]));
    assert_eq!(db.get(Key::new(3, 3)).await, Some(vec![0x43; 500]));
    assert_eq!(db.stats().await.total_size, 800);

    db.close().await;
}

#[tokio::test]
async fn time_limit_expires_stale_entries() {
    let dir = TempDir::new().unwrap();
    let settings = fast_settings().with_total_time_limit(2);
    let db = Database::new(dir.path(), settings);
    db.open(key_material(1)).await.unwrap();

    db.put(Key::new(1, 1), b"stale".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    db.put(Key::new(2, 2), b"fresh".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(db.get(Key::new(1, 1)).await, None);
    assert_eq!(db.get(Key::new(2, 2)).await, Some(b"fresh".to_vec()));

    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Compaction
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn excess_triggers_compaction_and_preserves_the_map() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::default()
        .with_track_estimated_time(false)
        .with_write_bundle_delay(Duration::from_millis(100))
        .with_max_bundled_records(4)
        .with_compact_after_excess(200)
        .with_read_block_size(512);
    let db = Database::new(dir.path(), settings);
    let key = key_material(1);
    db.open(key.clone()).await.unwrap();

    let value = |seed: u8| vec![seed; 64];
    for i in 0..10u64 {
        db.put(Key::new(i, i + 1), value(i as u8)).await.unwrap();
    }
    for i in 0..5u64 {
        db.remove(Key::new(i, i + 1)).await;
    }
    let before = db.stats().await.binlog_size;
    for i in 5..10u64 {
        db.put(Key::new(i, i + 1), value(0x80 + i as u8)).await.unwrap();
    }

    // Give the compactor (and the staged remove flush) time to finish.
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let stats = db.stats().await;
    assert!(
        stats.binlog_size < before,
        "binlog did not shrink: {} -> {}",
        before,
        stats.binlog_size
    );
    assert_eq!(stats.entries, 5);
    assert!(!dir.path().join("0").join("binlog-ready").exists());
    assert!(!dir.path().join("0").join("binlog-temp").exists());

    for i in 0..5u64 {
        assert_eq!(db.get(Key::new(i, i + 1)).await, None);
    }
    for i in 5..10u64 {
        assert_eq!(db.get(Key::new(i, i + 1)).await, Some(value(0x80 + i as u8)));
    }
    db.close().await;

    // The compacted log replays to the same map.
    db.open(key).await.unwrap();
    for i in 0..5u64 {
        assert_eq!(db.get(Key::new(i, i + 1)).await, None);
    }
    for i in 5..10u64 {
        assert_eq!(db.get(Key::new(i, i + 1)).await, Some(value(0x80 + i as u8)));
    }
    db.close().await;
}

#[tokio::test]
async fn compaction_works_with_time_tracking() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::default()
        .with_write_bundle_delay(Duration::from_millis(100))
        .with_max_bundled_records(4)
        .with_compact_after_excess(300)
        .with_read_block_size(512);
    let db = Database::new(dir.path(), settings);
    let key = key_material(1);
    db.open(key.clone()).await.unwrap();

    for i in 0..8u64 {
        db.put(Key::new(i, i), vec![i as u8; 32]).await.unwrap();
    }
    // Overwrites and removes build up excess.
    for i in 0..8u64 {
        db.put(Key::new(i, i), vec![0x40 + i as u8; 32]).await.unwrap();
    }
    for i in 0..3u64 {
        db.remove(Key::new(i, i)).await;
    }

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let stats = db.stats().await;
    assert_eq!(stats.entries, 5);
    for i in 3..8u64 {
        assert_eq!(db.get(Key::new(i, i)).await, Some(vec![0x40 + i as u8; 32]));
    }
    db.close().await;

    db.open(key).await.unwrap();
    for i in 0..3u64 {
        assert_eq!(db.get(Key::new(i, i)).await, None);
    }
    for i in 3..8u64 {
        assert_eq!(db.get(Key::new(i, i)).await, Some(vec![0x40 + i as u8; 32]));
    }
    db.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────

fn walkdir(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walkdir(&path));
        } else {
            files.push(path);
        }
    }
    files
}

//! Offline binlog compaction.
//!
//! Compaction rebuilds the index from the live binlog up to a snapshot
//! point and writes it densely (header, clock pin, multi-store bundles)
//! to a side file. The database task then catches the side file up with
//! any records appended during the rewrite and swaps it in through the
//! `binlog-ready` rename dance. Only the rewrite and catch-up live here;
//! the swap and the failure back-off belong to the database task.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::binlog::format::{
    self, BinlogHeader, Record, StoreEntry, FLAG_TRACK_ESTIMATED_TIME, HEADER_SIZE,
};
use crate::binlog::reader::BinlogReader;
use crate::crypto::{EncryptedFile, EncryptionKey, Mode, OpenError};
use crate::index::{Entry, Index};
use crate::settings::Settings;
use crate::time::EstimatedTimePoint;

/// Name of the side file a rewrite targets, next to the live binlog.
pub(crate) const SIDE_FILENAME: &str = "binlog-temp";

/// Name of the completed side file awaiting the final rename.
pub(crate) const READY_FILENAME: &str = "binlog-ready";

/// Snapshot handed to the compactor when it starts.
#[derive(Debug, Clone)]
pub(crate) struct CompactorInfo {
    /// Live binlog payload size at snapshot time; the rewrite reads up to
    /// here and catch-up continues from here.
    pub(crate) till: u64,
    /// Database clock at snapshot time; pins the relative clock in the
    /// rewritten log and stamps the rewritten entries.
    pub(crate) time: EstimatedTimePoint,
}

/// Rewrite the live binlog `[0, info.till)` densely into `side_path`.
///
/// Returns the offset the live binlog was read till, which the caller
/// compares against the current size to decide on catch-up.
pub(crate) fn compact(
    binlog_path: &Path,
    side_path: &Path,
    key: &EncryptionKey,
    settings: &Settings,
    info: &CompactorInfo,
) -> io::Result<u64> {
    let mut live = open_for_io(binlog_path, Mode::Read, key)?;

    let mut header_bytes = [0u8; HEADER_SIZE];
    if live.read(&mut header_bytes)? != HEADER_SIZE {
        return Err(invalid("binlog header is short"));
    }
    let header =
        BinlogHeader::decode(&header_bytes).ok_or_else(|| invalid("binlog header is bad"))?;
    if header.track_estimated_time() != settings.track_estimated_time {
        return Err(invalid("binlog time tracking flag mismatch"));
    }

    let (index, _) = replay_till(&mut live, settings, header.system_time, info.till)?;
    drop(live);

    let track = settings.track_estimated_time;
    let mut side = open_for_io(side_path, Mode::Write, key)?;
    let flags = if track { FLAG_TRACK_ESTIMATED_TIME } else { 0 };
    side.write(
        &BinlogHeader {
            flags,
            system_time: info.time.system,
        }
        .encode(),
    )?;
    if track {
        // Pin the relative clock so replaying the dense log cannot
        // regress it below the value the live database reached.
        side.write(&format::encode_multi_access(info.time, &[]))?;
    }

    let mut bundle = Vec::with_capacity(settings.max_bundled_records.min(index.len().max(1)));
    for (entry_key, entry) in index.entries() {
        bundle.push(StoreEntry {
            key: *entry_key,
            place: entry.place,
            tag: entry.tag,
            size: entry.size,
            checksum: entry.checksum,
            time: track.then_some(EstimatedTimePoint {
                system: info.time.system,
                relative: entry.use_time,
            }),
        });
        if bundle.len() == settings.max_bundled_records {
            side.write(&format::encode_multi_store(&bundle, track))?;
            bundle.clear();
        }
    }
    if !bundle.is_empty() {
        side.write(&format::encode_multi_store(&bundle, track))?;
    }
    side.flush()?;

    debug!(
        entries = index.len(),
        dense_size = side.size(),
        read_till = info.till,
        "binlog rewrite complete"
    );
    Ok(info.till)
}

/// Append live binlog bytes `[from, size)` to the side file verbatim.
///
/// The record stream is self-framing, so raw bytes appended after the
/// dense rewrite replay exactly like they did in the live log. Returns
/// the new read-till offset.
pub(crate) fn catch_up(
    side_path: &Path,
    binlog_path: &Path,
    key: &EncryptionKey,
    from: u64,
    settings: &Settings,
) -> io::Result<u64> {
    let mut live = open_for_io(binlog_path, Mode::Read, key)?;
    let live_size = live.size();
    if from > live_size {
        return Err(invalid("live binlog shrank during compaction"));
    }

    let mut side = open_for_io(side_path, Mode::ReadAppend, key)?;
    let end = side.size();
    side.seek(end)?;
    live.seek(from)?;

    let mut copied = from;
    let mut chunk = vec![0u8; settings.read_block_size];
    while copied < live_size {
        let want = ((live_size - copied) as usize).min(chunk.len());
        let count = live.read(&mut chunk[..want])?;
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "live binlog ended during catch-up",
            ));
        }
        side.write(&chunk[..count])?;
        copied += count as u64;
    }
    side.flush()?;
    Ok(copied)
}

/// Replay records into a fresh index, stopping at `till`.
fn replay_till(
    live: &mut EncryptedFile,
    settings: &Settings,
    header_system_time: i32,
    till: u64,
) -> io::Result<(Index, EstimatedTimePoint)> {
    let mut index = Index::default();
    let mut time = EstimatedTimePoint {
        system: header_system_time,
        relative: header_system_time.max(0) as u64,
    };
    let mut consumed = HEADER_SIZE as u64;

    let mut reader = BinlogReader::new(live, settings, Some(till));
    while let Some(parsed) = reader.next_record() {
        match parsed.record {
            Record::Store(entry) => {
                apply_store(&mut index, &mut time, entry, settings)?;
            }
            Record::MultiStore(entries) => {
                for entry in entries {
                    apply_store(&mut index, &mut time, entry, settings)?;
                }
            }
            Record::MultiRemove(keys) => {
                for key in keys {
                    index.erase(&key);
                }
            }
            Record::MultiAccess {
                time: point,
                keys,
            } => {
                if point.relative > time.relative {
                    time = point;
                }
                for key in keys {
                    index.set_use_time(&key, point.relative);
                }
            }
        }
        consumed = parsed.end;
    }
    if reader.failed() || consumed != till {
        return Err(invalid("live binlog did not replay to the snapshot point"));
    }
    Ok((index, time))
}

fn apply_store(
    index: &mut Index,
    time: &mut EstimatedTimePoint,
    entry: StoreEntry,
    settings: &Settings,
) -> io::Result<()> {
    if entry.size <= 0 || entry.size as usize > settings.max_data_size {
        return Err(invalid("store record has an impossible size"));
    }
    let use_time = match entry.time {
        Some(point) => {
            if point.relative > time.relative {
                *time = point;
            }
            point.relative
        }
        None => time.relative,
    };
    index.insert(
        entry.key,
        Entry {
            place: entry.place,
            tag: entry.tag,
            checksum: entry.checksum,
            size: entry.size,
            use_time,
        },
    );
    Ok(())
}

fn open_for_io(path: &Path, mode: Mode, key: &EncryptionKey) -> io::Result<EncryptedFile> {
    EncryptedFile::open(path, mode, key).map_err(|error| match error {
        OpenError::Io(source) => source,
        OpenError::LockFailed => io::Error::new(io::ErrorKind::WouldBlock, "file is locked"),
        OpenError::WrongKey => invalid("key mismatch on own file"),
    })
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use tempfile::TempDir;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new(vec![0x42; EncryptionKey::SIZE])
    }

    fn settings() -> Settings {
        Settings::default()
            .with_track_estimated_time(false)
            .with_max_bundled_records(4)
    }

    fn store(id: u64) -> StoreEntry {
        StoreEntry {
            key: Key::new(id, id),
            place: [id as u8; 7],
            tag: 0,
            size: 100,
            checksum: id as u32,
            time: None,
        }
    }

    fn write_live(path: &Path, records: &[Vec<u8>]) -> u64 {
        let key = test_key();
        let mut file = EncryptedFile::open(path, Mode::Write, &key).unwrap();
        file.write(
            &BinlogHeader {
                flags: 0,
                system_time: 1_000,
            }
            .encode(),
        )
        .unwrap();
        for record in records {
            file.write(record).unwrap();
        }
        file.flush().unwrap();
        file.size()
    }

    fn replay_file(path: &Path) -> Index {
        let key = test_key();
        let mut file = EncryptedFile::open(path, Mode::Read, &key).unwrap();
        let mut header = [0u8; HEADER_SIZE];
        file.read(&mut header).unwrap();
        let decoded = BinlogHeader::decode(&header).unwrap();
        let size = file.size();
        let (index, _) = replay_till(&mut file, &settings(), decoded.system_time, size)
            .unwrap();
        index
    }

    #[test]
    fn rewrite_drops_superseded_records() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("binlog");
        let side = dir.path().join(SIDE_FILENAME);

        let mut overwrite = store(1);
        overwrite.checksum = 999;
        let records = vec![
            format::encode_store(&store(1)),
            format::encode_store(&store(2)),
            format::encode_store(&store(3)),
            format::encode_multi_remove(&[Key::new(2, 2)]),
            format::encode_store(&overwrite),
        ];
        let till = write_live(&live, &records);
        let live_physical = std::fs::metadata(&live).unwrap().len();

        let info = CompactorInfo {
            till,
            time: EstimatedTimePoint::default(),
        };
        let read_till = compact(&live, &side, &test_key(), &settings(), &info).unwrap();
        assert_eq!(read_till, till);
        assert!(std::fs::metadata(&side).unwrap().len() < live_physical);

        let index = replay_file(&side);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&Key::new(1, 1)).unwrap().checksum, 999);
        assert!(index.get(&Key::new(2, 2)).is_none());
        assert!(index.get(&Key::new(3, 3)).is_some());
    }

    #[test]
    fn catch_up_appends_missing_tail() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("binlog");
        let side = dir.path().join(SIDE_FILENAME);

        let till = write_live(&live, &[format::encode_store(&store(1))]);
        let info = CompactorInfo {
            till,
            time: EstimatedTimePoint::default(),
        };
        compact(&live, &side, &test_key(), &settings(), &info).unwrap();

        // The live binlog grows after the snapshot.
        let key = test_key();
        let mut file = EncryptedFile::open(&live, Mode::ReadAppend, &key).unwrap();
        let end = file.size();
        file.seek(end).unwrap();
        file.write(&format::encode_store(&store(7))).unwrap();
        let new_size = file.size();
        drop(file);

        let caught = catch_up(&side, &live, &key, till, &settings()).unwrap();
        assert_eq!(caught, new_size);

        let index = replay_file(&side);
        assert_eq!(index.len(), 2);
        assert!(index.get(&Key::new(7, 7)).is_some());
    }

    #[test]
    fn rewrite_bundles_respect_record_cap() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("binlog");
        let side = dir.path().join(SIDE_FILENAME);

        let records: Vec<Vec<u8>> = (0..10).map(|i| format::encode_store(&store(i))).collect();
        let till = write_live(&live, &records);
        let info = CompactorInfo {
            till,
            time: EstimatedTimePoint::default(),
        };
        compact(&live, &side, &test_key(), &settings(), &info).unwrap();

        // max_bundled_records is 4, so ten entries replay from three bundles.
        let index = replay_file(&side);
        assert_eq!(index.len(), 10);
    }
}

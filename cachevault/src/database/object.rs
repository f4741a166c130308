//! The database task: all state and the serial command loop.
//!
//! One `DatabaseObject` owns the binlog handle, the index and the staging
//! buffers. Commands are handled to completion in arrival order; the two
//! internal timers (bundle flush, prune) are deadline branches of the same
//! loop, so they also never interleave with an operation in progress.
//! Value blobs and binlog records are small, so doing their I/O inline on
//! the task is deliberate.

use std::collections::BTreeSet;
use std::fs;
use std::mem;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh32::xxh32;

use crate::binlog::format::{
    self, BinlogHeader, Record, StoreEntry, FLAG_TRACK_ESTIMATED_TIME, HEADER_SIZE,
    KEY_WIRE_SIZE, MULTI_ACCESS_HEADER_SIZE, MULTI_REMOVE_HEADER_SIZE,
};
use crate::binlog::reader::BinlogReader;
use crate::cleaner;
use crate::compactor::{self, CompactorInfo, READY_FILENAME, SIDE_FILENAME};
use crate::crypto::{EncryptedFile, EncryptionKey, Mode, OpenError};
use crate::error::{Error, Result};
use crate::index::{Entry, Index};
use crate::key::{place_name, Key, PlaceId, TaggedValue};
use crate::settings::Settings;
use crate::stats::{DatabaseStats, RawEntry};
use crate::time::{unixtime, EstimatedTimePoint};
use crate::version;

use super::Command;

const BINLOG_FILENAME: &str = "binlog";

const FREE_PLACE_ATTEMPTS: usize = 32;

const FIRST_COMPACTOR_RETRY: Duration = Duration::from_secs(10);
const MAX_COMPACTOR_RETRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Compactor driver state held by the database task.
struct CompactorWrap {
    running: bool,
    /// Bumped on every start and on close, so completions of abandoned
    /// runs are recognised and dropped.
    generation: u64,
    next_attempt: Option<Instant>,
    delay_after_failure: Duration,
    /// Excess snapshot taken when the run started; subtracted on success.
    excess_length: i64,
}

impl Default for CompactorWrap {
    fn default() -> Self {
        Self {
            running: false,
            generation: 0,
            next_attempt: None,
            delay_after_failure: FIRST_COMPACTOR_RETRY,
            excess_length: 0,
        }
    }
}

pub(super) struct DatabaseObject {
    base: PathBuf,
    path: PathBuf,
    version: i32,
    settings: Settings,
    weak: mpsc::WeakUnboundedSender<Command>,
    key: Option<EncryptionKey>,
    binlog: Option<EncryptedFile>,
    index: Index,
    removing: BTreeSet<Key>,
    accessed: BTreeSet<Key>,
    time: EstimatedTimePoint,
    binlog_excess_length: i64,
    /// Set when a compaction swap left no usable binlog; every further
    /// operation is rejected until the database is closed and reopened.
    broken: bool,
    write_bundles_at: Option<Instant>,
    prune_at: Option<Instant>,
    compactor: CompactorWrap,
    cleaner: Option<CancellationToken>,
}

/// Drive the command loop until the last handle is dropped.
pub(super) async fn run(mut rx: mpsc::UnboundedReceiver<Command>, mut object: DatabaseObject) {
    loop {
        tokio::select! {
            biased;

            command = rx.recv() => match command {
                Some(command) => object.handle(command),
                None => {
                    object.close_internal();
                    break;
                }
            },

            _ = sleep_until_or_never(object.write_bundles_at),
                if object.write_bundles_at.is_some() =>
            {
                object.write_bundles_at = None;
                object.write_bundles();
                object.check_compactor();
            }

            _ = sleep_until_or_never(object.prune_at), if object.prune_at.is_some() => {
                object.prune_at = None;
                object.prune();
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl DatabaseObject {
    pub(super) fn new(
        base: PathBuf,
        settings: Settings,
        weak: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let path = base.join("0");
        Self {
            base,
            path,
            version: 0,
            settings,
            weak,
            key: None,
            binlog: None,
            index: Index::default(),
            removing: BTreeSet::new(),
            accessed: BTreeSet::new(),
            time: EstimatedTimePoint::default(),
            binlog_excess_length: 0,
            broken: false,
            write_bundles_at: None,
            prune_at: None,
            compactor: CompactorWrap::default(),
            cleaner: None,
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Open { key, reply } => {
                let _ = reply.send(self.open(key));
            }
            Command::Put { key, value, reply } => {
                let _ = reply.send(self.put(&key, value));
            }
            Command::Get { key, reply } => {
                let _ = reply.send(self.get(&key));
            }
            Command::Remove { key, reply } => {
                self.remove_key(&key);
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                self.close_internal();
                let _ = reply.send(());
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::GetManyRaw { keys, reply } => {
                let _ = reply.send(self.get_many_raw(&keys));
            }
            Command::CompactorFinished { generation, result } => {
                self.compactor_finished(generation, result);
            }
            Command::CleanerFinished => {
                self.cleaner = None;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Open / close / clear
    // ─────────────────────────────────────────────────────────────────────

    fn open(&mut self, key: EncryptionKey) -> Result<()> {
        if self.binlog.is_some() {
            return Err(Error::io_other(&self.base, "database is already open"));
        }
        self.broken = false;
        let current = version::read_version(&self.base).unwrap_or(0);
        match self.open_binlog(current, Mode::ReadAppend, &key) {
            Ok(()) => Ok(()),
            Err(OpenError::LockFailed) => Err(Error::LockFailed {
                path: self.binlog_path_for(current),
            }),
            Err(OpenError::WrongKey) => Err(Error::WrongKey {
                path: self.binlog_path_for(current),
            }),
            Err(OpenError::Io(source)) => {
                debug!(
                    version = current,
                    %source,
                    "binlog unreadable, starting a fresh version"
                );
                let available = version::find_available_version(&self.base);
                version::write_version(&self.base, available)
                    .map_err(|error| Error::io(version::version_path(&self.base), error))?;
                self.open_binlog(available, Mode::Write, &key)
                    .map_err(|error| match error {
                        OpenError::LockFailed => Error::LockFailed {
                            path: self.binlog_path_for(available),
                        },
                        OpenError::WrongKey => Error::WrongKey {
                            path: self.binlog_path_for(available),
                        },
                        OpenError::Io(source) => {
                            Error::io(self.binlog_path_for(available), source)
                        }
                    })
            }
        }
    }

    fn open_binlog(
        &mut self,
        version: i32,
        mode: Mode,
        key: &EncryptionKey,
    ) -> std::result::Result<(), OpenError> {
        let dir = self.base.join(version.to_string());
        fs::create_dir_all(&dir)?;

        let ready = dir.join(READY_FILENAME);
        let binlog_path = dir.join(BINLOG_FILENAME);
        if ready.exists() {
            fs::rename(&ready, &binlog_path)?;
            info!(path = %binlog_path.display(), "completed an interrupted compaction swap");
        }

        let mut binlog = EncryptedFile::open(&binlog_path, mode, key)?;
        let header_present = mode == Mode::ReadAppend && binlog.size() > 0;
        if header_present {
            self.read_header(&mut binlog)?;
        } else {
            self.write_header(&mut binlog)?;
        }

        self.version = version;
        self.path = dir;
        self.key = Some(key.clone());
        self.binlog = Some(binlog);
        self.create_cleaner();
        self.read_binlog();
        Ok(())
    }

    fn read_header(&mut self, binlog: &mut EncryptedFile) -> std::result::Result<(), OpenError> {
        let mut bytes = [0u8; HEADER_SIZE];
        if binlog.read(&mut bytes)? != HEADER_SIZE {
            return Err(bad_binlog("binlog header is short"));
        }
        let header = BinlogHeader::decode(&bytes).ok_or_else(|| bad_binlog("bad binlog header"))?;
        if header.track_estimated_time() != self.settings.track_estimated_time {
            return Err(bad_binlog("binlog time-tracking flag mismatch"));
        }
        self.time = EstimatedTimePoint {
            system: header.system_time,
            relative: header.system_time.max(0) as u64,
        };
        Ok(())
    }

    fn write_header(&mut self, binlog: &mut EncryptedFile) -> std::result::Result<(), OpenError> {
        let now = if self.settings.track_estimated_time {
            unixtime()
        } else {
            0
        };
        self.time = EstimatedTimePoint {
            system: now,
            relative: now.max(0) as u64,
        };
        let flags = if self.settings.track_estimated_time {
            FLAG_TRACK_ESTIMATED_TIME
        } else {
            0
        };
        binlog.write(
            &BinlogHeader {
                flags,
                system_time: now,
            }
            .encode(),
        )?;
        binlog.flush()?;
        Ok(())
    }

    fn read_binlog(&mut self) {
        let Some(mut binlog) = self.binlog.take() else {
            return;
        };
        let mut valid_end = HEADER_SIZE as u64;
        {
            let mut reader = BinlogReader::new(&mut binlog, &self.settings, None);
            while let Some(parsed) = reader.next_record() {
                let applied = match parsed.record {
                    Record::Store(entry) => self.process_record_store(entry),
                    Record::MultiStore(entries) => {
                        // Whole-record application: a bad part rejects the
                        // bundle before any of it reaches the index.
                        let legal = entries.iter().all(|entry| {
                            entry.size > 0
                                && entry.size as usize <= self.settings.max_data_size
                        });
                        if legal {
                            for entry in entries {
                                let applied = self.process_record_store(entry);
                                debug_assert!(applied);
                            }
                        }
                        legal
                    }
                    Record::MultiRemove(keys) => {
                        self.binlog_excess_length +=
                            (MULTI_REMOVE_HEADER_SIZE + keys.len() * KEY_WIRE_SIZE) as i64;
                        for key in keys {
                            self.index.erase(&key);
                        }
                        true
                    }
                    Record::MultiAccess { time, keys } => {
                        self.apply_time_point(time);
                        self.binlog_excess_length +=
                            (MULTI_ACCESS_HEADER_SIZE + keys.len() * KEY_WIRE_SIZE) as i64;
                        for key in keys {
                            self.index.set_use_time(&key, time.relative);
                        }
                        true
                    }
                };
                if applied {
                    valid_end = parsed.end;
                } else {
                    warn!(
                        offset = parsed.start,
                        "stopping replay at a record with an impossible size"
                    );
                    break;
                }
            }
        }
        let size = binlog.size();
        if valid_end < size {
            warn!(
                valid_end,
                size,
                path = %self.binlog_path().display(),
                "dropping torn binlog tail"
            );
            if let Err(error) = binlog.truncate(valid_end) {
                warn!(%error, "failed to truncate binlog tail");
            }
        }
        if let Err(error) = binlog.seek(valid_end) {
            warn!(%error, "failed to seek binlog to its end");
        }
        self.binlog = Some(binlog);

        debug!(
            entries = self.index.len(),
            total_size = self.index.total_size(),
            excess = self.binlog_excess_length,
            "binlog replay complete"
        );
        self.adjust_relative_time();
        self.optimize();
    }

    fn close_internal(&mut self) {
        if self.binlog.is_some() {
            self.write_bundles();
        }
        if let Some(cancel) = self.cleaner.take() {
            cancel.cancel();
        }
        self.compactor.running = false;
        self.compactor.generation += 1;
        self.compactor.next_attempt = None;
        self.compactor.delay_after_failure = FIRST_COMPACTOR_RETRY;
        self.binlog = None;
        self.key = None;
        self.index.clear();
        self.removing.clear();
        self.accessed.clear();
        self.binlog_excess_length = 0;
        self.write_bundles_at = None;
        self.prune_at = None;
        self.broken = false;
        self.time = EstimatedTimePoint::default();
    }

    fn clear(&mut self) -> Result<()> {
        if self.key.is_some() || self.binlog.is_some() {
            return Err(Error::io_other(&self.base, "clear requires a closed database"));
        }
        let available = version::find_available_version(&self.base);
        version::write_version(&self.base, available)
            .map_err(|error| Error::io(version::version_path(&self.base), error))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────

    fn put(&mut self, key: &Key, value: TaggedValue) -> Result<()> {
        if self.broken {
            return Err(Error::io_other(self.binlog_path(), "database is failed"));
        }
        if self.binlog.is_none() {
            return Err(Error::io_other(&self.base, "database is not open"));
        }
        if value.bytes.is_empty() {
            self.remove_key(key);
            return Ok(());
        }
        if value.bytes.len() > self.settings.max_data_size {
            return Err(Error::io_other(
                self.binlog_path(),
                "value exceeds max_data_size",
            ));
        }
        self.removing.remove(key);

        let checksum = xxh32(&value.bytes, 0);
        let Some(place_path) = self.write_key_place(key, &value, checksum)? else {
            // Bit-identical overwrite: no disk traffic, only an access.
            self.record_entry_access(key);
            return Ok(());
        };

        if let Some(parent) = place_path.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                self.remove_key(key);
                return Err(Error::io(place_path, error));
            }
        }
        let file_key = match self.key.as_ref() {
            Some(file_key) => file_key.clone(),
            None => {
                self.remove_key(key);
                return Err(Error::io_other(&self.base, "database is not open"));
            }
        };
        let mut data = match EncryptedFile::open(&place_path, Mode::Write, &file_key) {
            Ok(data) => data,
            Err(OpenError::LockFailed) => {
                self.remove_key(key);
                return Err(Error::LockFailed { path: place_path });
            }
            Err(OpenError::Io(source)) => {
                self.remove_key(key);
                return Err(Error::io(place_path, source));
            }
            Err(OpenError::WrongKey) => {
                self.remove_key(key);
                return Err(Error::io_other(place_path, "value file key mismatch"));
            }
        };
        if let Err(error) = data
            .write_with_padding(&value.bytes)
            .and_then(|()| data.flush())
        {
            drop(data);
            // The binlog already claims the entry exists; retract it to
            // restore file/index parity.
            self.remove_key(key);
            return Err(Error::io(place_path, error));
        }
        self.optimize();
        Ok(())
    }

    /// Append the store record and apply it to the index.
    ///
    /// Returns the value-file path to write, or `None` when the stored
    /// entry is already bit-identical and the write was suppressed.
    fn write_key_place(
        &mut self,
        key: &Key,
        value: &TaggedValue,
        checksum: u32,
    ) -> Result<Option<PathBuf>> {
        let size = value.bytes.len() as i32;
        let time = if self.settings.track_estimated_time {
            let mut point = self.count_time_point();
            let advance_ms = (point.relative - self.time.relative).saturating_mul(1000);
            if advance_ms < self.settings.write_bundle_delay.as_millis() as u64 {
                // Bucket nearby timestamps: fewer distinct use times keeps
                // the minimal-time multiplicity useful.
                point = self.time;
            }
            Some(point)
        } else {
            None
        };

        let existing = self
            .index
            .get(key)
            .map(|entry| (entry.place, entry.tag, entry.size, entry.checksum));
        let place = match existing {
            Some((place, tag, stored_size, stored_checksum)) => {
                if tag == value.tag && stored_size == size && stored_checksum == checksum {
                    let stored = self.read_value_data(place, stored_size);
                    if stored.as_deref() == Some(value.bytes.as_slice()) {
                        return Ok(None);
                    }
                }
                place
            }
            None => self.find_free_place()?,
        };

        let entry = StoreEntry {
            key: *key,
            place,
            tag: value.tag,
            size,
            checksum,
            time,
        };
        let encoded = format::encode_store(&entry);
        let binlog_path = self.binlog_path();
        let Some(binlog) = self.binlog.as_mut() else {
            return Err(Error::io_other(&self.base, "database is not open"));
        };
        binlog
            .write(&encoded)
            .and_then(|()| binlog.flush())
            .map_err(|error| Error::io(binlog_path, error))?;

        let applied = self.process_record_store(entry);
        debug_assert!(applied);
        Ok(Some(self.place_path(place)))
    }

    fn find_free_place(&self) -> Result<PlaceId> {
        for _ in 0..FREE_PLACE_ATTEMPTS {
            let place: PlaceId = rand::random();
            if !self.place_path(place).exists() {
                return Ok(place);
            }
        }
        Err(Error::io_other(
            self.path.clone(),
            "could not draw a free value place",
        ))
    }

    /// Apply a store record to the index; the same path serves replay and
    /// live writes so memory and log agree by construction.
    fn process_record_store(&mut self, entry: StoreEntry) -> bool {
        if entry.size <= 0 || entry.size as usize > self.settings.max_data_size {
            return false;
        }
        let use_time = match entry.time {
            Some(point) => {
                self.apply_time_point(point);
                point.relative
            }
            None => self.time.relative,
        };
        let replaced = self.index.insert(
            entry.key,
            Entry {
                place: entry.place,
                tag: entry.tag,
                checksum: entry.checksum,
                size: entry.size,
                use_time,
            },
        );
        if replaced {
            // The superseded record is now dead weight in the log.
            self.binlog_excess_length +=
                format::store_record_size(self.settings.track_estimated_time) as i64;
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read path
    // ─────────────────────────────────────────────────────────────────────

    fn get(&mut self, key: &Key) -> Option<Vec<u8>> {
        if self.broken || self.removing.contains(key) {
            return None;
        }
        let entry = self.index.get(key)?.clone();
        let data = self.read_value_data(entry.place, entry.size)?;
        if xxh32(&data, 0) != entry.checksum {
            return None;
        }
        self.record_entry_access(key);
        Some(data)
    }

    fn read_value_data(&self, place: PlaceId, size: i32) -> Option<Vec<u8>> {
        let path = self.place_path(place);
        let key = self.key.as_ref()?;
        let mut file = EncryptedFile::open(&path, Mode::Read, key).ok()?;
        file.read_with_padding(size as usize).ok()
    }

    fn record_entry_access(&mut self, key: &Key) {
        if !self.settings.track_estimated_time {
            return;
        }
        self.accessed.insert(*key);
        self.write_multi_access_lazy();
        self.optimize();
    }

    fn get_many_raw(&self, keys: &[Key]) -> Vec<RawEntry> {
        keys.iter()
            .filter_map(|key| {
                self.index.get(key).map(|entry| RawEntry {
                    key: *key,
                    tag: entry.tag,
                    size: entry.size,
                    checksum: entry.checksum,
                    use_time: entry.use_time,
                })
            })
            .collect()
    }

    fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            is_open: self.binlog.is_some(),
            version: self.version,
            entries: self.index.len(),
            total_size: self.index.total_size(),
            binlog_size: self.binlog.as_ref().map(EncryptedFile::size).unwrap_or(0),
            binlog_excess_length: self.binlog_excess_length,
            minimal_entry_time: self.index.minimal_entry_time(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Remove path and bundlers
    // ─────────────────────────────────────────────────────────────────────

    fn remove_key(&mut self, key: &Key) {
        let Some(entry) = self.index.get(key).cloned() else {
            return;
        };
        self.removing.insert(*key);
        self.write_multi_remove_lazy();

        let path = self.place_path(entry.place);
        self.index.erase(key);
        let _ = fs::remove_file(path);
    }

    fn write_bundles_lazy(&mut self) {
        if self.write_bundles_at.is_none() {
            self.write_bundles_at = Some(Instant::now() + self.settings.write_bundle_delay);
        }
    }

    fn write_multi_remove_lazy(&mut self) {
        if self.removing.len() >= self.settings.max_bundled_records {
            self.write_multi_remove();
        } else {
            self.write_bundles_lazy();
        }
    }

    fn write_multi_remove(&mut self) {
        if self.removing.is_empty() {
            return;
        }
        let keys: Vec<Key> = mem::take(&mut self.removing).into_iter().collect();
        let encoded = format::encode_multi_remove(&keys);
        let binlog_path = self.binlog_path();
        let Some(binlog) = self.binlog.as_mut() else {
            return;
        };
        match binlog.write(&encoded).and_then(|()| binlog.flush()) {
            Ok(()) => self.binlog_excess_length += encoded.len() as i64,
            Err(error) => {
                warn!(path = %binlog_path.display(), %error, "failed to write remove bundle");
            }
        }
    }

    fn write_multi_access_lazy(&mut self) {
        if self.accessed.len() >= self.settings.max_bundled_records {
            self.write_multi_access();
        } else {
            self.write_bundles_lazy();
        }
    }

    fn write_multi_access(&mut self) {
        if !self.accessed.is_empty() {
            self.write_multi_access_block();
        }
    }

    /// Write a MultiAccess record with the staged keys (possibly none)
    /// and the freshest time point, which also becomes the new clock.
    fn write_multi_access_block(&mut self) {
        let time = self.count_time_point();
        let keys: Vec<Key> = mem::take(&mut self.accessed).into_iter().collect();
        self.time = time;
        for key in &keys {
            self.index.set_use_time(key, time.relative);
        }

        let encoded = format::encode_multi_access(time, &keys);
        let binlog_path = self.binlog_path();
        let Some(binlog) = self.binlog.as_mut() else {
            return;
        };
        match binlog.write(&encoded).and_then(|()| binlog.flush()) {
            Ok(()) => self.binlog_excess_length += encoded.len() as i64,
            Err(error) => {
                warn!(path = %binlog_path.display(), %error, "failed to write access bundle");
            }
        }
    }

    fn write_bundles(&mut self) {
        self.write_multi_remove();
        if self.settings.track_estimated_time {
            self.write_multi_access();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Clock
    // ─────────────────────────────────────────────────────────────────────

    fn apply_time_point(&mut self, point: EstimatedTimePoint) {
        if point.relative > self.time.relative {
            self.time = point;
        }
    }

    fn count_relative_time(&self) -> u64 {
        self.time.count_relative(unixtime())
    }

    fn count_time_point(&self) -> EstimatedTimePoint {
        let now = unixtime();
        EstimatedTimePoint {
            system: now,
            relative: self.time.count_relative(now),
        }
    }

    pub(super) fn prune_before_time(&self) -> u64 {
        let relative = self.count_relative_time();
        if self.settings.total_time_limit != 0 && relative > self.settings.total_time_limit {
            relative - self.settings.total_time_limit
        } else {
            0
        }
    }

    /// After replay: if the wall clock moved backwards across sessions,
    /// pin the authoritative time point into the binlog so later records
    /// keep a consistent basis. Forward jumps need no record.
    fn adjust_relative_time(&mut self) {
        if !self.settings.track_estimated_time {
            return;
        }
        if unixtime() < self.time.system {
            info!("wall clock moved backwards, pinning the relative clock");
            self.write_multi_access_block();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────

    /// Decide between pruning and compaction after any mutation.
    fn optimize(&mut self) {
        if !self.start_delayed_pruning() {
            self.check_compactor();
        }
    }

    /// Arm the prune timer if pruning is or will be needed.
    ///
    /// Returns whether pruning is needed now.
    fn start_delayed_pruning(&mut self) -> bool {
        if !self.settings.track_estimated_time || self.index.is_empty() {
            return false;
        }
        let before = self.prune_before_time();
        let minimal = self.index.minimal_entry_time();
        let pruning = (self.settings.total_size_limit > 0
            && self.index.total_size() > self.settings.total_size_limit)
            || (minimal != 0 && minimal <= before);
        if pruning {
            let now = Instant::now();
            let rearm = match self.prune_at {
                None => true,
                Some(at) => at.saturating_duration_since(now) > self.settings.prune_timeout,
            };
            if rearm {
                self.prune_at = Some(now + self.settings.prune_timeout);
            }
            true
        } else {
            if minimal != 0 && self.prune_at.is_none() {
                let seconds = minimal - before;
                let wait = Duration::from_secs(seconds).min(self.settings.max_prune_check_timeout);
                self.prune_at = Some(Instant::now() + wait);
            }
            false
        }
    }

    fn prune(&mut self) {
        if self.broken || self.binlog.is_none() {
            return;
        }
        let mut stale = BTreeSet::new();
        let mut stale_total_size = 0i64;
        self.collect_time_prune(&mut stale, &mut stale_total_size);
        self.collect_size_prune(&mut stale, &mut stale_total_size);
        if !stale.is_empty() {
            debug!(
                count = stale.len(),
                bytes = stale_total_size,
                "evicting stale entries"
            );
        }
        for key in stale {
            self.remove_key(&key);
        }
        self.optimize();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Compactor driver
    // ─────────────────────────────────────────────────────────────────────

    fn check_compactor(&mut self) {
        if self.broken || self.compactor.running || self.settings.compact_after_excess == 0 {
            return;
        }
        let Some(binlog) = self.binlog.as_ref() else {
            return;
        };
        let excess = self.binlog_excess_length.max(0) as u64;
        if excess < self.settings.compact_after_excess {
            return;
        }
        if self.settings.compact_after_full_size != 0
            && excess.saturating_mul(self.settings.compact_after_full_size)
                < self.settings.compact_after_excess.saturating_mul(binlog.size())
        {
            return;
        }
        if let Some(at) = self.compactor.next_attempt {
            if Instant::now() < at {
                return;
            }
        }
        let Some(key) = self.key.clone() else {
            return;
        };

        self.compactor.running = true;
        self.compactor.generation += 1;
        self.compactor.excess_length = self.binlog_excess_length;
        let generation = self.compactor.generation;
        let info = CompactorInfo {
            till: binlog.size(),
            time: if self.settings.track_estimated_time {
                self.count_time_point()
            } else {
                self.time
            },
        };
        info!(
            excess = self.binlog_excess_length,
            binlog_size = binlog.size(),
            "starting binlog compaction"
        );

        let binlog_path = self.binlog_path();
        let side_path = self.side_path();
        let settings = self.settings.clone();
        let weak = self.weak.clone();
        tokio::task::spawn_blocking(move || {
            let result = compactor::compact(&binlog_path, &side_path, &key, &settings, &info);
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::CompactorFinished { generation, result });
            }
        });
    }

    fn compactor_finished(&mut self, generation: u64, result: std::io::Result<u64>) {
        if generation != self.compactor.generation || !self.compactor.running {
            // A run abandoned by close; its side file is stale.
            if !self.compactor.running {
                let _ = fs::remove_file(self.side_path());
            }
            return;
        }
        self.compactor.running = false;

        let read_till = match result {
            Ok(read_till) => read_till,
            Err(error) => {
                warn!(%error, "binlog rewrite failed");
                return self.compactor_fail();
            }
        };
        let Some(binlog) = self.binlog.as_ref() else {
            return self.compactor_fail();
        };
        let size = binlog.size();
        let side = self.side_path();
        let binlog_path = self.binlog_path();

        if read_till != size {
            let Some(key) = self.key.clone() else {
                return self.compactor_fail();
            };
            match compactor::catch_up(&side, &binlog_path, &key, read_till, &self.settings) {
                Ok(caught) if caught == size => {}
                Ok(_) | Err(_) => {
                    warn!("compaction catch-up could not reach the live binlog size");
                    return self.compactor_fail();
                }
            }
        }

        let ready = self.compact_ready_path();
        if let Err(error) = fs::rename(&side, &ready) {
            warn!(%error, "failed to stage the compacted binlog");
            return self.compactor_fail();
        }

        // Past this point the live binlog is closed; failures leave the
        // database unusable for the rest of the session.
        self.binlog = None;
        if let Err(error) = fs::rename(&ready, &binlog_path) {
            error!(%error, "compaction swap failed after closing the binlog");
            self.broken = true;
            return self.compactor_fail();
        }
        let Some(key) = self.key.clone() else {
            self.broken = true;
            return;
        };
        match EncryptedFile::open(&binlog_path, Mode::ReadAppend, &key) {
            Ok(mut file) => {
                let end = file.size();
                if let Err(error) = file.seek(end) {
                    error!(%error, "failed to position the compacted binlog");
                    self.broken = true;
                    return;
                }
                self.binlog = Some(file);
                self.binlog_excess_length -= self.compactor.excess_length;
                debug_assert!(self.binlog_excess_length >= 0);
                self.binlog_excess_length = self.binlog_excess_length.max(0);
                self.compactor.excess_length = 0;
                self.compactor.next_attempt = None;
                self.compactor.delay_after_failure = FIRST_COMPACTOR_RETRY;
                info!(new_size = end, "binlog compaction complete");
            }
            Err(_) => {
                error!("failed to reopen the binlog after a compaction swap");
                self.broken = true;
            }
        }
    }

    fn compactor_fail(&mut self) {
        self.compactor.running = false;
        let delay = self.compactor.delay_after_failure;
        self.compactor.next_attempt = Some(Instant::now() + delay);
        self.compactor.delay_after_failure = (delay * 2).min(MAX_COMPACTOR_RETRY);
        let _ = fs::remove_file(self.side_path());
        let _ = fs::remove_file(self.compact_ready_path());
        warn!(retry_in = ?delay, "binlog compaction abandoned");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cleaner
    // ─────────────────────────────────────────────────────────────────────

    fn create_cleaner(&mut self) {
        if let Some(previous) = self.cleaner.take() {
            previous.cancel();
        }
        let cancel = CancellationToken::new();
        self.cleaner = Some(cancel.clone());
        let base = self.base.clone();
        let active = self.version;
        let weak = self.weak.clone();
        tokio::spawn(async move {
            cleaner::run(base, active, cancel).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::CleanerFinished);
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Paths
    // ─────────────────────────────────────────────────────────────────────

    pub(super) fn index(&self) -> &Index {
        &self.index
    }

    pub(super) fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    pub(super) fn settings(&self) -> &Settings {
        &self.settings
    }

    fn binlog_path(&self) -> PathBuf {
        self.path.join(BINLOG_FILENAME)
    }

    fn binlog_path_for(&self, version: i32) -> PathBuf {
        self.base.join(version.to_string()).join(BINLOG_FILENAME)
    }

    fn side_path(&self) -> PathBuf {
        self.path.join(SIDE_FILENAME)
    }

    fn compact_ready_path(&self) -> PathBuf {
        self.path.join(READY_FILENAME)
    }

    fn place_path(&self, place: PlaceId) -> PathBuf {
        self.path.join(place_name(place))
    }
}

fn bad_binlog(message: &str) -> OpenError {
    OpenError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.to_string(),
    ))
}

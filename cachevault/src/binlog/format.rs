//! Binlog record layouts.
//!
//! All fields are little-endian and every record variant has a fixed size
//! computable from its first four bytes. Whether the timed variants are
//! legal is frozen in the header flags: a database either tracks estimated
//! time (StoreWithTime, MultiStoreWithTime, MultiAccess) or it does not
//! (Store, MultiStore); MultiRemove is always legal.

use crate::key::{Key, PlaceId};
use crate::time::EstimatedTimePoint;

pub(crate) const HEADER_SIZE: usize = 16;
const HEADER_MAGIC: [u8; 4] = *b"CVLT";
const HEADER_FORMAT: u32 = 0;

/// Header flag: the database records last-use times.
pub(crate) const FLAG_TRACK_ESTIMATED_TIME: u32 = 1 << 0;

pub(crate) const TYPE_STORE: u8 = 0x01;
pub(crate) const TYPE_STORE_WITH_TIME: u8 = 0x02;
pub(crate) const TYPE_MULTI_STORE: u8 = 0x03;
pub(crate) const TYPE_MULTI_STORE_WITH_TIME: u8 = 0x04;
pub(crate) const TYPE_MULTI_REMOVE: u8 = 0x05;
pub(crate) const TYPE_MULTI_ACCESS: u8 = 0x06;

pub(crate) const KEY_WIRE_SIZE: usize = 16;
pub(crate) const TIME_POINT_SIZE: usize = 12;
pub(crate) const STORE_SIZE: usize = 32;
pub(crate) const STORE_WITH_TIME_SIZE: usize = STORE_SIZE + TIME_POINT_SIZE;
pub(crate) const MULTI_STORE_HEADER_SIZE: usize = 4;
pub(crate) const MULTI_REMOVE_HEADER_SIZE: usize = 4;
pub(crate) const MULTI_ACCESS_HEADER_SIZE: usize = 4 + TIME_POINT_SIZE;

/// Size of one store record in the active variant.
pub(crate) fn store_record_size(track: bool) -> usize {
    if track {
        STORE_WITH_TIME_SIZE
    } else {
        STORE_SIZE
    }
}

/// The binlog file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BinlogHeader {
    pub(crate) flags: u32,
    pub(crate) system_time: i32,
}

impl BinlogHeader {
    pub(crate) fn track_estimated_time(&self) -> bool {
        self.flags & FLAG_TRACK_ESTIMATED_TIME != 0
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&HEADER_MAGIC);
        bytes[4..8].copy_from_slice(&HEADER_FORMAT.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.system_time.to_le_bytes());
        bytes
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || bytes[..4] != HEADER_MAGIC {
            return None;
        }
        if read_u32(&bytes[4..8]) != HEADER_FORMAT {
            return None;
        }
        Some(Self {
            flags: read_u32(&bytes[8..12]),
            system_time: read_u32(&bytes[12..16]) as i32,
        })
    }
}

/// One stored entry as carried by a store record or multi-store part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoreEntry {
    pub(crate) key: Key,
    pub(crate) place: PlaceId,
    pub(crate) tag: u8,
    pub(crate) size: i32,
    pub(crate) checksum: u32,
    pub(crate) time: Option<EstimatedTimePoint>,
}

/// A decoded binlog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Store(StoreEntry),
    MultiStore(Vec<StoreEntry>),
    MultiRemove(Vec<Key>),
    MultiAccess {
        time: EstimatedTimePoint,
        keys: Vec<Key>,
    },
}

/// Result of attempting to decode one record from a byte window.
#[derive(Debug)]
pub(crate) enum Parsed {
    /// The window ends before the record does.
    NeedMore,
    /// The bytes are not a legal record; replay must stop here.
    Invalid,
    /// A complete record and the bytes it consumed.
    Record { record: Record, consumed: usize },
}

/// Decode the record starting at `data[0]`.
pub(crate) fn parse_record(data: &[u8], track: bool, max_bundled: usize) -> Parsed {
    let Some(&kind) = data.first() else {
        return Parsed::NeedMore;
    };
    match kind {
        TYPE_STORE if !track => parse_store(data, false),
        TYPE_STORE_WITH_TIME if track => parse_store(data, true),
        TYPE_MULTI_STORE if !track => parse_multi_store(data, false, max_bundled),
        TYPE_MULTI_STORE_WITH_TIME if track => parse_multi_store(data, true, max_bundled),
        TYPE_MULTI_REMOVE => parse_multi_remove(data, max_bundled),
        TYPE_MULTI_ACCESS if track => parse_multi_access(data, max_bundled),
        _ => Parsed::Invalid,
    }
}

fn parse_store(data: &[u8], with_time: bool) -> Parsed {
    let size = store_record_size(with_time);
    if data.len() < size {
        return Parsed::NeedMore;
    }
    Parsed::Record {
        record: Record::Store(decode_store_part(&data[..size], with_time)),
        consumed: size,
    }
}

fn parse_multi_store(data: &[u8], with_time: bool, max_bundled: usize) -> Parsed {
    if data.len() < MULTI_STORE_HEADER_SIZE {
        return Parsed::NeedMore;
    }
    let count = read_u24(&data[1..4]);
    if count > max_bundled {
        return Parsed::Invalid;
    }
    let part = store_record_size(with_time);
    let total = MULTI_STORE_HEADER_SIZE + count * part;
    if data.len() < total {
        return Parsed::NeedMore;
    }
    let entries = data[MULTI_STORE_HEADER_SIZE..total]
        .chunks_exact(part)
        .map(|chunk| decode_store_part(chunk, with_time))
        .collect();
    Parsed::Record {
        record: Record::MultiStore(entries),
        consumed: total,
    }
}

fn parse_multi_remove(data: &[u8], max_bundled: usize) -> Parsed {
    if data.len() < MULTI_REMOVE_HEADER_SIZE {
        return Parsed::NeedMore;
    }
    let count = read_u24(&data[1..4]);
    if count > max_bundled {
        return Parsed::Invalid;
    }
    let total = MULTI_REMOVE_HEADER_SIZE + count * KEY_WIRE_SIZE;
    if data.len() < total {
        return Parsed::NeedMore;
    }
    let keys = data[MULTI_REMOVE_HEADER_SIZE..total]
        .chunks_exact(KEY_WIRE_SIZE)
        .map(Key::from_bytes)
        .collect();
    Parsed::Record {
        record: Record::MultiRemove(keys),
        consumed: total,
    }
}

fn parse_multi_access(data: &[u8], max_bundled: usize) -> Parsed {
    if data.len() < MULTI_ACCESS_HEADER_SIZE {
        return Parsed::NeedMore;
    }
    let count = read_u24(&data[1..4]);
    if count > max_bundled {
        return Parsed::Invalid;
    }
    let time = decode_time_point(&data[4..4 + TIME_POINT_SIZE]);
    let total = MULTI_ACCESS_HEADER_SIZE + count * KEY_WIRE_SIZE;
    if data.len() < total {
        return Parsed::NeedMore;
    }
    let keys = data[MULTI_ACCESS_HEADER_SIZE..total]
        .chunks_exact(KEY_WIRE_SIZE)
        .map(Key::from_bytes)
        .collect();
    Parsed::Record {
        record: Record::MultiAccess { time, keys },
        consumed: total,
    }
}

/// Encode a single Store / StoreWithTime record.
pub(crate) fn encode_store(entry: &StoreEntry) -> Vec<u8> {
    let kind = if entry.time.is_some() {
        TYPE_STORE_WITH_TIME
    } else {
        TYPE_STORE
    };
    let mut out = Vec::with_capacity(store_record_size(entry.time.is_some()));
    encode_store_part(entry, kind, &mut out);
    out
}

/// Encode a MultiStore / MultiStoreWithTime record.
pub(crate) fn encode_multi_store(entries: &[StoreEntry], track: bool) -> Vec<u8> {
    let kind = if track {
        TYPE_MULTI_STORE_WITH_TIME
    } else {
        TYPE_MULTI_STORE
    };
    let mut out =
        Vec::with_capacity(MULTI_STORE_HEADER_SIZE + entries.len() * store_record_size(track));
    out.push(kind);
    write_u24(&mut out, entries.len());
    for entry in entries {
        encode_store_part(entry, 0, &mut out);
    }
    out
}

/// Encode a MultiRemove record.
pub(crate) fn encode_multi_remove(keys: &[Key]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MULTI_REMOVE_HEADER_SIZE + keys.len() * KEY_WIRE_SIZE);
    out.push(TYPE_MULTI_REMOVE);
    write_u24(&mut out, keys.len());
    for key in keys {
        out.extend_from_slice(&key.to_bytes());
    }
    out
}

/// Encode a MultiAccess record; zero keys is legal and pins the clock.
pub(crate) fn encode_multi_access(time: EstimatedTimePoint, keys: &[Key]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MULTI_ACCESS_HEADER_SIZE + keys.len() * KEY_WIRE_SIZE);
    out.push(TYPE_MULTI_ACCESS);
    write_u24(&mut out, keys.len());
    encode_time_point(time, &mut out);
    for key in keys {
        out.extend_from_slice(&key.to_bytes());
    }
    out
}

fn encode_store_part(entry: &StoreEntry, first_byte: u8, out: &mut Vec<u8>) {
    out.push(first_byte);
    out.push(entry.tag);
    out.extend_from_slice(&entry.place);
    write_u24(out, entry.size as usize);
    out.extend_from_slice(&entry.checksum.to_le_bytes());
    out.extend_from_slice(&entry.key.to_bytes());
    if let Some(time) = entry.time {
        encode_time_point(time, out);
    }
}

fn decode_store_part(data: &[u8], with_time: bool) -> StoreEntry {
    let mut place: PlaceId = [0u8; 7];
    place.copy_from_slice(&data[2..9]);
    let time = with_time.then(|| decode_time_point(&data[STORE_SIZE..STORE_WITH_TIME_SIZE]));
    StoreEntry {
        key: Key::from_bytes(&data[16..32]),
        place,
        tag: data[1],
        size: read_u24(&data[9..12]) as i32,
        checksum: read_u32(&data[12..16]),
        time,
    }
}

fn encode_time_point(time: EstimatedTimePoint, out: &mut Vec<u8>) {
    out.extend_from_slice(&time.system.to_le_bytes());
    out.extend_from_slice(&time.relative.to_le_bytes());
}

fn decode_time_point(data: &[u8]) -> EstimatedTimePoint {
    EstimatedTimePoint {
        system: read_u32(&data[..4]) as i32,
        relative: read_u64(&data[4..12]),
    }
}

fn write_u24(out: &mut Vec<u8>, value: usize) {
    debug_assert!(value < 1 << 24);
    out.push((value & 0xFF) as u8);
    out.push(((value >> 8) & 0xFF) as u8);
    out.push(((value >> 16) & 0xFF) as u8);
}

fn read_u24(data: &[u8]) -> usize {
    data[0] as usize | (data[1] as usize) << 8 | (data[2] as usize) << 16
}

fn read_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[..4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}

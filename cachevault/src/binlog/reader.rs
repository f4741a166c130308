//! Streaming binlog replay.
//!
//! [`BinlogReader`] pulls records out of an open binlog in
//! `read_block_size` chunks, growing its window when a bundle record spans
//! a chunk boundary. Iteration stops cleanly at the first torn record,
//! unrecognised record kind, or short read; the caller truncates the log
//! back to the end of the last good record.

use crate::crypto::EncryptedFile;
use crate::settings::Settings;

use super::format::{self, Parsed, Record};

/// A record together with the payload offsets it occupied.
#[derive(Debug)]
pub(crate) struct ParsedRecord {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) record: Record,
}

pub(crate) struct BinlogReader<'a> {
    file: &'a mut EncryptedFile,
    track: bool,
    max_bundled: usize,
    read_block: usize,
    till: u64,
    buf: Vec<u8>,
    pos: usize,
    window_start: u64,
    failed: bool,
    finished: bool,
}

impl<'a> BinlogReader<'a> {
    /// Start reading at the file's current offset, up to `till`
    /// (or the current payload size when `till` is `None`).
    pub(crate) fn new(
        file: &'a mut EncryptedFile,
        settings: &Settings,
        till: Option<u64>,
    ) -> Self {
        let till = till.unwrap_or_else(|| file.size());
        let window_start = file.offset();
        Self {
            file,
            track: settings.track_estimated_time,
            max_bundled: settings.max_bundled_records,
            read_block: settings.read_block_size,
            till,
            buf: Vec::new(),
            pos: 0,
            window_start,
            failed: false,
            finished: false,
        }
    }

    /// The next complete record, or `None` once the stream ends or breaks.
    pub(crate) fn next_record(&mut self) -> Option<ParsedRecord> {
        if self.finished {
            return None;
        }
        loop {
            match format::parse_record(&self.buf[self.pos..], self.track, self.max_bundled) {
                Parsed::NeedMore => {
                    if !self.fill() {
                        self.finished = true;
                        return None;
                    }
                }
                Parsed::Invalid => {
                    self.failed = true;
                    self.finished = true;
                    return None;
                }
                Parsed::Record { record, consumed } => {
                    let start = self.window_start + self.pos as u64;
                    self.pos += consumed;
                    return Some(ParsedRecord {
                        start,
                        end: start + consumed as u64,
                        record,
                    });
                }
            }
        }
    }

    /// Whether iteration stopped on bad data rather than a clean end.
    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    fn fill(&mut self) -> bool {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.window_start += self.pos as u64;
            self.pos = 0;
        }
        let file_position = self.window_start + self.buf.len() as u64;
        let remaining = self.till.saturating_sub(file_position);
        if remaining == 0 {
            return false;
        }
        let want = (self.read_block as u64).min(remaining) as usize;
        let mut chunk = vec![0u8; want];
        match self.file.read(&mut chunk) {
            Ok(0) | Err(_) => {
                self.failed = true;
                false
            }
            Ok(count) => {
                self.buf.extend_from_slice(&chunk[..count]);
                true
            }
        }
    }
}

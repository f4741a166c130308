//! Encrypted random-access file.
//!
//! On-disk layout:
//!
//! ```text
//! [magic 4][salt 64][encrypted header 64][encrypted payload ...]
//! ```
//!
//! The encrypted header carries the format number and a SHA-256 over the
//! key material, salt and header fields; a mismatch on open means the
//! caller supplied the wrong key. Offsets and sizes exposed by this type
//! are payload offsets: byte 0 is the first payload byte after the header.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::keystream::{EncryptionKey, Keystream, BLOCK_SIZE};

const MAGIC: [u8; 4] = *b"CVF0";
const SALT_SIZE: usize = 64;
const ENCRYPTED_HEADER_SIZE: usize = 64;
const CHECKSUM_SIZE: usize = 32;
const CONTENT_START: u64 = (4 + SALT_SIZE + ENCRYPTED_HEADER_SIZE) as u64;
const FILE_FORMAT: u32 = 0;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Read-only; no lock is taken.
    Read,
    /// Read existing content and append; takes an exclusive lock and
    /// creates the file (with a fresh header) if it does not exist.
    ReadAppend,
    /// Truncate and rewrite; takes an exclusive lock.
    Write,
}

/// Why an open failed.
#[derive(Debug)]
pub(crate) enum OpenError {
    Io(io::Error),
    LockFailed,
    WrongKey,
}

impl From<io::Error> for OpenError {
    fn from(error: io::Error) -> Self {
        OpenError::Io(error)
    }
}

/// An open encrypted file.
pub(crate) struct EncryptedFile {
    file: File,
    keystream: Keystream,
    offset: u64,
    size: u64,
}

impl EncryptedFile {
    pub(crate) fn open(
        path: &Path,
        mode: Mode,
        key: &EncryptionKey,
    ) -> Result<Self, OpenError> {
        match mode {
            Mode::Read => {
                let file = OpenOptions::new().read(true).open(path)?;
                Self::open_existing(file, key)
            }
            Mode::ReadAppend => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                lock_exclusive(&file)?;
                if file.metadata()?.len() == 0 {
                    Self::create_new(file, key)
                } else {
                    Self::open_existing(file, key)
                }
            }
            Mode::Write => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                lock_exclusive(&file)?;
                file.set_len(0)?;
                Self::create_new(file, key)
            }
        }
    }

    fn create_new(mut file: File, key: &EncryptionKey) -> Result<Self, OpenError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let keystream = key.keystream(&salt);

        let mut header = [0u8; ENCRYPTED_HEADER_SIZE];
        header[..4].copy_from_slice(&FILE_FORMAT.to_le_bytes());
        // reserved u32 + application version u64 + reserved bytes stay zero
        let checksum = header_checksum(key, &salt, &header);
        header[ENCRYPTED_HEADER_SIZE - CHECKSUM_SIZE..].copy_from_slice(&checksum);

        keystream.apply(&mut header, 0);

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&MAGIC)?;
        file.write_all(&salt)?;
        file.write_all(&header)?;

        Ok(Self {
            file,
            keystream,
            offset: 0,
            size: 0,
        })
    }

    fn open_existing(mut file: File, key: &EncryptionKey) -> Result<Self, OpenError> {
        let total = file.metadata()?.len();
        if total < CONTENT_START {
            return Err(OpenError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated encrypted file header",
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(OpenError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "not an encrypted cache file",
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        file.read_exact(&mut salt)?;
        let keystream = key.keystream(&salt);

        let mut header = [0u8; ENCRYPTED_HEADER_SIZE];
        file.read_exact(&mut header)?;
        keystream.apply(&mut header, 0);

        let expected = header_checksum(key, &salt, &header);
        if header[ENCRYPTED_HEADER_SIZE - CHECKSUM_SIZE..] != expected {
            return Err(OpenError::WrongKey);
        }
        let mut format = [0u8; 4];
        format.copy_from_slice(&header[..4]);
        if u32::from_le_bytes(format) != FILE_FORMAT {
            return Err(OpenError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported encrypted file format",
            )));
        }

        Ok(Self {
            file,
            keystream,
            offset: 0,
            size: total - CONTENT_START,
        })
    }

    /// Payload size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Current payload offset.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Reposition to a payload offset.
    pub(crate) fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(CONTENT_START + offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Read up to `buf.len()` bytes, decrypting in place.
    ///
    /// Returns the number of bytes read; fewer than requested means the
    /// payload ended.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let count = self.file.read(&mut buf[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        self.keystream
            .apply(&mut buf[..filled], encryption_offset(self.offset));
        self.offset += filled as u64;
        Ok(filled)
    }

    /// Encrypt and write all of `bytes` at the current offset.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut encrypted = bytes.to_vec();
        self.keystream
            .apply(&mut encrypted, encryption_offset(self.offset));
        self.file.write_all(&encrypted)?;
        self.offset += bytes.len() as u64;
        self.size = self.size.max(self.offset);
        Ok(())
    }

    /// Read exactly `size` payload bytes written with padding.
    ///
    /// A short file is corruption and reported as an error.
    pub(crate) fn read_with_padding(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let padded = round_up_to_block(size);
        let mut buf = vec![0u8; padded];
        let count = self.read(&mut buf)?;
        if count < padded {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "padded value ended early",
            ));
        }
        buf.truncate(size);
        Ok(buf)
    }

    /// Write `bytes` followed by random padding up to the block size.
    pub(crate) fn write_with_padding(&mut self, bytes: &[u8]) -> io::Result<()> {
        let padded = round_up_to_block(bytes.len());
        let mut buf = Vec::with_capacity(padded);
        buf.extend_from_slice(bytes);
        let mut pad = vec![0u8; padded - bytes.len()];
        rand::thread_rng().fill_bytes(&mut pad);
        buf.extend_from_slice(&pad);
        self.write(&buf)
    }

    /// Cut the payload to `new_size` bytes.
    pub(crate) fn truncate(&mut self, new_size: u64) -> io::Result<()> {
        self.file.set_len(CONTENT_START + new_size)?;
        self.size = new_size;
        if self.offset > new_size {
            self.seek(new_size)?;
        }
        Ok(())
    }

    /// Push written data to the operating system.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

fn lock_exclusive(file: &File) -> Result<(), OpenError> {
    file.try_lock_exclusive().map_err(|error| {
        if error.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            OpenError::LockFailed
        } else {
            OpenError::Io(error)
        }
    })
}

fn header_checksum(key: &EncryptionKey, salt: &[u8], header: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(key.data());
    hasher.update(salt);
    hasher.update(&header[..ENCRYPTED_HEADER_SIZE - CHECKSUM_SIZE]);
    let digest = hasher.finalize();
    let mut checksum = [0u8; CHECKSUM_SIZE];
    checksum.copy_from_slice(&digest);
    checksum
}

fn encryption_offset(payload_offset: u64) -> u64 {
    payload_offset + ENCRYPTED_HEADER_SIZE as u64
}

fn round_up_to_block(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

//! Key material and the keystream cipher.
//!
//! Payload bytes are XORed with a keystream generated in fixed blocks:
//! block `i` is HMAC-SHA256(stream key, iv ‖ i). The stream key and iv are
//! derived from the caller's key material and the file's random salt, so
//! identical plaintext in two files never produces identical ciphertext.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;

/// Keystream block size; padded writes round up to this.
pub(crate) const BLOCK_SIZE: usize = 32;

const STREAM_KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// Caller-supplied key material for a database.
///
/// Held in memory only between `open` and `close`.
#[derive(Clone)]
pub struct EncryptionKey {
    data: Vec<u8>,
}

impl EncryptionKey {
    /// Required key material length in bytes.
    pub const SIZE: usize = 256;

    /// Wrap raw key material.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly [`Self::SIZE`] bytes.
    pub fn new(data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            Self::SIZE,
            "encryption key must be {} bytes",
            Self::SIZE
        );
        Self { data }
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// Derive the per-file cipher state from this key and a file salt.
    pub(crate) fn keystream(&self, salt: &[u8]) -> Keystream {
        let mut hasher = Sha512::new();
        hasher.update(&self.data);
        hasher.update(salt);
        let digest = hasher.finalize();

        let mut key = [0u8; STREAM_KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&digest[..STREAM_KEY_SIZE]);
        iv.copy_from_slice(&digest[STREAM_KEY_SIZE..STREAM_KEY_SIZE + IV_SIZE]);
        Keystream { key, iv }
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Per-file cipher state; encryption and decryption are the same XOR.
#[derive(Clone)]
pub(crate) struct Keystream {
    key: [u8; STREAM_KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl Keystream {
    /// XOR `data` with the keystream starting at byte `offset` of the
    /// encrypted region. Offsets need not be block-aligned.
    pub(crate) fn apply(&self, data: &mut [u8], offset: u64) {
        if data.is_empty() {
            return;
        }
        let mut index = offset / BLOCK_SIZE as u64;
        let mut skip = (offset % BLOCK_SIZE as u64) as usize;
        let mut done = 0usize;
        while done < data.len() {
            let block = self.block(index);
            let take = (BLOCK_SIZE - skip).min(data.len() - done);
            for i in 0..take {
                data[done + i] ^= block[skip + i];
            }
            done += take;
            skip = 0;
            index += 1;
        }
    }

    fn block(&self, index: u64) -> [u8; BLOCK_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&self.iv);
        mac.update(&index.to_le_bytes());
        let output = mac.finalize().into_bytes();
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&output);
        block
    }
}

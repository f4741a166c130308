//! Encrypted random-access file primitive.
//!
//! Every file the database touches (the binlog and each value file) is an
//! [`EncryptedFile`]: a plain magic, a random salt, an encrypted header
//! that authenticates the key, then the encrypted payload stream.

mod file;
mod keystream;

pub use keystream::EncryptionKey;

pub(crate) use file::{EncryptedFile, Mode, OpenError};

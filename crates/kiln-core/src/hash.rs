//! Content hashes for the blob store and the job cache.
//!
//! A [`ContentHash`] is a 256-bit BLAKE3 digest. Its canonical textual form is
//! 64 lowercase hex characters; the first two characters shard the blob
//! directory tree. The hash function is pinned by the job database schema
//! version, so swapping it out requires a schema migration.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Errors produced when decoding or computing a content hash.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hash length {0} (expected 64 hex characters)")]
    InvalidHexLength(usize),
    #[error("invalid hex character {0:?} in hash")]
    InvalidHexChar(char),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A 256-bit content digest, ordered byte-lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash an in-memory byte slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Hash the bytes of a string.
    #[must_use]
    pub fn from_string(data: &str) -> Self {
        Self::from_bytes(data.as_bytes())
    }

    /// Stream a file through the hash function in 8 KiB chunks.
    pub fn from_file(path: &Path) -> Result<Self, HashError> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 8192];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Parse the 64-character lowercase (or uppercase) hex form.
    pub fn from_hex(hex_str: &str) -> Result<Self, HashError> {
        if hex_str.len() != 64 {
            return Err(HashError::InvalidHexLength(hex_str.len()));
        }
        if let Some(bad) = hex_str.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHexChar(bad));
        }
        let mut bytes = [0u8; 32];
        // Infallible after the checks above.
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|_| HashError::InvalidHexLength(hex_str.len()))?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters, used as the shard directory name.
    #[must_use]
    pub fn prefix(&self) -> String {
        self.to_hex()[..2].to_string()
    }

    /// Remaining 62 hex characters, used as the blob file name.
    #[must_use]
    pub fn suffix(&self) -> String {
        self.to_hex()[2..].to_string()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

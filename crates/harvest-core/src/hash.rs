use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::{HarvestError, Result};

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// A 128-bit content digest, rendered as 32 lowercase hex characters.
///
/// Hash equality is treated as content equality throughout the engine;
/// the collision risk at this width is accepted as negligible.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    /// Digest an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        ContentHash(hasher.finalize().into())
    }

    /// Digest a file's full contents, streamed in fixed-size blocks.
    /// O(file size) — callers that loop over a whole store must report
    /// incremental progress.
    pub fn compute_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; READ_BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(ContentHash(hasher.finalize().into()))
    }

    /// Parse a 32-character lowercase (or mixed-case) hex string.
    pub fn parse_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input).map_err(|e| HarvestError::InvalidHash {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        let raw: [u8; 16] = bytes.try_into().map_err(|_| HarvestError::InvalidHash {
            input: input.to_string(),
            reason: format!("expected 32 hex characters, got {}", input.len()),
        })?;
        Ok(ContentHash(raw))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for the shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remaining 15 bytes as a 30-char hex string, used for the blob filename.
    pub fn shard_suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

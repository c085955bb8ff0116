use super::files::{read_optional, write_atomic};
use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

/// Next block height not yet scanned, stored as an unsigned varint.
pub struct CursorRepository {
    path: PathBuf,
}

impl CursorRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `None` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<u64>> {
        match read_optional(&self.path)? {
            Some(bytes) => decode_uvarint(&bytes).map(Some).ok_or_else(|| {
                anyhow::anyhow!("cursor file:{:?} holds no valid varint", self.path)
            }),
            None => Ok(None),
        }
    }

    /// Loads the cursor, creating the file with `initial` on first use.
    pub fn load_or_init(&self, initial: u64) -> Result<u64> {
        if let Some(cursor) = self.load()? {
            return Ok(cursor);
        }
        info!("Initializing cursor file {:?} at block {}", self.path, initial);
        self.store(initial)?;
        Ok(initial)
    }

    pub fn store(&self, block_number: u64) -> Result<()> {
        write_atomic(&self.path, &encode_uvarint(block_number))
    }
}

pub fn encode_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

/// Decodes the leading varint; trailing bytes are ignored.
pub fn decode_uvarint(bytes: &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        let bits = u64::from(byte & 0x7f);
        if i == 9 && *byte > 1 {
            return None;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

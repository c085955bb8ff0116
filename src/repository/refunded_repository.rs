use super::files::{read_optional, write_atomic};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;

/// Every address that ever received a refund, as a JSON array.
pub struct RefundedRepository {
    path: PathBuf,
}

impl RefundedRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<HashSet<Address>>> {
        let Some(bytes) = read_optional(&self.path)? else {
            return Ok(None);
        };
        let addresses: Vec<Address> = serde_json::from_slice(&bytes)
            .with_context(|| format!("refunded list:{:?} is not a JSON address array", self.path))?;
        Ok(Some(addresses.into_iter().collect()))
    }

    pub fn load_or_init(&self) -> Result<HashSet<Address>> {
        if let Some(refunded) = self.load()? {
            return Ok(refunded);
        }
        let empty = HashSet::new();
        self.store(&empty)?;
        Ok(empty)
    }

    pub fn store(&self, refunded: &HashSet<Address>) -> Result<()> {
        let mut addresses: Vec<&Address> = refunded.iter().collect();
        addresses.sort();
        let json = serde_json::to_vec_pretty(&addresses)?;
        write_atomic(&self.path, &json)
    }
}

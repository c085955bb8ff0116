use super::files::{read_optional, write_atomic};
use alloy_primitives::U256;
use anyhow::Result;
use std::path::PathBuf;

/// A cumulative wei total stored as minimal big-endian bytes (zero is an
/// empty file).
pub struct AmountRepository {
    path: PathBuf,
}

impl AmountRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<U256>> {
        match read_optional(&self.path)? {
            Some(bytes) => U256::try_from_be_slice(&bytes).map(Some).ok_or_else(|| {
                anyhow::anyhow!("amount file:{:?} exceeds 256 bits", self.path)
            }),
            None => Ok(None),
        }
    }

    /// Missing file reads as zero and is created.
    pub fn load_or_init(&self) -> Result<U256> {
        if let Some(amount) = self.load()? {
            return Ok(amount);
        }
        self.store(U256::ZERO)?;
        Ok(U256::ZERO)
    }

    pub fn store(&self, amount: U256) -> Result<()> {
        write_atomic(&self.path, &amount.to_be_bytes_trimmed_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_stored_as_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refunded_wei");
        let repo = AmountRepository::new(&path);

        assert_eq!(repo.load_or_init().unwrap(), U256::ZERO);
        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn stores_big_endian_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refunded_wei");
        let repo = AmountRepository::new(&path);

        repo.store(U256::from(0x0102_03u64)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x01, 0x02, 0x03]);
        assert_eq!(repo.load_or_init().unwrap(), U256::from(0x0102_03u64));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refunded_wei");
        std::fs::write(&path, vec![1u8; 33]).unwrap();
        assert!(AmountRepository::new(path).load_or_init().is_err());
    }
}

use alloy_primitives::{Address, B256};
use std::fmt;

/// Business-rule outcomes that stop a payout without being an operational
/// failure. These are logged at debug level and counted as handled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed event: expected 3 topics, got {topics}, tx_hash:{tx_hash}")]
    Malformed { topics: usize, tx_hash: B256 },

    #[error("unknown token {token}, tx_hash:{tx_hash}")]
    UnknownToken { token: Address, tx_hash: B256 },

    #[error("recipient {0} was already refunded")]
    AlreadyRefunded(Address),

    #[error("transaction value is not over the threshold")]
    NotOverThreshold,

    #[error("cumulative payout reached the max cap")]
    CapReached,

    #[error("not eligible with the condition")]
    NotEligible,
}

impl Rejection {
    /// Validation rejections (bad shape, unknown token) are worth a warning;
    /// the rest are expected outcomes.
    pub fn is_validation(&self) -> bool {
        matches!(self, Rejection::Malformed { .. } | Rejection::UnknownToken { .. })
    }
}

/// Accumulates per-item failures inside a batch so the batch can finish and
/// report everything at once.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: impl fmt::Display) {
        self.errors.push(error.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(self.errors.join("\n")))
        }
    }
}

use alloy_primitives::Address;
use bigdecimal::BigDecimal;
use bigdecimal::num_bigint::BigInt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Which sample survives within one refund epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum PriceKind {
    Highest,
    Lowest,
}

impl TryFrom<u8> for PriceKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PriceKind::Highest),
            1 => Ok(PriceKind::Lowest),
            other => Err(format!("unknown price_kind {other}, expected 0 (highest) or 1 (lowest)")),
        }
    }
}

impl PriceKind {
    /// Starting value that any real sample replaces: the smallest positive
    /// f64 for `Highest`, the largest finite f64 for `Lowest`.
    pub fn sentinel(self) -> BigDecimal {
        match self {
            PriceKind::Highest => BigDecimal::new(BigInt::from(5), 324),
            PriceKind::Lowest => BigDecimal::new(BigInt::from(17_976_931_348_623_157u64), -292),
        }
    }

    /// Picks the candidate for this kind and reports whether it beats `current`.
    fn improves<'a>(self, current: &BigDecimal, high: &'a BigDecimal, low: &'a BigDecimal) -> Option<&'a BigDecimal> {
        match self {
            PriceKind::Highest => (high > current).then_some(high),
            PriceKind::Lowest => (low < current).then_some(low),
        }
    }
}

/// Latest best price per watched token, shared between the crawler (writer)
/// and the refunder (reader).
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    values: Arc<RwLock<HashMap<Address, BigDecimal>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &Address) -> Option<BigDecimal> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Like [`get`](Self::get), but `None` while the token still holds the
    /// sentinel for `kind`.
    pub fn get_sampled(&self, token: &Address, kind: PriceKind) -> Option<BigDecimal> {
        self.get(token).filter(|value| *value != kind.sentinel())
    }

    pub fn set(&self, token: Address, value: BigDecimal) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, value);
    }

    pub fn compare_then_set(&self, token: Address, high: BigDecimal, low: BigDecimal, kind: PriceKind) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        let current = values.entry(token).or_insert_with(|| kind.sentinel());
        if let Some(better) = kind.improves(current, &high, &low) {
            *current = better.clone();
        }
    }

    /// Puts every token back to its sentinel, starting a new epoch.
    pub fn reset<'a>(&self, tokens: impl IntoIterator<Item = (&'a Address, PriceKind)>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        for (token, kind) in tokens {
            values.insert(*token, kind.sentinel());
        }
    }
}

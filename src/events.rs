use crate::errors::Rejection;
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, U256};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

pub fn transfer_topic() -> B256 {
    Transfer::SIGNATURE_HASH
}

/// A raw transfer log as delivered by a log query or a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub transaction_hash: B256,
    pub block_number: u64,
}

impl TransferEvent {
    /// Recipient taken from the third topic. Anything other than exactly
    /// three topics (signature, from, to) is malformed.
    pub fn recipient(&self) -> Result<Address, Rejection> {
        if self.topics.len() != 3 {
            return Err(Rejection::Malformed {
                topics: self.topics.len(),
                tx_hash: self.transaction_hash,
            });
        }
        Ok(Address::from_word(self.topics[2]))
    }

    /// Transferred amount in the token's smallest unit. Only the trailing
    /// 32 bytes of the payload are significant.
    pub fn raw_amount(&self) -> U256 {
        let start = self.data.len().saturating_sub(32);
        U256::from_be_slice(&self.data[start..])
    }
}

impl From<Log> for TransferEvent {
    fn from(log: Log) -> Self {
        TransferEvent {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            block_number: log.block_number.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
pub(crate) fn transfer_event(token: Address, to: Address, amount: U256) -> TransferEvent {
    TransferEvent {
        address: token,
        topics: vec![transfer_topic(), B256::ZERO, to.into_word()],
        data: Bytes::from(amount.to_be_bytes::<32>().to_vec()),
        transaction_hash: B256::repeat_byte(0xab),
        block_number: 1,
    }
}

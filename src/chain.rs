//! The chain-facing contract the refund engine is written against.
//!
//! Production uses the alloy-backed implementations in [`crate::rpc`]; tests
//! script a [`mock::MockChain`] instead.

use crate::events::{TransferEvent, transfer_topic};
use alloy::rpc::types::Filter;
use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Transfer logs emitted by a fixed set of contracts inside one block window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterQuery {
    pub addresses: Vec<Address>,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

impl FilterQuery {
    pub fn transfer(addresses: Vec<Address>) -> Self {
        FilterQuery {
            addresses,
            topic0: transfer_topic(),
            from_block: 0,
            to_block: 0,
        }
    }

    pub fn window(&self, from_block: u64, to_block: u64) -> Self {
        FilterQuery {
            from_block,
            to_block,
            ..self.clone()
        }
    }

    pub fn to_filter(&self) -> Filter {
        Filter::new()
            .address(self.addresses.clone())
            .event_signature(self.topic0)
            .from_block(self.from_block)
            .to_block(self.to_block)
    }

    /// Subscriptions have no block bounds.
    pub fn to_subscription_filter(&self) -> Filter {
        Filter::new()
            .address(self.addresses.clone())
            .event_signature(self.topic0)
    }
}

/// Request primitives. Implementations retry reads on their own; callers never retry.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<TransferEvent>>;

    async fn pending_nonce_at(&self, address: Address) -> Result<u64>;

    async fn suggest_gas_price(&self) -> Result<u128>;

    async fn network_id(&self) -> Result<u64>;

    /// Balance at the latest height.
    async fn balance_at(&self, address: Address) -> Result<U256>;

    /// Nonce at the latest height.
    async fn nonce_at(&self, address: Address) -> Result<u64>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256>;
}

/// Why a live subscription stopped delivering an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The connection closed underneath the subscription.
    #[error("subscription closed abnormally")]
    Closed,
    /// No event arrived within the read deadline.
    #[error("subscription read timed out")]
    Timeout,
    #[error("subscription error: {0}")]
    Other(String),
}

#[async_trait]
pub trait LogSubscription: Send {
    async fn next_event(&mut self) -> Result<TransferEvent, SubscriptionError>;

    fn unsubscribe(self: Box<Self>);
}

/// Dials connections. Each call returns a fresh handle so callers can
/// re-dial after a failure.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn dial_rpc(&self) -> Result<Arc<dyn ChainClient>>;

    async fn subscribe_filter_logs(&self, query: &FilterQuery) -> Result<Box<dyn LogSubscription>>;
}

/// Runs a chain call against a deadline shared by a whole unit of work.
pub(crate) async fn within<T>(deadline: Instant, future: impl Future<Output = Result<T>>) -> Result<T> {
    timeout_at(deadline, future)
        .await
        .map_err(|_| anyhow::anyhow!("deadline exceeded"))?
}

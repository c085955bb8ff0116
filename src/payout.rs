use crate::chain::ChainClient;
use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use anyhow::{Context, Result};

/// Gas used by a plain native-token transfer with no calldata.
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Funding-side parameters fetched right before a payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub nonce: u64,
    pub gas_price: u128,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub tx_hash: B256,
    pub nonce: u64,
}

/// The funding wallet.
pub struct Payer {
    signer: PrivateKeySigner,
}

impl Payer {
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let signer = private_key
            .trim()
            .parse::<PrivateKeySigner>()
            .context("Invalid funding private key")?;
        Ok(Payer { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub async fn tx_params(&self, client: &dyn ChainClient) -> Result<TxParams> {
        let nonce = client
            .pending_nonce_at(self.address())
            .await
            .context("PendingNonceAt failed")?;
        let gas_price = client
            .suggest_gas_price()
            .await
            .context("SuggestGasPrice failed")?;
        let chain_id = client.network_id().await.context("NetworkID failed")?;

        Ok(TxParams {
            nonce,
            gas_price,
            chain_id,
        })
    }

    pub fn sign_transfer(&self, params: TxParams, to: Address, value: U256) -> Result<TxEnvelope> {
        let mut tx = TxLegacy {
            chain_id: Some(params.chain_id),
            nonce: params.nonce,
            gas_price: params.gas_price,
            gas_limit: NATIVE_TRANSFER_GAS,
            to: TxKind::Call(to),
            value,
            input: Bytes::new(),
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .context("SignTx failed")?;

        Ok(TxEnvelope::Legacy(tx.into_signed(signature)))
    }

    /// Fetches fresh parameters, then signs and broadcasts.
    pub async fn send_native(&self, client: &dyn ChainClient, to: Address, value: U256) -> Result<Payout> {
        let params = self.tx_params(client).await?;
        let tx_hash = self.send(client, params, to, value).await?;
        Ok(Payout {
            tx_hash,
            nonce: params.nonce,
        })
    }

    /// Signs and broadcasts a native transfer, returning the payout tx hash.
    pub async fn send(
        &self,
        client: &dyn ChainClient,
        params: TxParams,
        to: Address,
        value: U256,
    ) -> Result<B256> {
        let envelope = self.sign_transfer(params, to, value)?;
        client
            .send_raw_transaction(Bytes::from(envelope.encoded_2718()))
            .await
            .context("SendTransaction failed")
    }
}

#[cfg(test)]
pub(crate) const TEST_KEY: &str =
    "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

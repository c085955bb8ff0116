use crate::payout::Payer;
use crate::price::PriceKind;
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_GASFEE_PRIVATE_KEY: &str = "GASFEE_SERVICE_PK";
const ENV_GIVEAWAY_PRIVATE_KEY: &str = "GIVEAWAY_SERVICE_PK";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub gasfee_service: Option<GasfeeConfig>,
    #[serde(default)]
    pub giveaway_service: Option<GiveawayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(alias = "server_dial_timeout_sec")]
    pub dial_timeout_sec: u64,
    #[serde(default, alias = "server_ws_addresses")]
    pub ws_addresses: Vec<String>,
    #[serde(default, alias = "server_rpc_addresses")]
    pub rpc_addresses: Vec<String>,
    /// Node whose suggested gas price drives the dynamic refund factor.
    #[serde(default)]
    pub dynamic_gas_price_rpc_address: Option<String>,
}

/// Gas refund: daily scan of transfer logs, paid out against crawled prices.
#[derive(Clone, Deserialize)]
pub struct GasfeeConfig {
    pub is_enable: bool,
    #[serde(skip)]
    pub private_key: String,
    #[serde(alias = "crawle_in_every_minutes")]
    pub crawl_every_minutes: u64,
    /// Only the HH:MM:SS part is used, in UTC.
    pub refund_every_day_at: DateTime<Utc>,
    pub refunder_total_timeout_sec: u64,
    pub crawler_total_timeout_sec: u64,
    /// Initial cursor when no cursor file exists yet.
    pub refunder_start_block_number: u64,
    pub refunder_scrap_block_step: u64,
    /// In USDT.
    pub refund_threshold: BigDecimal,
    pub refund_max_cap_wei: U256,
    #[serde(default = "default_base_rate_wei")]
    pub refund_base_rate_wei: BigDecimal,
    #[serde(default)]
    pub is_using_dynamic_gas_price: bool,
    #[serde(default)]
    pub dynamic_gas_price_reference_wei: Option<BigDecimal>,
    #[serde(default)]
    pub dynamic_gas_price_max_factor: Option<BigDecimal>,
    pub refunded_wei_filepath: PathBuf,
    pub refunded_list_filepath: PathBuf,
    pub current_block_number_filepath: PathBuf,
    /// Candlestick endpoint of the quote source.
    pub crawling_address: String,
    pub numerator: String,
    pub denominator: String,
    pub crawling_mapper: HashMap<String, CrawlingMate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlingMate {
    pub price_kind: PriceKind,
    pub decimal: u8,
    pub token_address: Address,
}

/// Giveaway: live subscription paying a fixed amount to fresh addresses.
#[derive(Clone, Deserialize)]
pub struct GiveawayConfig {
    pub is_enable: bool,
    #[serde(skip)]
    pub private_key: String,
    #[serde(alias = "handler_operations_timeout_sec")]
    pub handler_total_timeout_sec: u64,
    #[serde(alias = "subscrip_timeout_sec")]
    pub subscribe_timeout_sec: u64,
    /// A feed silent for this long is treated as dead. 0 disables the check.
    #[serde(default = "default_subscription_idle_timeout_sec")]
    pub subscription_idle_timeout_sec: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    pub fixed_giveaway_wei: U256,
    pub max_cap_wei: U256,
    pub token_addresses: Vec<Address>,
    pub current_gave_wei_filepath: PathBuf,
    #[serde(default)]
    pub worker_pool: Option<WorkerPoolConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkerPoolConfig {
    pub worker_num: usize,
    pub pool_size: usize,
}

/// A token contract the refunder prices and watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedToken {
    pub currency_pair: String,
    pub price_kind: PriceKind,
    pub decimals: u8,
}

fn default_base_rate_wei() -> BigDecimal {
    // 0.00053251 * 0.5 native tokens
    BigDecimal::from(266_255_000_000_000u64)
}

fn default_max_reconnect_attempts() -> u32 {
    1
}

fn default_subscription_idle_timeout_sec() -> u64 {
    300
}

fn normalize_pair(pair: &str) -> String {
    pair.trim().to_uppercase()
}

impl Config {
    /// Reads the JSON config file, then injects private keys from the
    /// environment (and `.env`).
    pub fn load(path: &Path) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::read(path)?;

        if let Some(gasfee) = config.gasfee_service.as_mut() {
            gasfee.private_key = std::env::var(ENV_GASFEE_PRIVATE_KEY).unwrap_or_default();
        }
        if let Some(giveaway) = config.giveaway_service.as_mut() {
            giveaway.private_key = std::env::var(ENV_GIVEAWAY_PRIVATE_KEY).unwrap_or_default();
        }

        config.validate()?;
        Ok(config)
    }

    /// The file alone: no private keys, no validation.
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Invalid config JSON")
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.server.dial_timeout_sec)
    }

    /// The gas price node, when one is configured.
    pub fn dynamic_gas_price_rpc(&self) -> Option<&str> {
        self.server
            .dynamic_gas_price_rpc_address
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(gasfee) = self.gasfee_service.as_ref().filter(|s| s.is_enable) {
            if self.server.rpc_addresses.is_empty() {
                anyhow::bail!("gasfee_service requires at least one server.rpc_addresses entry");
            }
            if gasfee.private_key.is_empty() {
                anyhow::bail!("{} must be set for gasfee_service", ENV_GASFEE_PRIVATE_KEY);
            }
            Payer::from_hex(&gasfee.private_key)
                .with_context(|| format!("{} is not a valid key", ENV_GASFEE_PRIVATE_KEY))?;
            gasfee.validate()?;
            if gasfee.is_using_dynamic_gas_price && self.dynamic_gas_price_rpc().is_none() {
                anyhow::bail!(
                    "server.dynamic_gas_price_rpc_address is required with dynamic gas price"
                );
            }
        }

        if let Some(giveaway) = self.giveaway_service.as_ref().filter(|s| s.is_enable) {
            if self.server.ws_addresses.is_empty() || self.server.rpc_addresses.is_empty() {
                anyhow::bail!(
                    "giveaway_service requires server.ws_addresses and server.rpc_addresses"
                );
            }
            if giveaway.private_key.is_empty() {
                anyhow::bail!("{} must be set for giveaway_service", ENV_GIVEAWAY_PRIVATE_KEY);
            }
            Payer::from_hex(&giveaway.private_key)
                .with_context(|| format!("{} is not a valid key", ENV_GIVEAWAY_PRIVATE_KEY))?;
            giveaway.validate()?;
        }

        Ok(())
    }
}

impl GasfeeConfig {
    fn validate(&self) -> Result<()> {
        if self.refunder_scrap_block_step == 0 {
            anyhow::bail!("refunder_scrap_block_step must be greater than 0");
        }
        if self.crawl_every_minutes == 0 {
            anyhow::bail!("crawl_every_minutes must be greater than 0");
        }
        self.numerator_token()?;
        self.denominator_token()?;

        if self.is_using_dynamic_gas_price {
            let reference = self
                .dynamic_gas_price_reference_wei
                .as_ref()
                .context("dynamic_gas_price_reference_wei is required with dynamic gas price")?;
            if *reference <= BigDecimal::from(0) {
                anyhow::bail!("dynamic_gas_price_reference_wei must be positive");
            }
            self.dynamic_gas_price_max_factor
                .as_ref()
                .context("dynamic_gas_price_max_factor is required with dynamic gas price")?;
        }
        Ok(())
    }

    /// Watched tokens keyed by contract address.
    pub fn watched_tokens(&self) -> HashMap<Address, WatchedToken> {
        self.crawling_mapper
            .iter()
            .map(|(pair, mate)| {
                (
                    mate.token_address,
                    WatchedToken {
                        currency_pair: normalize_pair(pair),
                        price_kind: mate.price_kind,
                        decimals: mate.decimal,
                    },
                )
            })
            .collect()
    }

    fn token_for_pair(&self, pair: &str) -> Result<Address> {
        let wanted = normalize_pair(pair);
        self.crawling_mapper
            .iter()
            .find(|(candidate, _)| normalize_pair(candidate) == wanted)
            .map(|(_, mate)| mate.token_address)
            .with_context(|| format!("currency pair {wanted} is missing from crawling_mapper"))
    }

    pub fn numerator_token(&self) -> Result<Address> {
        self.token_for_pair(&self.numerator)
    }

    pub fn denominator_token(&self) -> Result<Address> {
        self.token_for_pair(&self.denominator)
    }

    pub fn crawl_period(&self) -> Duration {
        Duration::from_secs(self.crawl_every_minutes * 60)
    }

    pub fn refunder_timeout(&self) -> Duration {
        Duration::from_secs(self.refunder_total_timeout_sec)
    }

    pub fn crawler_timeout(&self) -> Duration {
        Duration::from_secs(self.crawler_total_timeout_sec)
    }
}

impl GiveawayConfig {
    fn validate(&self) -> Result<()> {
        if self.token_addresses.is_empty() {
            anyhow::bail!("giveaway_service.token_addresses must not be empty");
        }
        if let Some(pool) = self.worker_pool {
            if pool.worker_num == 0 || pool.pool_size == 0 {
                anyhow::bail!("worker_pool.worker_num and worker_pool.pool_size must be positive");
            }
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_total_timeout_sec)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_sec)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.subscription_idle_timeout_sec > 0)
            .then(|| Duration::from_secs(self.subscription_idle_timeout_sec))
    }
}

// Keeps private keys out of logs.
impl std::fmt::Debug for GasfeeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GasfeeConfig")
            .field("is_enable", &self.is_enable)
            .field("refund_every_day_at", &self.refund_every_day_at)
            .field("refunder_scrap_block_step", &self.refunder_scrap_block_step)
            .field("refund_threshold", &self.refund_threshold)
            .field("refund_max_cap_wei", &self.refund_max_cap_wei)
            .field("numerator", &self.numerator)
            .field("denominator", &self.denominator)
            .field("tokens", &self.crawling_mapper.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for GiveawayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiveawayConfig")
            .field("is_enable", &self.is_enable)
            .field("fixed_giveaway_wei", &self.fixed_giveaway_wei)
            .field("max_cap_wei", &self.max_cap_wei)
            .field("token_addresses", &self.token_addresses)
            .field("worker_pool", &self.worker_pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"{
    "server": {
        "dial_timeout_sec": 5,
        "ws_addresses": ["ws://localhost:8546"],
        "rpc_addresses": ["http://localhost:8545"]
    },
    "gasfee_service": {
        "is_enable": true,
        "crawl_every_minutes": 15,
        "refund_every_day_at": "2022-03-01T02:30:00Z",
        "refunder_total_timeout_sec": 600,
        "crawler_total_timeout_sec": 60,
        "refunder_start_block_number": 0,
        "refunder_scrap_block_step": 200,
        "refund_threshold": "100",
        "refund_max_cap_wei": "20000000000000000000000",
        "refunded_wei_filepath": "refunded_wei",
        "refunded_list_filepath": "refunded_list.json",
        "current_block_number_filepath": "current_block_number",
        "crawling_address": "https://api.gateio.ws/api/v4/spot/candlesticks",
        "numerator": "fra_usdt",
        "denominator": "ETH_USDT",
        "crawling_mapper": {
            "FRA_USDT": {"price_kind": 1, "decimal": 18, "token_address": "0x0000000000000000000000000000000000001000"},
            " eth_usdt ": {"price_kind": 0, "decimal": 18, "token_address": "0x0000000000000000000000000000000000002000"},
            "USDT_USDT": {"price_kind": 0, "decimal": 6, "token_address": "0x0000000000000000000000000000000000003000"}
        }
    },
    "giveaway_service": {
        "is_enable": true,
        "handler_total_timeout_sec": 30,
        "subscribe_timeout_sec": 10,
        "fixed_giveaway_wei": "30000000000000000",
        "max_cap_wei": "20000000000000000000000",
        "token_addresses": ["0x0000000000000000000000000000000000002000"],
        "current_gave_wei_filepath": "current_gave_wei",
        "worker_pool": {"worker_num": 3, "pool_size": 10}
    }
}"#;

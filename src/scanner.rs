use crate::chain::{ChainClient, ChainConnector, FilterQuery, within};
use crate::config::{GasfeeConfig, WatchedToken};
use crate::errors::{ErrorList, Rejection};
use crate::events::TransferEvent;
use crate::payout::Payer;
use crate::price::PriceCache;
use crate::repository::{AmountRepository, CursorRepository, RefundedRepository};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inclusive `[from, to]` windows covering `cursor..latest`, each at most
/// `step` blocks past its start. Consecutive windows never overlap.
pub fn scan_windows(cursor: u64, latest: u64, step: u64) -> Vec<(u64, u64)> {
    let mut windows = Vec::new();
    let mut from = cursor;
    while from < latest {
        let to = from.saturating_add(step).min(latest);
        windows.push((from, to));
        from = to + 1;
    }
    windows
}

/// `raw / 10^decimals`, exact.
pub fn token_amount(raw: U256, decimals: u8) -> BigDecimal {
    let digits = BigInt::from_bytes_be(Sign::Plus, &raw.to_be_bytes::<32>());
    BigDecimal::new(digits, i64::from(decimals))
}

/// Truncates toward zero. Negative or oversized values are rejected.
pub fn decimal_to_wei(value: &BigDecimal) -> Result<U256> {
    let (digits, _) = value
        .with_scale_round(0, RoundingMode::Down)
        .into_bigint_and_exponent();
    let magnitude = digits
        .to_biguint()
        .with_context(|| format!("negative amount {value}"))?;
    U256::try_from_be_slice(&magnitude.to_bytes_be())
        .with_context(|| format!("amount {value} does not fit in 256 bits"))
}

/// Scales the base rate by current gas price relative to a reference, up
/// to a ceiling.
#[derive(Debug, Clone)]
pub struct DynamicGasPrice {
    pub reference_wei: BigDecimal,
    pub max_factor: BigDecimal,
}

impl DynamicGasPrice {
    pub fn factor(&self, gas_price: u128) -> BigDecimal {
        let factor = BigDecimal::from(gas_price) / &self.reference_wei;
        factor.min(self.max_factor.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RefundRules {
    /// In USDT; a transfer must be worth strictly more.
    pub threshold: BigDecimal,
    pub max_cap_wei: U256,
    pub base_rate_wei: BigDecimal,
    pub dynamic_gas_price: Option<DynamicGasPrice>,
    pub numerator_token: Address,
    pub denominator_token: Address,
}

impl RefundRules {
    pub fn from_config(config: &GasfeeConfig) -> Result<Self> {
        let dynamic_gas_price = if config.is_using_dynamic_gas_price {
            Some(DynamicGasPrice {
                reference_wei: config
                    .dynamic_gas_price_reference_wei
                    .clone()
                    .context("dynamic_gas_price_reference_wei missing")?,
                max_factor: config
                    .dynamic_gas_price_max_factor
                    .clone()
                    .context("dynamic_gas_price_max_factor missing")?,
            })
        } else {
            None
        };

        Ok(RefundRules {
            threshold: config.refund_threshold.clone(),
            max_cap_wei: config.refund_max_cap_wei,
            base_rate_wei: config.refund_base_rate_wei.clone(),
            dynamic_gas_price,
            numerator_token: config.numerator_token()?,
            denominator_token: config.denominator_token()?,
        })
    }

    /// `base_rate * numerator_price / denominator_price`, with the base rate
    /// scaled by the gas factor when dynamic pricing is on.
    pub fn refund_amount(
        &self,
        numerator_price: &BigDecimal,
        denominator_price: &BigDecimal,
        gas_price: u128,
    ) -> Result<U256> {
        if denominator_price.is_zero() {
            anyhow::bail!("denominator price is zero");
        }
        let base_rate = match &self.dynamic_gas_price {
            Some(dynamic) => &self.base_rate_wei * dynamic.factor(gas_price),
            None => self.base_rate_wei.clone(),
        };
        decimal_to_wei(&(base_rate * numerator_price / denominator_price))
    }
}

/// Cumulative spend and dedup list as held in memory during a cycle.
#[derive(Debug)]
struct CycleLedger {
    spent: U256,
    refunded: HashSet<Address>,
}

enum EventError {
    Rejected(Rejection),
    Failed(anyhow::Error),
    /// A payout went out but could not be recorded.
    Persist(anyhow::Error),
}

impl From<Rejection> for EventError {
    fn from(rejection: Rejection) -> Self {
        EventError::Rejected(rejection)
    }
}

/// Counters for one scan cycle, returned next to the cycle's joined errors.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub from_block: u64,
    pub latest_block: u64,
    pub windows: usize,
    pub events: usize,
    pub refunded: usize,
    pub rejected: usize,
}

pub struct Scanner {
    connector: Arc<dyn ChainConnector>,
    /// Separate node whose gas price drives the dynamic factor.
    gas_oracle: Option<Arc<dyn ChainClient>>,
    payer: Payer,
    tokens: Arc<HashMap<Address, WatchedToken>>,
    prices: PriceCache,
    rules: RefundRules,
    filter: FilterQuery,
    step: u64,
    start_block: u64,
    cursor: CursorRepository,
    spent: AmountRepository,
    refunded: RefundedRepository,
}

impl Scanner {
    /// `gas_oracle` is required when dynamic gas pricing is on and ignored
    /// otherwise.
    pub fn new(
        connector: Arc<dyn ChainConnector>,
        gas_oracle: Option<Arc<dyn ChainClient>>,
        config: &GasfeeConfig,
        tokens: Arc<HashMap<Address, WatchedToken>>,
        prices: PriceCache,
    ) -> Result<Self> {
        let payer = Payer::from_hex(&config.private_key)?;
        let rules = RefundRules::from_config(config)?;
        let gas_oracle = match (&rules.dynamic_gas_price, gas_oracle) {
            (Some(_), None) => anyhow::bail!("dynamic gas price needs a gas price RPC"),
            (Some(_), oracle) => oracle,
            (None, _) => None,
        };

        // the numerator prices the native token and is never a transfer target
        let mut watched: Vec<Address> = tokens
            .keys()
            .filter(|token| **token != rules.numerator_token)
            .copied()
            .collect();
        watched.sort();

        Ok(Scanner {
            connector,
            gas_oracle,
            payer,
            tokens,
            prices,
            rules,
            filter: FilterQuery::transfer(watched),
            step: config.refunder_scrap_block_step,
            start_block: config.refunder_start_block_number,
            cursor: CursorRepository::new(&config.current_block_number_filepath),
            spent: AmountRepository::new(&config.refunded_wei_filepath),
            refunded: RefundedRepository::new(&config.refunded_list_filepath),
        })
    }

    /// One refund cycle over every block since the cursor.
    ///
    /// The cursor always moves to the height observed at the start, even
    /// when windows or events failed. Events in a window whose log query
    /// failed are never revisited.
    pub async fn run_cycle(&self, total_timeout: Duration) -> (CycleReport, Result<()>) {
        let mut report = CycleReport::default();
        let result = self.scan(total_timeout, &mut report).await;
        (report, result)
    }

    async fn scan(&self, total_timeout: Duration, report: &mut CycleReport) -> Result<()> {
        let deadline = Instant::now() + total_timeout;

        let client = within(deadline, self.connector.dial_rpc())
            .await
            .context("refunder dial failed")?;
        let latest_block = within(deadline, client.block_number())
            .await
            .context("refunder BlockNumber failed")?;
        let cursor = self.cursor.load_or_init(self.start_block)?;

        let mut ledger = CycleLedger {
            spent: self.spent.load_or_init()?,
            refunded: self.refunded.load_or_init()?,
        };

        report.from_block = cursor;
        report.latest_block = latest_block;
        info!(
            "Refund cycle scanning blocks {} to {}, refunded so far {} wei",
            cursor, latest_block, ledger.spent
        );

        let mut errors = ErrorList::new();

        for (from, to) in scan_windows(cursor, latest_block, self.step) {
            report.windows += 1;
            let events = match within(deadline, client.filter_logs(&self.filter.window(from, to))).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("FilterLogs for blocks {}-{} failed: {:#}", from, to, e);
                    errors.push(format!("refunder FilterLogs {}-{} failed: {:#}", from, to, e));
                    continue;
                }
            };
            debug!("Received {} logs for blocks {} to {}", events.len(), from, to);

            for event in &events {
                report.events += 1;
                match self.refund(client.as_ref(), event, &mut ledger, deadline).await {
                    Ok(()) => report.refunded += 1,
                    Err(EventError::Rejected(rejection)) => {
                        report.rejected += 1;
                        if rejection.is_validation() {
                            warn!("Dropping event: {}", rejection);
                        } else {
                            debug!("No refund for tx {}: {}", event.transaction_hash, rejection);
                        }
                    }
                    Err(EventError::Failed(e)) => errors.push(format!(
                        "refunder {:#}, tx_hash:{}, token_address:{}",
                        e, event.transaction_hash, event.address
                    )),
                    Err(EventError::Persist(e)) => return Err(e),
                }
            }
        }

        self.persist(&ledger)?;
        self.cursor.store(latest_block)?;

        info!(
            "Refund cycle done: {} windows, {} events, {} refunded, {} rejected, {} failed",
            report.windows,
            report.events,
            report.refunded,
            report.rejected,
            errors.len()
        );
        errors.into_result()
    }

    fn persist(&self, ledger: &CycleLedger) -> Result<()> {
        self.refunded.store(&ledger.refunded)?;
        self.spent.store(ledger.spent)
    }

    /// Sampled price of `token` this epoch; a sentinel is not a price.
    fn price(&self, token: &Address) -> Result<BigDecimal, EventError> {
        let kind = self
            .tokens
            .get(token)
            .map(|watched| watched.price_kind)
            .ok_or_else(|| EventError::Failed(anyhow::anyhow!("no price for token {}", token)))?;
        self.prices
            .get_sampled(token, kind)
            .ok_or_else(|| EventError::Failed(anyhow::anyhow!("no price sampled for token {}", token)))
    }

    async fn refund(
        &self,
        client: &dyn ChainClient,
        event: &TransferEvent,
        ledger: &mut CycleLedger,
        deadline: Instant,
    ) -> Result<(), EventError> {
        let recipient = event.recipient()?;
        if ledger.refunded.contains(&recipient) {
            return Err(Rejection::AlreadyRefunded(recipient).into());
        }

        let token = self.tokens.get(&event.address).ok_or(Rejection::UnknownToken {
            token: event.address,
            tx_hash: event.transaction_hash,
        })?;

        let transferred = token_amount(event.raw_amount(), token.decimals);
        let token_price = self.price(&event.address)?;
        let transferred_value = &transferred * &token_price;

        info!(
            "Refund check to_address:{} amount:{} value:{} threshold:{} tx_hash:{} token:{} refunded_wei:{} max_cap_wei:{}",
            recipient,
            transferred,
            transferred_value,
            self.rules.threshold,
            event.transaction_hash,
            token.currency_pair,
            ledger.spent,
            self.rules.max_cap_wei
        );

        if transferred_value <= self.rules.threshold {
            return Err(Rejection::NotOverThreshold.into());
        }
        if ledger.spent >= self.rules.max_cap_wei {
            return Err(Rejection::CapReached.into());
        }

        let numerator_price = self.price(&self.rules.numerator_token)?;
        let denominator_price = self.price(&self.rules.denominator_token)?;

        let params = within(deadline, self.payer.tx_params(client))
            .await
            .map_err(EventError::Failed)?;
        let reference_gas_price = match &self.gas_oracle {
            Some(oracle) => within(deadline, oracle.suggest_gas_price())
                .await
                .context("dynamic SuggestGasPrice failed")
                .map_err(EventError::Failed)?,
            None => params.gas_price,
        };
        let amount = self
            .rules
            .refund_amount(&numerator_price, &denominator_price, reference_gas_price)
            .map_err(EventError::Failed)?;
        if amount.is_zero() {
            return Err(EventError::Failed(anyhow::anyhow!(
                "refund amount is zero, numerator price {} denominator price {}",
                numerator_price,
                denominator_price
            )));
        }

        let refund_hash: B256 = within(deadline, self.payer.send(client, params, recipient, amount))
            .await
            .map_err(EventError::Failed)?;

        ledger.refunded.insert(recipient);
        ledger.spent += amount;
        self.persist(ledger).map_err(EventError::Persist)?;

        info!(
            "Refund success to_address:{} tx_hash:{} refund_tx_hash:{} refund_value:{} refunded_wei:{}",
            recipient, event.transaction_hash, refund_hash, amount, ledger.spent
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::config::{Config, CrawlingMate, SAMPLE};
    use crate::events::transfer_event;
    use crate::payout::TEST_KEY;
    use crate::price::PriceKind;
    use alloy::consensus::TxEnvelope;
    use alloy::eips::eip2718::Decodable2718;
    use alloy_primitives::address;
    use std::str::FromStr;
    use tempfile::TempDir;

    const FRA: Address = address!("0000000000000000000000000000000000001000");
    const ETH: Address = address!("0000000000000000000000000000000000002000");
    const USDT: Address = address!("0000000000000000000000000000000000003000");

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn gasfee_config(dir: &TempDir) -> GasfeeConfig {
        let mut config = Config::from_json(SAMPLE).unwrap().gasfee_service.unwrap();
        config.private_key = TEST_KEY.to_string();
        config.current_block_number_filepath = dir.path().join("current_block_number");
        config.refunded_wei_filepath = dir.path().join("refunded_wei");
        config.refunded_list_filepath = dir.path().join("refunded_list.json");
        config
    }

    fn sampled_prices(tokens: &HashMap<Address, WatchedToken>) -> PriceCache {
        let prices = PriceCache::new();
        prices.reset(tokens.iter().map(|(a, t)| (a, t.price_kind)));
        prices.set(USDT, BigDecimal::from(1));
        prices.compare_then_set(FRA, dec("0.03"), dec("0.02"), PriceKind::Lowest);
        prices.compare_then_set(ETH, dec("2"), dec("1.5"), PriceKind::Highest);
        prices
    }

    fn scanner(chain: &MockChain, config: &GasfeeConfig) -> (Scanner, PriceCache) {
        let tokens = Arc::new(config.watched_tokens());
        let prices = sampled_prices(&tokens);

        let scanner = Scanner::new(Arc::new(chain.clone()), None, config, tokens, prices.clone()).unwrap();
        (scanner, prices)
    }

    fn usdt(amount: u64) -> U256 {
        U256::from(amount) * U256::from(1_000_000u64)
    }

    fn recipient(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn event_at(block: u64, to: Address, amount: U256) -> TransferEvent {
        let mut event = transfer_event(USDT, to, amount);
        event.block_number = block;
        event
    }

    fn sent_txs(chain: &MockChain) -> Vec<alloy::consensus::TxLegacy> {
        chain
            .sent()
            .iter()
            .map(|raw| {
                let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap();
                envelope.as_legacy().unwrap().tx().clone()
            })
            .collect()
    }

    fn sent_values(chain: &MockChain) -> Vec<(Address, U256)> {
        sent_txs(chain)
            .into_iter()
            .map(|tx| (tx.to.to().copied().unwrap(), tx.value))
            .collect()
    }

    fn assert_nothing_recorded(config: &GasfeeConfig) {
        let spent = AmountRepository::new(&config.refunded_wei_filepath);
        assert_eq!(spent.load_or_init().unwrap(), U256::ZERO);
        let refunded = RefundedRepository::new(&config.refunded_list_filepath);
        assert!(refunded.load_or_init().unwrap().is_empty());
    }

    // base rate 266255000000000 * 0.02 / 2
    const EXPECTED_REFUND: u64 = 2_662_550_000_000;

    #[test]
    fn windows_cover_range_without_overlap() {
        assert_eq!(
            scan_windows(0, 450, 200),
            vec![(0, 200), (201, 401), (402, 450)]
        );
        assert_eq!(scan_windows(450, 450, 200), vec![]);
        assert_eq!(scan_windows(10, 11, 200), vec![(10, 11)]);
    }

    #[test]
    fn token_amount_applies_decimals() {
        assert_eq!(token_amount(usdt(101), 6), BigDecimal::from(101));
        assert_eq!(token_amount(U256::from(15u64), 1), dec("1.5"));
    }

    #[test]
    fn refund_amount_truncates_toward_zero() {
        let dir = tempfile::tempdir().unwrap();
        let rules = RefundRules::from_config(&gasfee_config(&dir)).unwrap();
        let amount = rules.refund_amount(&dec("1"), &dec("3"), 0).unwrap();
        assert_eq!(amount, U256::from(88_751_666_666_666u64));
    }

    #[test]
    fn dynamic_gas_factor_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.is_using_dynamic_gas_price = true;
        config.dynamic_gas_price_reference_wei = Some(BigDecimal::from(10u64));
        config.dynamic_gas_price_max_factor = Some(BigDecimal::from(3));
        let rules = RefundRules::from_config(&config).unwrap();

        let doubled = rules.refund_amount(&dec("1"), &dec("1"), 20).unwrap();
        assert_eq!(doubled, U256::from(2 * 266_255_000_000_000u64));
        let capped = rules.refund_amount(&dec("1"), &dec("1"), 1_000).unwrap();
        assert_eq!(capped, U256::from(3 * 266_255_000_000_000u64));
    }

    #[tokio::test]
    async fn cycle_scans_windows_and_moves_cursor_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();

        assert_eq!(chain.queried_windows(), vec![(0, 200), (201, 401), (402, 450)]);
        assert_eq!(report.windows, 3);
        let cursor = CursorRepository::new(&config.current_block_number_filepath);
        assert_eq!(cursor.load_or_init(0).unwrap(), 450);
    }

    #[tokio::test]
    async fn refunds_qualifying_transfer_and_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.push_log(event_at(300, recipient(7), usdt(101)));
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();

        assert_eq!(report.refunded, 1);
        assert_eq!(sent_values(&chain), vec![(recipient(7), U256::from(EXPECTED_REFUND))]);
        let spent = AmountRepository::new(&config.refunded_wei_filepath);
        assert_eq!(spent.load_or_init().unwrap(), U256::from(EXPECTED_REFUND));
        let refunded = RefundedRepository::new(&config.refunded_list_filepath);
        assert!(refunded.load_or_init().unwrap().contains(&recipient(7)));
    }

    #[tokio::test]
    async fn threshold_comparison_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.push_log(event_at(10, recipient(1), usdt(100)));
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();

        assert_eq!(report.rejected, 1);
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn recipient_is_refunded_at_most_once_across_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.push_log(event_at(10, recipient(9), usdt(500)));
        chain.push_log(event_at(20, recipient(9), usdt(700)));
        let (scanner, _) = scanner(&chain, &config);

        scanner.run_cycle(Duration::from_secs(5)).await.1.unwrap();
        assert_eq!(chain.sent().len(), 1);

        chain.push_log(event_at(600, recipient(9), usdt(900)));
        chain.set_height(800);
        scanner.run_cycle(Duration::from_secs(5)).await.1.unwrap();
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn cap_stops_further_refunds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.refund_max_cap_wei = U256::from(EXPECTED_REFUND);
        let chain = MockChain::new(450);
        chain.push_log(event_at(10, recipient(1), usdt(500)));
        chain.push_log(event_at(11, recipient(2), usdt(500)));
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();

        assert_eq!(report.refunded, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(sent_values(&chain).len(), 1);
    }

    #[tokio::test]
    async fn failed_window_is_skipped_but_cursor_still_advances() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.fail_window(201, 401);
        chain.push_log(event_at(250, recipient(3), usdt(500)));
        chain.push_log(event_at(420, recipient(4), usdt(500)));
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        let error = result.unwrap_err().to_string();

        assert!(error.contains("201-401"));
        assert_eq!(report.refunded, 1);
        assert_eq!(sent_values(&chain), vec![(recipient(4), U256::from(EXPECTED_REFUND))]);

        // the event at block 250 is never picked up again
        let cursor = CursorRepository::new(&config.current_block_number_filepath);
        assert_eq!(cursor.load_or_init(0).unwrap(), 450);
    }

    #[tokio::test]
    async fn failed_broadcast_is_reported_and_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.fail_send(true);
        chain.push_log(event_at(10, recipient(5), usdt(500)));
        let (scanner, _) = scanner(&chain, &config);

        let (_, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        assert!(result.unwrap_err().to_string().contains("SendTransaction failed"));

        let spent = AmountRepository::new(&config.refunded_wei_filepath);
        assert_eq!(spent.load_or_init().unwrap(), U256::ZERO);
        let refunded = RefundedRepository::new(&config.refunded_list_filepath);
        assert!(refunded.load_or_init().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_events_are_dropped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        let mut malformed = event_at(10, recipient(1), usdt(500));
        malformed.topics.truncate(2);
        chain.push_log(malformed);
        let (scanner, _) = scanner(&chain, &config);

        let mut unknown = event_at(11, recipient(2), usdt(500));
        unknown.address = address!("0000000000000000000000000000000000009999");
        let mut ledger = CycleLedger {
            spent: U256::ZERO,
            refunded: HashSet::new(),
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = scanner.refund(&chain, &unknown, &mut ledger, deadline).await;
        assert!(matches!(
            outcome,
            Err(EventError::Rejected(Rejection::UnknownToken { .. }))
        ));

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn resumes_from_persisted_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        CursorRepository::new(&config.current_block_number_filepath)
            .store(1_000)
            .unwrap();
        let chain = MockChain::new(1_150);
        let (scanner, _) = scanner(&chain, &config);

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;
        result.unwrap();
        assert_eq!(report.from_block, 1_000);
        assert_eq!(chain.queried_windows(), vec![(1_000, 1_150)]);
    }

    #[tokio::test]
    async fn unsampled_price_blocks_the_refund() {
        const BTC: Address = address!("0000000000000000000000000000000000004000");
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.crawling_mapper.insert(
            "BTC_USDT".to_string(),
            CrawlingMate {
                price_kind: PriceKind::Lowest,
                decimal: 8,
                token_address: BTC,
            },
        );
        let chain = MockChain::new(450);
        let mut dust = transfer_event(BTC, recipient(8), U256::from(1u64));
        dust.block_number = 12;
        chain.push_log(dust);
        let (scanner, prices) = scanner(&chain, &config);
        assert_eq!(prices.get(&BTC).unwrap(), PriceKind::Lowest.sentinel());

        let (report, result) = scanner.run_cycle(Duration::from_secs(5)).await;

        assert!(result.unwrap_err().to_string().contains("no price sampled"));
        assert_eq!(report.refunded, 0);
        assert!(chain.sent().is_empty());
        assert_nothing_recorded(&config);
    }

    #[tokio::test]
    async fn zero_refund_is_never_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(450);
        chain.push_log(event_at(10, recipient(6), usdt(500)));
        let (scanner, prices) = scanner(&chain, &config);
        prices.set(FRA, dec("1e-30"));

        let (_, result) = scanner.run_cycle(Duration::from_secs(5)).await;

        assert!(result.unwrap_err().to_string().contains("refund amount is zero"));
        assert!(chain.sent().is_empty());
        assert_nothing_recorded(&config);
    }

    #[tokio::test]
    async fn dynamic_factor_reads_the_gas_oracle_not_the_funding_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.is_using_dynamic_gas_price = true;
        config.dynamic_gas_price_reference_wei = Some(BigDecimal::from(10_000_000_000u64));
        config.dynamic_gas_price_max_factor = Some(BigDecimal::from(5));

        let chain = MockChain::new(450);
        chain.set_gas_price(10_000_000_000);
        chain.push_log(event_at(10, recipient(2), usdt(500)));
        let oracle = MockChain::new(0);
        oracle.set_gas_price(30_000_000_000);

        let tokens = Arc::new(config.watched_tokens());
        let prices = sampled_prices(&tokens);
        let scanner = Scanner::new(
            Arc::new(chain.clone()),
            Some(Arc::new(oracle)),
            &config,
            tokens,
            prices,
        )
        .unwrap();

        scanner.run_cycle(Duration::from_secs(5)).await.1.unwrap();

        let sent = sent_txs(&chain);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].value, U256::from(3 * EXPECTED_REFUND));
        assert_eq!(sent[0].gas_price, 10_000_000_000);
    }

    #[test]
    fn dynamic_gas_price_requires_an_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.is_using_dynamic_gas_price = true;
        config.dynamic_gas_price_reference_wei = Some(BigDecimal::from(10u64));
        config.dynamic_gas_price_max_factor = Some(BigDecimal::from(3));
        let tokens = Arc::new(config.watched_tokens());
        let chain = MockChain::new(0);

        let result = Scanner::new(Arc::new(chain), None, &config, tokens, PriceCache::new());
        assert!(result.is_err());
    }
}

use crate::chain::{ChainClient, ChainConnector};
use crate::config::{GasfeeConfig, WatchedToken};
use crate::price::{Crawler, PriceCache};
use crate::scanner::Scanner;
use crate::ticker::{RefundTicker, crawler_interval};
use alloy_primitives::Address;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs the price crawler on its period and the refund cycle once a day.
/// Both loops share one price cache; prices start a new epoch after every
/// refund cycle.
pub struct RefundService {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RefundService {
    /// `gas_oracle` feeds the dynamic gas factor when that is enabled.
    pub fn start(
        connector: Arc<dyn ChainConnector>,
        gas_oracle: Option<Arc<dyn ChainClient>>,
        config: &GasfeeConfig,
    ) -> Result<Self> {
        let tokens = Arc::new(config.watched_tokens());
        let prices = PriceCache::new();
        reset_prices(&prices, &tokens);

        let crawler = Crawler::new(config.crawling_address.clone(), tokens.clone(), prices.clone());
        let scanner = Scanner::new(connector, gas_oracle, config, tokens.clone(), prices.clone())?;
        let (shutdown, _) = watch::channel(false);

        info!(
            "Starting refund service: {} tokens, crawl every {} min, refund daily at {}",
            tokens.len(),
            config.crawl_every_minutes,
            config.refund_every_day_at.time()
        );

        let crawl_task = tokio::spawn(crawl_loop(
            crawler,
            config.crawl_period(),
            config.crawler_timeout(),
            shutdown.subscribe(),
        ));
        let refund_task = tokio::spawn(refund_loop(
            scanner,
            RefundTicker::new(config.refund_every_day_at),
            prices,
            tokens,
            config.refunder_timeout(),
            shutdown.subscribe(),
        ));

        Ok(RefundService {
            shutdown,
            tasks: vec![crawl_task, refund_task],
        })
    }

    /// Stops both loops. A crawl or refund cycle already in progress runs to
    /// completion first.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Refund service task panicked: {}", e);
            }
        }
        info!("Refund service stopped");
    }
}

fn reset_prices(prices: &PriceCache, tokens: &HashMap<Address, WatchedToken>) {
    prices.reset(tokens.iter().map(|(token, watched)| (token, watched.price_kind)));
}

async fn crawl_loop(
    crawler: Crawler,
    period: Duration,
    total_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = crawler_interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = crawler.crawl(total_timeout).await {
                    error!("Crawler failed: {:#}", e);
                }
            }
        }
    }
}

async fn refund_loop(
    scanner: Scanner,
    mut ticker: RefundTicker,
    prices: PriceCache,
    tokens: Arc<HashMap<Address, WatchedToken>>,
    total_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => refund_round(&scanner, &prices, &tokens, total_timeout).await,
        }
    }
}

async fn refund_round(
    scanner: &Scanner,
    prices: &PriceCache,
    tokens: &HashMap<Address, WatchedToken>,
    total_timeout: Duration,
) {
    let (report, result) = scanner.run_cycle(total_timeout).await;
    if let Err(e) = result {
        error!(
            "Refund cycle over blocks {}-{} had failures: {:#}",
            report.from_block, report.latest_block, e
        );
    }
    reset_prices(prices, tokens);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::config::{Config, SAMPLE};
    use crate::payout::TEST_KEY;
    use crate::price::PriceKind;
    use bigdecimal::BigDecimal;
    use tokio::time::timeout;

    fn gasfee_config(dir: &tempfile::TempDir) -> GasfeeConfig {
        let mut config = Config::from_json(SAMPLE).unwrap().gasfee_service.unwrap();
        config.private_key = TEST_KEY.to_string();
        config.crawling_address = "http://127.0.0.1:1/candles".to_string();
        config.current_block_number_filepath = dir.path().join("current_block_number");
        config.refunded_wei_filepath = dir.path().join("refunded_wei");
        config.refunded_list_filepath = dir.path().join("refunded_list.json");
        config
    }

    #[tokio::test]
    async fn round_starts_a_new_price_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let chain = MockChain::new(10);
        let tokens = Arc::new(config.watched_tokens());
        let prices = PriceCache::new();
        reset_prices(&prices, &tokens);

        let fra = config.numerator_token().unwrap();
        prices.compare_then_set(fra, BigDecimal::from(2), BigDecimal::from(1), PriceKind::Lowest);

        let scanner = Scanner::new(Arc::new(chain.clone()), None, &config, tokens.clone(), prices.clone()).unwrap();
        refund_round(&scanner, &prices, &tokens, Duration::from_secs(5)).await;

        assert_eq!(prices.get(&fra).unwrap(), PriceKind::Lowest.sentinel());
        assert_eq!(chain.queried_windows(), vec![(0, 10)]);
    }

    #[tokio::test]
    async fn close_stops_idle_loops() {
        let dir = tempfile::tempdir().unwrap();
        let config = gasfee_config(&dir);
        let service = RefundService::start(Arc::new(MockChain::new(0)), None, &config).unwrap();

        timeout(Duration::from_secs(5), service.close())
            .await
            .expect("service did not stop");
    }

    #[test]
    fn start_fails_without_a_valid_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gasfee_config(&dir);
        config.private_key = "oops".to_string();
        assert!(RefundService::start(Arc::new(MockChain::new(0)), None, &config).is_err());
    }
}

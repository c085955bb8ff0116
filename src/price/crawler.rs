use crate::config::WatchedToken;
use crate::errors::ErrorList;
use crate::price::cache::PriceCache;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

/// Pairs pegged 1:1 to USDT; never fetched.
const PEGGED_PAIRS: [&str; 3] = ["USDT_USDT", "USDC_USDT", "BUSD_USDT"];

const CANDLE_INTERVAL: &str = "15m";

/// High/low of the most recent candle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub high: BigDecimal,
    pub low: BigDecimal,
}

impl Quote {
    /// Parses `[[timestamp, volume, close, high, low, open]]`.
    pub fn from_rows(rows: &[Vec<String>]) -> Result<Self> {
        let row = rows
            .first()
            .filter(|row| row.len() >= 5)
            .with_context(|| format!("response not correct: {rows:?}"))?;

        let high = BigDecimal::from_str(&row[3])
            .with_context(|| format!("parse highest price {:?} failed", row[3]))?;
        let low = BigDecimal::from_str(&row[4])
            .with_context(|| format!("parse lowest price {:?} failed", row[4]))?;

        Ok(Quote { high, low })
    }
}

/// Polls the candlestick endpoint and folds each token's high/low into the
/// price cache.
pub struct Crawler {
    http: reqwest::Client,
    endpoint: String,
    tokens: Arc<HashMap<Address, WatchedToken>>,
    prices: PriceCache,
}

impl Crawler {
    pub fn new(endpoint: String, tokens: Arc<HashMap<Address, WatchedToken>>, prices: PriceCache) -> Self {
        Crawler {
            http: reqwest::Client::new(),
            endpoint,
            tokens,
            prices,
        }
    }

    /// One pass over every watched token. A failing token does not stop the
    /// others; all failures come back joined.
    pub async fn crawl(&self, total_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + total_timeout;
        let mut errors = ErrorList::new();

        for (token, watched) in self.tokens.iter() {
            if PEGGED_PAIRS.contains(&watched.currency_pair.as_str()) {
                self.prices.set(*token, BigDecimal::from(1));
                continue;
            }

            let quote = match timeout_at(deadline, self.fetch_quote(&watched.currency_pair)).await {
                Ok(Ok(quote)) => quote,
                Ok(Err(e)) => {
                    errors.push(format!(
                        "crawler {:#}, currency_pair:{}, token_address:{}",
                        e, watched.currency_pair, token
                    ));
                    continue;
                }
                Err(_) => {
                    errors.push(format!(
                        "crawler timed out, currency_pair:{}, token_address:{}",
                        watched.currency_pair, token
                    ));
                    continue;
                }
            };

            debug!(
                "Quote for {}: high {} low {}",
                watched.currency_pair, quote.high, quote.low
            );
            self.prices
                .compare_then_set(*token, quote.high, quote.low, watched.price_kind);
        }

        info!(
            "Crawler pass done: {} tokens, {} failed",
            self.tokens.len(),
            errors.len()
        );
        errors.into_result()
    }

    async fn fetch_quote(&self, currency_pair: &str) -> Result<Quote> {
        let rows: Vec<Vec<String>> = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("currency_pair", currency_pair),
                ("interval", CANDLE_INTERVAL),
                ("limit", "1"),
            ])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("quote endpoint returned an error status")?
            .json()
            .await
            .context("json decode failed")?;

        Quote::from_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::PriceKind;

    fn rows(fields: &[&str]) -> Vec<Vec<String>> {
        vec![fields.iter().map(|f| f.to_string()).collect()]
    }

    #[test]
    fn parses_candle_high_and_low() {
        let quote = Quote::from_rows(&rows(&[
            "1645749900",
            "2839.79160470986265",
            "0.01815",
            "0.01897",
            "0.01793",
            "0.01889",
        ]))
        .unwrap();
        assert_eq!(quote.high, BigDecimal::from_str("0.01897").unwrap());
        assert_eq!(quote.low, BigDecimal::from_str("0.01793").unwrap());
    }

    #[test]
    fn rejects_short_or_empty_rows() {
        assert!(Quote::from_rows(&[]).is_err());
        assert!(Quote::from_rows(&rows(&["1645749900", "1", "0.1", "0.2"])).is_err());
        assert!(Quote::from_rows(&rows(&["1645749900", "1", "0.1", "abc", "0.1", "0.1"])).is_err());
    }

    fn watched(pair: &str, kind: PriceKind) -> WatchedToken {
        WatchedToken {
            currency_pair: pair.to_string(),
            price_kind: kind,
            decimals: 18,
        }
    }

    #[tokio::test]
    async fn failing_quote_only_affects_its_token() {
        let stable = Address::repeat_byte(1);
        let volatile = Address::repeat_byte(2);
        let tokens = Arc::new(HashMap::from([
            (stable, watched("USDC_USDT", PriceKind::Highest)),
            (volatile, watched("FRA_USDT", PriceKind::Lowest)),
        ]));
        let prices = PriceCache::new();
        prices.reset(tokens.iter().map(|(a, t)| (a, t.price_kind)));

        // nothing listens on port 1
        let crawler = Crawler::new("http://127.0.0.1:1/candles".to_string(), tokens, prices.clone());
        let error = crawler.crawl(Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(error.to_string().lines().count(), 1);
        assert!(error.to_string().contains("FRA_USDT"));
        assert_eq!(prices.get(&stable).unwrap(), BigDecimal::from(1));
        assert_eq!(prices.get(&volatile).unwrap(), PriceKind::Lowest.sentinel());
    }
}

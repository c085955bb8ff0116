use crate::chain::{ChainClient, ChainConnector, FilterQuery, LogSubscription, SubscriptionError};
use crate::events::TransferEvent;
use alloy::providers::fillers::FillProvider;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::pubsub::Subscription;
use alloy::rpc::types::Log;
use alloy::transports::TransportResult;
use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: 3,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error_str: &str) {
        let current_url = self.get_current_url();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self) -> anyhow::Error {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            current_url
        );
        self.rotate_provider();
        anyhow::anyhow!(
            "Request timeout after {} seconds",
            REQUEST_TIMEOUT.as_secs()
        )
    }

    /// Runs one request against the current provider, rotating and backing
    /// off on transport errors and timeouts.
    async fn call<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(AlloyFullProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        Retry::spawn(self.get_retry_strategy(), || {
            let client = self.clone();
            let future = request(client.get_provider().clone());
            async move {
                match timeout(REQUEST_TIMEOUT, future).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => {
                        let error_str = e.to_string();
                        client.handle_error(&error_str);
                        Err(anyhow::anyhow!("{}", e))
                    }
                    Err(_) => Err(client.handle_timeout()),
                }
            }
        })
        .await
    }

    async fn get_logs_internal(&self, query: &FilterQuery) -> Result<Vec<Log>> {
        let client = self.clone();
        let filter = query.to_filter();
        let (from_block, to_block) = (query.from_block, query.to_block);
        Retry::spawn(self.get_retry_strategy(), move || {
            let client = client.clone();
            let filter = filter.clone();
            async move {
                let provider = client.get_provider();

                match timeout(REQUEST_TIMEOUT, provider.get_logs(&filter)).await {
                    Ok(Ok(logs)) => Ok(Ok(logs)),
                    Ok(Err(e)) => {
                        let error_str = e.to_string();

                        if error_str.contains("exceeds max results") {
                            debug!(
                                "Max results exceeded for blocks {}-{}, will split range",
                                from_block, to_block
                            );
                            // not retried: the caller splits the range instead
                            Ok(Err(anyhow::anyhow!("{}", e)))
                        } else {
                            client.handle_error(&error_str);
                            Err(anyhow::anyhow!("{}", e))
                        }
                    }
                    Err(_) => Err(client.handle_timeout()),
                }
            }
        })
        .await
        .and_then(|r| r)
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    pub async fn get_logs(&self, query: &FilterQuery) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = query.from_block;

        while current_from <= query.to_block {
            let current = query.window(current_from, query.to_block);

            match self.get_logs_internal(&current).await {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(e) => {
                    let error_str = e.to_string();

                    let Some((suggested_from, suggested_to)) = error_str
                        .contains("exceeds max results")
                        .then(|| Self::parse_max_results_error(&error_str))
                        .flatten()
                    else {
                        return Err(e);
                    };

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, query.to_block, suggested_to
                    );

                    let logs = self
                        .get_logs_internal(&query.window(suggested_from, suggested_to))
                        .await?;

                    all_logs.extend(logs);
                    current_from = suggested_to + 1;
                }
            }
        }

        Ok(all_logs)
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        self.call(|p| async move { p.get_block_number().await })
            .await
    }

    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<TransferEvent>> {
        let logs = self.get_logs(query).await?;
        Ok(logs.into_iter().map(TransferEvent::from).collect())
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64> {
        self.call(|p| async move { p.get_transaction_count(address).pending().await })
            .await
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        self.call(|p| async move { p.get_gas_price().await }).await
    }

    async fn network_id(&self) -> Result<u64> {
        self.call(|p| async move { p.get_chain_id().await }).await
    }

    async fn balance_at(&self, address: Address) -> Result<U256> {
        self.call(|p| async move { p.get_balance(address).latest().await })
            .await
    }

    async fn nonce_at(&self, address: Address) -> Result<u64> {
        self.call(|p| async move { p.get_transaction_count(address).latest().await })
            .await
    }

    /// Never retried.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
        let provider = self.get_provider().clone();
        match timeout(REQUEST_TIMEOUT, provider.send_raw_transaction(&raw)).await {
            Ok(Ok(pending)) => Ok(*pending.tx_hash()),
            Ok(Err(e)) => {
                self.handle_error(&e.to_string());
                Err(anyhow::anyhow!("{}", e))
            }
            Err(_) => Err(self.handle_timeout()),
        }
    }
}

/// Live log feed over a websocket provider. The provider is kept alive for
/// as long as the subscription is.
struct WsSubscription {
    _provider: DynProvider,
    subscription: Subscription<Log>,
    idle_timeout: Option<Duration>,
}

#[async_trait]
impl LogSubscription for WsSubscription {
    async fn next_event(&mut self) -> Result<TransferEvent, SubscriptionError> {
        let received = match self.idle_timeout {
            Some(idle) => timeout(idle, self.subscription.recv())
                .await
                .map_err(|_| SubscriptionError::Timeout)?,
            None => self.subscription.recv().await,
        };

        match received {
            Ok(log) => Ok(TransferEvent::from(log)),
            Err(RecvError::Closed) => Err(SubscriptionError::Closed),
            Err(RecvError::Lagged(skipped)) => Err(SubscriptionError::Other(format!(
                "subscription lagged, {skipped} events skipped"
            ))),
        }
    }

    fn unsubscribe(self: Box<Self>) {
        debug!("Dropping log subscription and its websocket connection");
    }
}

/// Hands out the shared HTTP client and dials a new websocket per
/// subscription, rotating through the configured websocket endpoints.
pub struct Connector {
    rpc: RpcClient,
    ws_urls: Vec<String>,
    next_ws: AtomicUsize,
    dial_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Connector {
    pub fn new(
        rpc_urls: &[String],
        ws_urls: &[String],
        dial_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Result<Self> {
        Ok(Connector {
            rpc: RpcClient::new(rpc_urls)?,
            ws_urls: ws_urls.to_vec(),
            next_ws: AtomicUsize::new(0),
            dial_timeout,
            idle_timeout,
        })
    }

    fn next_ws_url(&self) -> Result<&str> {
        if self.ws_urls.is_empty() {
            anyhow::bail!("No websocket URL configured");
        }
        let index = self.next_ws.fetch_add(1, Ordering::Relaxed) % self.ws_urls.len();
        Ok(&self.ws_urls[index])
    }
}

#[async_trait]
impl ChainConnector for Connector {
    async fn dial_rpc(&self) -> Result<Arc<dyn ChainClient>> {
        Ok(Arc::new(self.rpc.clone()))
    }

    async fn subscribe_filter_logs(&self, query: &FilterQuery) -> Result<Box<dyn LogSubscription>> {
        let url = self.next_ws_url()?;
        info!("Dialing websocket {}", url);

        let provider = timeout(
            self.dial_timeout,
            ProviderBuilder::new().connect_ws(WsConnect::new(url)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Websocket dial to {} timed out", url))??
        .erased();

        let subscription = provider
            .subscribe_logs(&query.to_subscription_filter())
            .await?;

        Ok(Box::new(WsSubscription {
            _provider: provider,
            subscription,
            idle_timeout: self.idle_timeout,
        }))
    }
}

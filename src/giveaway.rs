//! Live giveaway listener.
//!
//! A single task drives the subscription through [`ListenerState`]. Events
//! are handled inline or handed to a [`WorkerPool`]; either way payouts are
//! serialized on the giveaway ledger so the cap and the funding nonce stay
//! consistent.

use crate::chain::{ChainClient, ChainConnector, FilterQuery, LogSubscription, SubscriptionError, within};
use crate::config::GiveawayConfig;
use crate::errors::Rejection;
use crate::events::TransferEvent;
use crate::payout::Payer;
use crate::repository::AmountRepository;
use crate::worker_pool::WorkerPool;
use alloy_primitives::{B256, U256};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Subscribed,
    Reconnecting,
    /// Terminal, after a close request or a failed reconnect.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Reconnect,
    Stay,
}

/// A dropped connection or a silent feed cannot be trusted any more; any
/// other subscription error is only logged.
pub fn classify(error: &SubscriptionError) -> Transition {
    match error {
        SubscriptionError::Closed | SubscriptionError::Timeout => Transition::Reconnect,
        SubscriptionError::Other(_) => Transition::Stay,
    }
}

struct GaveLedger {
    repository: AmountRepository,
    gave: U256,
}

/// Per-event handler state shared with pool workers.
struct Giver {
    client: Arc<dyn ChainClient>,
    payer: Payer,
    fixed_wei: U256,
    max_cap_wei: U256,
    handler_timeout: Duration,
    ledger: Mutex<GaveLedger>,
}

impl Giver {
    async fn give(&self, event: &TransferEvent) -> Result<B256> {
        let deadline = Instant::now() + self.handler_timeout;
        let recipient = event.recipient()?;

        let balance = within(deadline, self.client.balance_at(recipient))
            .await
            .context("BalanceAt failed")?;
        let nonce = within(deadline, self.client.nonce_at(recipient))
            .await
            .context("NonceAt failed")?;

        let mut ledger = self.ledger.lock().await;
        debug!(
            "Giveaway check to_address:{} balance:{} nonce:{} gave_wei:{} max_cap_wei:{}",
            recipient, balance, nonce, ledger.gave, self.max_cap_wei
        );
        if !balance.is_zero() || nonce != 0 || ledger.gave >= self.max_cap_wei {
            return Err(Rejection::NotEligible.into());
        }

        let payout = within(
            deadline,
            self.payer
                .send_native(self.client.as_ref(), recipient, self.fixed_wei),
        )
        .await?;
        let payout_hash = payout.tx_hash;

        // the payout is out; record it regardless of the deadline
        ledger.gave += self.fixed_wei;
        let gave = ledger.gave;
        ledger
            .repository
            .store(gave)
            .with_context(|| format!("giveaway sent in {payout_hash} but not recorded"))?;

        info!(
            "Giveaway success to_address:{} tx_hash:{} giveaway_tx_hash:{} nonce:{} value:{} gave_wei:{}",
            recipient, event.transaction_hash, payout_hash, payout.nonce, self.fixed_wei, gave
        );
        Ok(payout_hash)
    }
}

/// Runs the handler and sorts its outcome: rejections are handled events,
/// everything else is a failure for the caller to log.
async fn handle(giver: Arc<Giver>, event: TransferEvent) -> Result<()> {
    match giver.give(&event).await {
        Ok(_) => Ok(()),
        Err(e) => match e.downcast_ref::<Rejection>() {
            Some(rejection) if rejection.is_validation() => {
                warn!("Dropping event: {}", rejection);
                Ok(())
            }
            Some(rejection) => {
                debug!("No giveaway for tx {}: {}", event.transaction_hash, rejection);
                Ok(())
            }
            None => Err(e.context(format!("giveaway tx_hash:{}", event.transaction_hash))),
        },
    }
}

struct Listener {
    connector: Arc<dyn ChainConnector>,
    query: FilterQuery,
    giver: Arc<Giver>,
    pool: Option<WorkerPool>,
    subscribe_timeout: Duration,
    max_reconnect_attempts: u32,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    async fn subscribe(&self) -> Result<Box<dyn LogSubscription>> {
        timeout(
            self.subscribe_timeout,
            self.connector.subscribe_filter_logs(&self.query),
        )
        .await
        .map_err(|_| anyhow::anyhow!("SubscribeFilterLogs timed out"))?
        .context("SubscribeFilterLogs failed")
    }

    async fn resubscribe(&self) -> Result<Box<dyn LogSubscription>> {
        let retries = self.max_reconnect_attempts.saturating_sub(1) as usize;
        let strategy = ExponentialBackoff::from_millis(500)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(retries);

        Retry::spawn(strategy, || async {
            self.subscribe().await.inspect_err(|e| {
                warn!("Resubscribe attempt failed: {:#}", e);
            })
        })
        .await
    }

    async fn dispatch(&self, event: TransferEvent) {
        match &self.pool {
            Some(pool) => {
                if let Err(e) = pool.put_job(handle(self.giver.clone(), event)).await {
                    error!("Giveaway dispatch failed: {:#}", e);
                }
            }
            None => {
                if let Err(e) = handle(self.giver.clone(), event).await {
                    error!("Giveaway handler failed: {:#}", e);
                }
            }
        }
    }

    async fn run(self, initial: Box<dyn LogSubscription>, mut shutdown: watch::Receiver<bool>) {
        let mut subscription = Some(initial);
        let mut state = ListenerState::Subscribed;

        while state != ListenerState::Stopped {
            self.state.send_replace(state);
            state = match state {
                ListenerState::Subscribed => {
                    let Some(current) = subscription.as_mut() else {
                        break;
                    };
                    let next = tokio::select! {
                        _ = shutdown.changed() => None,
                        next = current.next_event() => Some(next),
                    };
                    match next {
                        None => {
                            info!("Giveaway listener closing");
                            ListenerState::Stopped
                        }
                        Some(Ok(event)) => {
                            self.dispatch(event).await;
                            ListenerState::Subscribed
                        }
                        Some(Err(e)) => match classify(&e) {
                            Transition::Reconnect => {
                                warn!("Subscription failed: {}, reconnecting", e);
                                ListenerState::Reconnecting
                            }
                            Transition::Stay => {
                                warn!("Subscription error: {}", e);
                                ListenerState::Subscribed
                            }
                        },
                    }
                }
                ListenerState::Reconnecting => {
                    if let Some(old) = subscription.take() {
                        old.unsubscribe();
                    }
                    match self.resubscribe().await {
                        Ok(fresh) => {
                            info!("Giveaway listener resubscribed");
                            subscription = Some(fresh);
                            ListenerState::Subscribed
                        }
                        Err(e) => {
                            error!("Giveaway listener cannot resubscribe, stopping: {:#}", e);
                            ListenerState::Stopped
                        }
                    }
                }
                ListenerState::Stopped => ListenerState::Stopped,
            };
        }

        if let Some(current) = subscription.take() {
            current.unsubscribe();
        }
        if let Some(pool) = self.pool {
            pool.close().await;
        }
        self.state.send_replace(ListenerState::Stopped);
    }
}

pub struct GiveawayService {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl GiveawayService {
    /// Fails when the initial subscription cannot be established.
    pub async fn start(connector: Arc<dyn ChainConnector>, config: &GiveawayConfig) -> Result<Self> {
        let payer = Payer::from_hex(&config.private_key)?;
        let repository = AmountRepository::new(&config.current_gave_wei_filepath);
        let gave = repository.load_or_init()?;
        let client = connector.dial_rpc().await.context("giveaway dial failed")?;

        info!(
            "Starting giveaway service: funding {}, {} tokens, gave {} of {} wei",
            payer.address(),
            config.token_addresses.len(),
            gave,
            config.max_cap_wei
        );

        let giver = Arc::new(Giver {
            client,
            payer,
            fixed_wei: config.fixed_giveaway_wei,
            max_cap_wei: config.max_cap_wei,
            handler_timeout: config.handler_timeout(),
            ledger: Mutex::new(GaveLedger { repository, gave }),
        });

        let (state_tx, state) = watch::channel(ListenerState::Subscribed);
        let listener = Listener {
            connector,
            query: FilterQuery::transfer(config.token_addresses.clone()),
            giver,
            pool: config
                .worker_pool
                .map(|pool| WorkerPool::new(pool.worker_num, pool.pool_size)),
            subscribe_timeout: config.subscribe_timeout(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            state: state_tx,
        };
        let initial = listener.subscribe().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(initial, shutdown_rx));

        Ok(GiveawayService {
            shutdown,
            state,
            task,
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Resolves once the listener has stopped for any reason.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ListenerState::Stopped).await;
    }

    /// Unsubscribes and drains the worker pool, if any.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Giveaway listener task panicked: {}", e);
        }
        info!("Giveaway service stopped");
    }
}

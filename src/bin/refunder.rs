use anyhow::Result;
use clap::Parser;
use refunder::config::Config;
use refunder::giveaway::GiveawayService;
use refunder::refunder::RefundService;
use refunder::chain::ChainClient;
use refunder::rpc::{Connector, RpcClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "refunder")]
#[command(about = "Pays gas refunds and giveaways for watched token transfers", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Starting refunder");

    let config = Config::load(&cli.config)?;
    info!("Configuration loaded from {}", cli.config.display());
    info!(
        "RPC URLs: {} endpoint(s), websocket URLs: {} endpoint(s)",
        config.server.rpc_addresses.len(),
        config.server.ws_addresses.len()
    );

    let idle_timeout = config
        .giveaway_service
        .as_ref()
        .and_then(|giveaway| giveaway.idle_timeout());
    let connector = Arc::new(Connector::new(
        &config.server.rpc_addresses,
        &config.server.ws_addresses,
        config.dial_timeout(),
        idle_timeout,
    )?);

    let refund = match config.gasfee_service.as_ref().filter(|s| s.is_enable) {
        Some(gasfee) => {
            let gas_oracle = match config.dynamic_gas_price_rpc() {
                Some(url) if gasfee.is_using_dynamic_gas_price => {
                    info!("Dynamic gas price from {}", url);
                    let client: Arc<dyn ChainClient> = Arc::new(RpcClient::new(&[url.to_string()])?);
                    Some(client)
                }
                _ => None,
            };
            Some(RefundService::start(connector.clone(), gas_oracle, gasfee)?)
        }
        None => {
            info!("Gas refund service disabled");
            None
        }
    };

    let giveaway = match config.giveaway_service.as_ref().filter(|s| s.is_enable) {
        Some(giveaway) => Some(GiveawayService::start(connector.clone(), giveaway).await?),
        None => {
            info!("Giveaway service disabled");
            None
        }
    };

    if refund.is_none() && giveaway.is_none() {
        warn!("No service enabled, exiting");
        return Ok(());
    }

    let mut giveaway_failed = false;
    match &giveaway {
        Some(service) => {
            tokio::select! {
                _ = shutdown_signal() => info!("Signal received, shutting down"),
                _ = service.stopped() => {
                    error!("Giveaway listener stopped unexpectedly, shutting down");
                    giveaway_failed = true;
                }
            }
        }
        None => {
            shutdown_signal().await;
            info!("Signal received, shutting down");
        }
    }

    if let Some(service) = giveaway {
        service.close().await;
    }
    if let Some(service) = refund {
        service.close().await;
    }

    if giveaway_failed {
        anyhow::bail!("giveaway listener could not resubscribe");
    }
    Ok(())
}

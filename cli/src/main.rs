//! chainrelay: watch two contracts over a pool of redundant WebSocket RPC
//! endpoints and forward their events to a game-server webhook.
//!
//! ```text
//! chainrelay                  # run the relay (same as `chainrelay run`)
//! chainrelay check-config     # validate the environment and print it
//! ```

mod abi;
mod config;
mod listeners;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time;
use tracing::{debug, info, warn};

use chainrelay_core::{EventBus, RpcClient, TRANSACTIONS_TOPIC};
use chainrelay_webhook::{HttpSink, WebhookDispatcher};
use chainrelay_ws::{ConnectionPool, TungsteniteConnector};

use crate::config::RelayConfig;
use crate::listeners::{ContractListener, CHECKED_IN, ITEM_PURCHASED};

/// Events a slow webhook may fall behind by before the bus drops them.
const BUS_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(
    name = "chainrelay",
    about = "Forward contract events from redundant WebSocket RPC endpoints to a webhook",
    long_about = "Configuration is read from the environment:\n\n  \
        RPC_URLS                comma-separated ws:// or wss:// endpoints (required)\n  \
        CHECK_IN_ADDRESS        check-in contract address (required)\n  \
        PURCHASE_ITEM_ADDRESS   shop contract address (required)\n  \
        WEBHOOK_URL             webhook base URL; unset disables delivery\n  \
        LOG_LEVEL, LOG_COMPONENTS, LOG_JSON\n\n\
        Timers and budgets: MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS, \
        HEARTBEAT_INTERVAL_MS, PONG_TIMEOUT_MS, CONNECT_TIMEOUT_MS, \
        WEBHOOK_MAX_RETRIES, WEBHOOK_TIMEOUT_MS, SHUTDOWN_GRACE_MS, \
        CLOSE_POLL_INTERVAL_MS.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted (default)
    Run,
    /// Validate the environment and print the resolved configuration as JSON
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::from_env().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    logging::init_tracing(&config.log);
    info!(
        endpoints = config.rpc_urls.len(),
        webhook = config.webhook_url.is_some(),
        version = env!("CARGO_PKG_VERSION"),
        "chainrelay starting"
    );

    let pool = ConnectionPool::connect(
        config.endpoints(),
        config.pool_config(),
        Arc::new(TungsteniteConnector),
    )
    .await
    .context("no RPC endpoint could be opened")?;

    let active = &pool.handles()[pool.active_index()];
    let chain_id = time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        active.call::<String>("eth_chainId", vec![]),
    );
    match chain_id.await {
        Ok(Ok(chain_id)) => info!(url = active.url(), %chain_id, "connected"),
        Ok(Err(e)) => warn!(url = active.url(), error = %e, "could not read chain id"),
        Err(_) => warn!(url = active.url(), "eth_chainId timed out"),
    }

    let bus = Arc::new(EventBus::new(BUS_CAPACITY));
    let sink = HttpSink::new(config.webhook_timeout()).context("building webhook client")?;
    let dispatcher = WebhookDispatcher::new(config.dispatcher_config(), Arc::new(sink));
    if !dispatcher.is_enabled() {
        warn!("WEBHOOK_URL not set, decoded events will only be logged");
    }
    let delivery = bus.subscribe(TRANSACTIONS_TOPIC, dispatcher.clone());
    debug!(
        topic = TRANSACTIONS_TOPIC,
        subscribers = bus.subscriber_count(TRANSACTIONS_TOPIC),
        "webhook dispatcher attached"
    );

    for (address, event) in [
        (&config.check_in_address, &CHECKED_IN),
        (&config.purchase_item_address, &ITEM_PURCHASED),
    ] {
        ContractListener::new(address.as_str(), event, Arc::clone(&bus))
            .start(&pool)
            .await
            .with_context(|| format!("subscribing to {} on {address}", event.name))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;

    info!(
        health = ?pool.health(),
        states = ?pool.states(),
        stats = ?dispatcher.stats(),
        "interrupt received, shutting down"
    );
    pool.shutdown().await;
    delivery.abort();
    info!("chainrelay stopped");
    Ok(())
}

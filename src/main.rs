//! TWAP Relayer - cross-chain time-weighted order execution
//!
//! This relayer watches the order-scheduling and bridge contracts, splits each
//! order into time-sliced chunks, locks every chunk on the source chain, and
//! settles it on the destination chain through a liquidity auction.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

mod analytics;
mod api;
mod bridge;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod retry;
mod settlement;
mod state;
mod tx;

use analytics::AnalyticsRecorder;
use bridge::BridgeCoordinator;
use chain::contracts::{contract_addresses, ConfirmationWait, OnChainBridge, OnChainExecutor, OnChainScheduler};
use chain::cursor::CursorSettings;
use chain::{ChainManager, EventCursor, LogFilter};
use config::Settings;
use coordination::{CoordinationEngine, Direction};
use error::RelayerResult;
use ethers::types::Address;
use metrics::MetricsServer;
use settlement::{AuctionClient, SettlementClient};
use state::{StateManager, StateStore};
use std::collections::HashMap;
use tx::{GasEstimator, TransactionSender};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting TWAP Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.relayer.instance_id
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");
    let state_store: Arc<dyn StateStore> = state_manager.clone();

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized");

    // Wallet and transaction submission
    let wallet = TransactionSender::load_wallet(&settings.wallet.private_key_env)?;
    let gas_estimator = GasEstimator::new(settings.settlement.gas_limit_multiplier_percent);
    let sender = Arc::new(TransactionSender::new(chain_manager.clone(), wallet, gas_estimator.clone()).await?);

    // Contract collaborators
    let schedulers = contract_addresses(&settings, |c| c.scheduler_address.as_ref())?;
    let bridges = contract_addresses(&settings, |c| c.bridge_address.as_ref())?;
    let executors = contract_addresses(&settings, |c| c.executor_address.as_ref())?;
    let wait = ConfirmationWait {
        timeout: Duration::from_secs(settings.settlement.confirmation_timeout_secs),
        poll_interval: Duration::from_millis(settings.settlement.confirmation_poll_ms),
    };

    let retry = settings.retry.policy();
    let bridge = BridgeCoordinator::new(
        Arc::new(OnChainBridge::new(
            sender.clone(),
            chain_manager.clone(),
            bridges.clone(),
            wait,
        )),
        retry.clone(),
        // Bridged funds are delivered to the destination executor
        executors.clone(),
    );
    let settlement = SettlementClient::new(
        Arc::new(AuctionClient::new(&settings.settlement)?),
        Arc::new(OnChainExecutor::new(
            sender.clone(),
            chain_manager.clone(),
            executors.clone(),
            wait,
        )),
        retry.with_max_attempts(settings.settlement.max_attempts),
        gas_estimator,
        settings.settlement.auction_period_secs,
    );
    let analytics = Arc::new(
        AnalyticsRecorder::open(&settings.analytics.path, settings.analytics.price_impact_fraction).await?,
    );

    // Event cursors
    let cursors = open_cursors(
        &settings,
        &chain_manager,
        &state_store,
        &[
            (&schedulers, events::topics::scheduler()),
            (&bridges, events::topics::bridge()),
            (&executors, events::topics::executor()),
        ],
    )
    .await?;
    info!("Opened {} event cursors", cursors.len());

    // Initialize coordination engine
    let coordination_engine = Arc::new(CoordinationEngine::new(
        settings.relayer.clone(),
        settings.route(Direction::AToB),
        state_store.clone(),
        cursors,
        Arc::new(OnChainScheduler::new(chain_manager.clone(), schedulers)),
        bridge,
        settlement,
        analytics.clone(),
    ));
    coordination_engine
        .recover(chrono::Utc::now().timestamp().max(0) as u64)
        .await?;
    info!("Coordination engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            state_store: state_store.clone(),
            chain_manager: chain_manager.clone(),
            orders: coordination_engine.store(),
            analytics,
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = coordination_engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let state_store = state_store.clone();
        let sender = sender.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                // Check chain connections
                let mut healthy = true;
                for (chain_id, ok) in chain_manager.health_check().await {
                    if !ok {
                        healthy = false;
                        warn!("Chain {} health check failed", chain_id);
                    } else if let Err(e) = sender.get_balance(chain_id).await {
                        warn!("Balance check failed on chain {}: {}", chain_id, e);
                    }
                }

                // Check database connection
                if let Err(e) = state_store.health_check().await {
                    healthy = false;
                    warn!("Database health check failed: {}", e);
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("TWAP Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: the engine drains in-flight chunks within its grace period
    coordination_engine.stop().await;
    let drain_limit = Duration::from_secs(settings.relayer.shutdown_grace_secs + 5);
    if tokio::time::timeout(drain_limit, coordination_handle).await.is_err() {
        warn!("Coordination engine did not stop within {:?}", drain_limit);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("TWAP Relayer stopped");
    Ok(())
}

/// One cursor per (chain, contract) pair that is configured
async fn open_cursors(
    settings: &Settings,
    chain_manager: &ChainManager,
    state_store: &Arc<dyn StateStore>,
    contracts: &[(&HashMap<u64, Address>, Vec<ethers::types::H256>)],
) -> RelayerResult<Vec<EventCursor>> {
    let mut cursors = Vec::new();
    for (_, chain) in settings.enabled_chains() {
        let cursor_settings = CursorSettings {
            confirmations: chain.confirmations(),
            max_block_range: settings.relayer.max_block_range,
            retention_blocks: settings.relayer.dedup_retention_blocks,
            max_entries: settings.relayer.dedup_max_entries,
        };

        for (addresses, topics) in contracts {
            let Some(address) = addresses.get(&chain.chain_id) else {
                continue;
            };
            let cursor = EventCursor::open(
                chain_manager.ledger(chain.chain_id)?,
                LogFilter::new(*address, topics.clone()),
                state_store.clone(),
                cursor_settings,
                chain.start_block,
            )
            .await?;
            cursors.push(cursor);
        }
    }
    Ok(cursors)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,twap_relayer=debug,sqlx=warn,hyper=warn")
    });
    let json = std::env::var("RELAYER_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! Chain module - ledger access, deduplicating cursors, and finality tracking
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - A polling log-query surface (`LedgerClient`) with no business logic
//! - Deduplicating event cursors with persisted checkpoints
//! - Chain-specific finality tracking
//! - Contract call encoding for the scheduler, bridge, and executor

pub mod contracts;
pub mod cursor;
pub mod finality;
pub mod provider;

pub use cursor::{EventCursor, EventSink, ProcessedEventKey};
pub use finality::FinalityTracker;
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Log, H256};
use std::sync::Arc;
use tracing::info;

/// Address and topic-0 alternatives a cursor is interested in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<H256>,
}

impl LogFilter {
    pub fn new(address: Address, topics: Vec<H256>) -> Self {
        Self { address, topics }
    }

    /// Reject inputs that can never be a valid query
    pub fn validate(&self, from_block: u64, to_block: u64) -> RelayerResult<()> {
        if self.topics.is_empty() {
            return Err(RelayerError::InvalidFilter("no topics".to_string()));
        }
        if from_block > to_block {
            return Err(RelayerError::InvalidFilter(format!(
                "from block {} after to block {}",
                from_block, to_block
            )));
        }
        Ok(())
    }
}

/// Pure query surface over a chain's logs. No retry logic lives here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn current_height(&self) -> RelayerResult<u64>;

    /// Logs in `[from_block, to_block]` matching `filter`
    async fn fetch_logs(&self, from_block: u64, to_block: u64, filter: &LogFilter) -> RelayerResult<Vec<Log>>;
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
    /// Finality trackers indexed by chain ID
    finality_trackers: DashMap<u64, Arc<FinalityTracker>>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub async fn new(settings: &Settings) -> RelayerResult<Self> {
        let providers = DashMap::new();
        let finality_trackers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let provider = Arc::new(ChainProvider::new(chain_config.clone()).await?);
            providers.insert(chain_config.chain_id, provider.clone());

            let finality = FinalityTracker::new(
                chain_config.chain_id,
                chain_config.confirmations(),
                provider,
            );
            finality_trackers.insert(chain_config.chain_id, Arc::new(finality));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(Self {
            providers,
            finality_trackers,
        })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> RelayerResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Log-query surface for a specific chain
    pub fn ledger(&self, chain_id: u64) -> RelayerResult<Arc<dyn LedgerClient>> {
        Ok(self.get_provider(chain_id)? as Arc<dyn LedgerClient>)
    }

    /// Get finality tracker for a specific chain
    pub fn get_finality_tracker(&self, chain_id: u64) -> RelayerResult<Arc<FinalityTracker>> {
        self.finality_trackers
            .get(&chain_id)
            .map(|f| f.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Health check for all chains, checked concurrently
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let checks = providers.iter().map(|provider| async move {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.chain_id(), healthy);
            (provider.chain_id(), healthy)
        });

        futures::future::join_all(checks).await
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}

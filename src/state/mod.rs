//! State management with PostgreSQL persistence
//!
//! Handles:
//! - Block checkpoints per cursor stream for restart recovery
//! - Processed-event keys backing log deduplication
//! - Order and chunk snapshots

mod manager;
#[cfg(test)]
pub(crate) mod memory;

pub use manager::StateManager;

use crate::chain::ProcessedEventKey;
use crate::coordination::Order;
use crate::error::RelayerResult;

use async_trait::async_trait;

/// Durable state shared by the cursors and the coordination engine
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last fully processed block of a cursor stream
    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, stream: &str, chain_id: u64, block_number: u64) -> RelayerResult<()>;

    /// Processed keys of a cursor stream at or above `since_block`, with their block numbers
    async fn load_processed_events(
        &self,
        stream: &str,
        since_block: u64,
    ) -> RelayerResult<Vec<(ProcessedEventKey, u64)>>;

    async fn record_processed_event(
        &self,
        stream: &str,
        key: &ProcessedEventKey,
        block_number: u64,
    ) -> RelayerResult<()>;

    /// Drop a stream's keys below `below_block`. Returns the number removed.
    async fn prune_processed_events(&self, stream: &str, below_block: u64) -> RelayerResult<u64>;

    /// Upsert a snapshot of an order and its chunks
    async fn save_order(&self, order: &Order) -> RelayerResult<()>;

    async fn load_orders(&self) -> RelayerResult<Vec<Order>>;

    async fn health_check(&self) -> RelayerResult<()>;
}

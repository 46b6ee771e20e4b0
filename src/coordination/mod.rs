//! Coordination of time-weighted orders across two chains
//!
//! The coordination engine:
//! 1. Consumes deduplicated events from the scheduler and bridge contracts
//! 2. Tracks every order and its chunk state machine
//! 3. Locks due chunks on the source chain, one chunk per order at a time
//! 4. Settles bridged chunks through the liquidity auction
//! 5. Records analytics for every settled chunk

pub mod engine;
pub mod order;
pub mod scheduler;
pub mod store;

pub use engine::{ChunkOutcome, CoordinationEngine};
pub use order::{Chunk, ChunkState, Direction, Order, OrderId, OrderParams, Route};
pub use store::OrderStore;

use crate::error::RelayerResult;

use async_trait::async_trait;

/// Read access to the order-scheduling contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Full order parameters, as stored on chain
    async fn fetch_order(&self, chain_id: u64, order_id: OrderId) -> RelayerResult<OrderParams>;
}

//! Settlement of bridged chunks through the liquidity auction
//!
//! A chunk is settled by quoting it with the auction service, having the
//! service build the settlement order, and executing the resulting swap on
//! the destination chain's executor contract.

mod auction;
mod client;

pub use auction::AuctionClient;
pub use client::{SettlementClient, SettlementReport};

use crate::coordination::OrderId;
use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// Parameters of one chunk's quote request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    /// Chain the swap executes on
    pub chain_id: u64,
    pub order_id: OrderId,
    pub chunk_index: u32,
    pub token_in: Address,
    pub token_out: Address,
    pub amount: U256,
    pub auction_period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub expected_out: U256,
    pub settlement_payload: Bytes,
    pub gas_estimate: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedOrder {
    /// Calldata payload handed to the executor's `executeSwap`
    pub tx_payload: Bytes,
}

/// External liquidity-auction service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiquidityAuction: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> RelayerResult<Quote>;

    async fn submit_order(&self, request: &QuoteRequest, quote: &Quote) -> RelayerResult<SubmittedOrder>;
}

/// Arguments of the executor's `executeSwap` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapCall {
    pub chain_id: u64,
    pub order_id: OrderId,
    pub chunk_index: u32,
    pub token_in: Address,
    pub token_out: Address,
    pub amount: U256,
    pub settlement_payload: Bytes,
}

/// Confirmed outcome of an executed swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// From the executor's `SwapExecuted` event
    pub amount_out: U256,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

/// Destination-chain executor contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapExecutor: Send + Sync {
    async fn estimate_swap_gas(&self, call: &SwapCall) -> RelayerResult<U256>;

    /// Broadcast `executeSwap`. Errors mean nothing reached the network.
    async fn execute_swap(&self, call: &SwapCall, gas_limit: U256) -> RelayerResult<H256>;

    /// Wait for the swap to be final and read its `SwapExecuted` event
    async fn confirm_swap(&self, call: &SwapCall, tx_hash: H256) -> RelayerResult<SwapReceipt>;
}

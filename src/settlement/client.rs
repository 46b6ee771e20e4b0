//! Settlement flow for one bridged chunk

use super::{LiquidityAuction, Quote, QuoteRequest, SwapCall, SwapExecutor};
use crate::coordination::{Order, OrderId};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;
use crate::tx::GasEstimator;

use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the analytics recorder needs about a settled chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReport {
    pub order_id: OrderId,
    pub chunk_index: u32,
    pub chain_id: u64,
    pub tx_hash: H256,
    pub amount_in: U256,
    /// Quoted output before the trade
    pub expected_out: U256,
    /// Output reported by the executor's `SwapExecuted` event
    pub amount_out: U256,
    /// Wei spent on gas
    pub gas_cost: U256,
}

pub struct SettlementClient {
    auction: Arc<dyn LiquidityAuction>,
    executor: Arc<dyn SwapExecutor>,
    retry: RetryPolicy,
    gas: GasEstimator,
    auction_period_secs: u64,
}

impl SettlementClient {
    pub fn new(
        auction: Arc<dyn LiquidityAuction>,
        executor: Arc<dyn SwapExecutor>,
        retry: RetryPolicy,
        gas: GasEstimator,
        auction_period_secs: u64,
    ) -> Self {
        Self {
            auction,
            executor,
            retry,
            gas,
            auction_period_secs,
        }
    }

    /// Quote, build, execute, and confirm the swap for a locked and
    /// bridged chunk. `token_in` is the token the bridge delivered.
    pub async fn settle(&self, order: &Order, chunk_index: u32, token_in: Address) -> RelayerResult<SettlementReport> {
        let chunk = order
            .chunk(chunk_index)
            .ok_or_else(|| RelayerError::UnknownChunk {
                order_id: order.order_id.to_string(),
                chunk_index,
            })?;
        let floor = order.chunk_floor(chunk_index);
        let request = QuoteRequest {
            chain_id: order.route.destination_chain,
            order_id: order.order_id,
            chunk_index,
            token_in,
            token_out: order.to_token,
            amount: chunk.amount,
            auction_period_secs: self.auction_period_secs,
        };

        let quote = self
            .retry
            .run("auction_quote", |_| self.quote_above_floor(&request, floor))
            .await?;
        debug!(
            "Quote for chunk {} of order {}: {} out, {} gas",
            chunk_index, order.order_id, quote.expected_out, quote.gas_estimate
        );

        let submitted = self
            .retry
            .run("auction_submit", |_| self.auction.submit_order(&request, &quote))
            .await?;

        let call = SwapCall {
            chain_id: request.chain_id,
            order_id: order.order_id,
            chunk_index,
            token_in,
            token_out: order.to_token,
            amount: chunk.amount,
            settlement_payload: submitted.tx_payload,
        };

        let tx_hash = self
            .retry
            .run("execute_swap", |_| self.execute(&call, quote.gas_estimate))
            .await?;
        info!(
            "Swap for chunk {} of order {} broadcast on chain {}: {:?}",
            chunk_index, order.order_id, call.chain_id, tx_hash
        );

        // Broadcast happened: from here on a failure is final for this chunk
        let receipt = self.executor.confirm_swap(&call, tx_hash).await?;

        Ok(SettlementReport {
            order_id: order.order_id,
            chunk_index,
            chain_id: call.chain_id,
            tx_hash: receipt.tx_hash,
            amount_in: chunk.amount,
            expected_out: quote.expected_out,
            amount_out: receipt.amount_out,
            gas_cost: receipt.gas_used * receipt.effective_gas_price,
        })
    }

    async fn quote_above_floor(&self, request: &QuoteRequest, floor: U256) -> RelayerResult<Quote> {
        let quote = self.auction.quote(request).await?;
        if quote.expected_out < floor {
            return Err(RelayerError::QuoteBelowFloor {
                quoted: quote.expected_out.to_string(),
                floor: floor.to_string(),
            });
        }
        Ok(quote)
    }

    async fn execute(&self, call: &SwapCall, quoted_gas: U256) -> RelayerResult<H256> {
        let estimate = self.executor.estimate_swap_gas(call).await?;
        let gas_limit = self.gas.gas_limit(estimate, Some(quoted_gas));
        self.executor.execute_swap(call, gas_limit).await
    }
}

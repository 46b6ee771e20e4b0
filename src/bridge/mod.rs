//! Bridge coordination: locking a chunk's funds on the source chain
//!
//! The lock call itself is retried with bounded backoff while it fails before
//! broadcast. Waiting for the matching `TransferConfirmed` event is not done
//! here; it arrives through the bridge cursor and is applied by the engine.

use crate::coordination::{Order, OrderId};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::RetryPolicy;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Arguments of the bridge's `lockTokens` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub source_chain: u64,
    pub destination_chain: u64,
    pub order_id: OrderId,
    pub chunk_index: u32,
    pub token: Address,
    pub amount: U256,
    /// Receiver of the bridged funds on the destination chain
    pub recipient: Address,
}

/// Source-chain bridge collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BridgeContract: Send + Sync {
    /// Lock funds and return the mined lock transaction
    async fn lock_tokens(&self, request: &LockRequest) -> RelayerResult<H256>;
}

pub struct BridgeCoordinator {
    bridge: Arc<dyn BridgeContract>,
    retry: RetryPolicy,
    /// Destination chain id -> recipient of bridged funds (the executor)
    recipients: HashMap<u64, Address>,
}

impl BridgeCoordinator {
    pub fn new(bridge: Arc<dyn BridgeContract>, retry: RetryPolicy, recipients: HashMap<u64, Address>) -> Self {
        Self {
            bridge,
            retry,
            recipients,
        }
    }

    /// Build the lock request for one chunk of an order
    pub fn lock_request(&self, order: &Order, chunk_index: u32) -> RelayerResult<LockRequest> {
        let chunk = order
            .chunk(chunk_index)
            .ok_or_else(|| RelayerError::UnknownChunk {
                order_id: order.order_id.to_string(),
                chunk_index,
            })?;
        let recipient = self
            .recipients
            .get(&order.route.destination_chain)
            .copied()
            .ok_or_else(|| {
                RelayerError::Config(format!(
                    "no bridge recipient for chain {}",
                    order.route.destination_chain
                ))
            })?;

        Ok(LockRequest {
            source_chain: order.route.source_chain,
            destination_chain: order.route.destination_chain,
            order_id: order.order_id,
            chunk_index,
            token: order.from_token,
            amount: chunk.amount,
            recipient,
        })
    }

    /// Lock a chunk's funds, retrying transient failures
    pub async fn lock(&self, request: &LockRequest) -> RelayerResult<H256> {
        let lock_tx = self
            .retry
            .run("lock_tokens", |_| self.bridge.lock_tokens(request))
            .await?;

        info!(
            "Locked chunk {} of order {} on chain {}: {:?}",
            request.chunk_index, request.order_id, request.source_chain, lock_tx
        );
        Ok(lock_tx)
    }
}

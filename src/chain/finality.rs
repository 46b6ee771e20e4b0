//! Chain finality tracking for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: L1 finality, we use soft finality
//! - Etherlink: fast sequencer finality (a couple of blocks)
//! - Avalanche: Instant finality (1 block)

use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Waits for transactions on a specific chain to become final
pub struct FinalityTracker {
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    provider: Arc<ChainProvider>,
}

impl FinalityTracker {
    pub fn new(chain_id: u64, confirmation_blocks: u64, provider: Arc<ChainProvider>) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
            provider,
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Wait until `tx_hash` is mined, successful, and buried under the
    /// configured confirmation depth.
    ///
    /// The receipt is re-read on every poll, so a transaction that gets
    /// reorged out keeps being waited for rather than being reported final.
    /// Reaching `timeout` is terminal: the caller must not resubmit.
    pub async fn await_finality(
        &self,
        tx_hash: H256,
        timeout: Duration,
        poll_interval: Duration,
    ) -> RelayerResult<TransactionReceipt> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.check(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e @ RelayerError::Reverted { .. }) => return Err(e),
                Err(e) => warn!(
                    "Finality check for {:?} on chain {} failed: {}",
                    tx_hash, self.chain_id, e
                ),
            }

            if Instant::now() >= deadline {
                return Err(RelayerError::FinalityNotReached {
                    chain_id: self.chain_id,
                    tx_hash: format!("{:?}", tx_hash),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// One finality check: `Some(receipt)` once final, `None` while pending
    async fn check(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            debug!("Transaction {:?} not yet mined on chain {}", tx_hash, self.chain_id);
            return Ok(None);
        };
        let Some(tx_block) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(None);
        };

        if receipt.status == Some(0u64.into()) {
            return Err(RelayerError::Reverted {
                chain_id: self.chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        let current_block = self.provider.get_block_number().await?;
        let confirmations = current_block.saturating_sub(tx_block) + 1;
        if confirmations < self.confirmation_blocks {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                tx_hash, confirmations, self.confirmation_blocks, self.chain_id
            );
            return Ok(None);
        }

        // Re-read after the depth check so a reorg in between is not missed
        match self.provider.get_transaction_receipt(tx_hash).await? {
            Some(latest) if latest.block_hash == receipt.block_hash => {
                info!(
                    "Transaction {:?} final on chain {} ({} confirmations)",
                    tx_hash, self.chain_id, confirmations
                );
                Ok(Some(latest))
            }
            _ => {
                warn!(
                    "Reorg detected: tx {:?} moved away from block {} on chain {}",
                    tx_hash, tx_block, self.chain_id
                );
                Ok(None)
            }
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Etherlink mainnet and testnet
        42793 | 128123 => 2,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent chunk tasks never share a nonce
//! - Nonce gap detection and recovery after "nonce too low"

use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
#[derive(Debug)]
struct ChainNonceState {
    /// Next nonce to hand out
    current: u64,
    /// Broadcast transactions: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

/// Manages nonces across multiple chains
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Initialize nonce for a chain from its pending transaction count
    pub async fn init_chain(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.init(provider.chain_id(), on_chain);
        Ok(())
    }

    pub(super) fn init(&self, chain_id: u64, on_chain: u64) {
        self.chain_state.insert(
            chain_id,
            Mutex::new(ChainNonceState {
                current: on_chain,
                pending: BTreeMap::new(),
            }),
        );
        debug!("Initialized nonce for chain {}: {}", chain_id, on_chain);
    }

    fn not_initialized(chain_id: u64) -> RelayerError {
        RelayerError::Nonce {
            chain_id,
            message: "Chain not initialized".to_string(),
        }
    }

    /// Allocate the next nonce for a chain
    pub async fn get_nonce(&self, chain_id: u64) -> RelayerResult<u64> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, chain_id: u64, nonce: u64, tx_hash: &str) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        state.lock().await.pending.insert(nonce, tx_hash.to_string());
        Ok(())
    }

    /// Give back a nonce whose transaction never reached the network
    pub async fn release_nonce(&self, chain_id: u64, nonce: u64) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be reused without leaving a gap
        if state.current == nonce + 1 {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.apply_on_chain(provider.chain_id(), on_chain).await
    }

    async fn apply_on_chain(&self, chain_id: u64, on_chain: u64) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        if on_chain > state.current {
            warn!(
                "Nonce gap detected on chain {}: local {}, on-chain {}",
                chain_id, state.current, on_chain
            );
            state.current = on_chain;
        }

        // Everything below the on-chain count has been mined
        state.pending = state.pending.split_off(&on_chain);
        Ok(())
    }

    /// Broadcast transactions not yet mined
    pub async fn pending_count(&self, chain_id: u64) -> usize {
        match self.chain_state.get(&chain_id) {
            Some(state) => state.lock().await.pending.len(),
            None => 0,
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_allocation_and_release() {
        let nonces = NonceManager::new(Address::zero());
        nonces.init(1, 7);

        assert_eq!(nonces.get_nonce(1).await.unwrap(), 7);
        assert_eq!(nonces.get_nonce(1).await.unwrap(), 8);

        // Releasing an older nonce would leave a gap, so it is not reused
        nonces.release_nonce(1, 7).await.unwrap();
        assert_eq!(nonces.get_nonce(1).await.unwrap(), 9);

        nonces.release_nonce(1, 9).await.unwrap();
        assert_eq!(nonces.get_nonce(1).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_sync_skips_ahead_and_clears_mined() {
        let nonces = NonceManager::new(Address::zero());
        nonces.init(1, 0);
        for n in 0..3 {
            let nonce = nonces.get_nonce(1).await.unwrap();
            nonces.mark_pending(1, nonce, &format!("0x{}", n)).await.unwrap();
        }
        assert_eq!(nonces.pending_count(1).await, 3);

        nonces.apply_on_chain(1, 5).await.unwrap();
        assert_eq!(nonces.pending_count(1).await, 0);
        assert_eq!(nonces.get_nonce(1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_uninitialized_chain() {
        let nonces = NonceManager::new(Address::zero());
        assert!(matches!(
            nonces.get_nonce(99).await,
            Err(RelayerError::Nonce { chain_id: 99, .. })
        ));
    }
}

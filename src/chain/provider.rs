//! Chain provider with multi-RPC support and automatic failover

use super::{LedgerClient, LogFilter};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, message: impl ToString) -> RelayerError {
        RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!(
                        "Failed to get logs from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Read-only contract call
    pub async fn call(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        self.http().call(tx, None).await.map_err(|e| {
            let message = e.to_string();
            if message.contains("revert") {
                RelayerError::Contract(message)
            } else {
                self.connection_error(message)
            }
        })
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(1_000_000_000u64);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
    }

    /// Account nonce including pending transactions
    pub async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| RelayerError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

}

#[async_trait]
impl LedgerClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn fetch_logs(&self, from_block: u64, to_block: u64, filter: &LogFilter) -> RelayerResult<Vec<Log>> {
        filter.validate(from_block, to_block)?;

        let topic0: Topic =
            ValueOrArray::Array(filter.topics.iter().map(|t| Some(*t)).collect());
        let query = Filter::new()
            .address(filter.address)
            .topic0(topic0)
            .from_block(from_block)
            .to_block(to_block);

        self.get_logs(&query).await
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

//! Transaction sender: signs and broadcasts one transaction per call
//!
//! A call makes a single broadcast attempt. Failures before the network
//! accepted the transaction are classified so the caller's retry policy can
//! decide; once a hash exists the transaction is never rebroadcast from here.

use super::{GasEstimator, NonceManager};
use crate::chain::{ChainManager, ChainProvider, GasPrice};
use crate::error::{RelayerError, RelayerResult};
use crate::events::keccak256;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Transaction sender shared by the bridge and executor contracts
pub struct TransactionSender {
    chain_manager: Arc<ChainManager>,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: GasEstimator,
    /// Wallet for signing
    wallet: LocalWallet,
    send_timeout: Duration,
}

impl TransactionSender {
    /// Create a sender and initialize nonces for every connected chain
    pub async fn new(
        chain_manager: Arc<ChainManager>,
        wallet: LocalWallet,
        gas_estimator: GasEstimator,
    ) -> RelayerResult<Self> {
        let wallet_address = wallet.address();
        info!("Transaction sender initialized with wallet: {:?}", wallet_address);

        let nonce_manager = Arc::new(NonceManager::new(wallet_address));
        for chain_id in chain_manager.connected_chains() {
            let provider = chain_manager.get_provider(chain_id)?;
            if let Err(e) = nonce_manager.init_chain(&provider).await {
                warn!("Failed to init nonce for chain {}: {}", chain_id, e);
            }
        }

        Ok(Self {
            chain_manager,
            nonce_manager,
            gas_estimator,
            wallet,
            send_timeout: Duration::from_secs(30),
        })
    }

    /// Load the signing key from the named environment variable
    pub fn load_wallet(env_var: &str) -> RelayerResult<LocalWallet> {
        let key = std::env::var(env_var)
            .map_err(|_| RelayerError::Wallet(format!("{} is not set", env_var)))?;
        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn gas_estimator(&self) -> &GasEstimator {
        &self.gas_estimator
    }

    pub fn provider(&self, chain_id: u64) -> RelayerResult<Arc<ChainProvider>> {
        self.chain_manager.get_provider(chain_id)
    }

    /// Node gas estimate for a call sent from the relayer wallet
    pub async fn estimate_gas(&self, chain_id: u64, to: Address, data: &Bytes) -> RelayerResult<U256> {
        let provider = self.chain_manager.get_provider(chain_id)?;
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(to)
            .data(data.clone())
            .into();
        provider.estimate_gas(&tx).await
    }

    /// Sign and broadcast a contract call
    pub async fn send(&self, chain_id: u64, to: Address, data: Bytes, gas_limit: U256) -> RelayerResult<H256> {
        let provider = self.chain_manager.get_provider(chain_id)?;
        let gas_price = self.gas_estimator.get_gas_price(&provider).await?;
        let nonce = self.nonce_manager.get_nonce(chain_id).await?;

        let tx = self.build_tx(chain_id, to, data, nonce, gas_limit, &gas_price);
        let signature = match self.wallet.clone().with_chain_id(chain_id).sign_transaction(&tx).await {
            Ok(signature) => signature,
            Err(e) => {
                self.nonce_manager.release_nonce(chain_id, nonce).await?;
                return Err(RelayerError::Wallet(e.to_string()));
            }
        };
        let raw = tx.rlp_signed(&signature);
        let local_hash = H256(keccak256(&raw));

        match timeout(self.send_timeout, provider.send_raw_transaction(raw)).await {
            Ok(Ok(tx_hash)) => {
                self.nonce_manager
                    .mark_pending(chain_id, nonce, &format!("{:?}", tx_hash))
                    .await?;
                crate::metrics::record_tx_submitted(chain_id);
                info!("Transaction sent on chain {}: {:?} (nonce {})", chain_id, tx_hash, nonce);
                Ok(tx_hash)
            }
            Ok(Err(e)) => match classify_send_error(chain_id, &e.to_string()) {
                SendRejection::AlreadyKnown => {
                    // Same signed bytes are already in the pool
                    warn!(
                        "Transaction already known on chain {}, tracking {:?}",
                        chain_id, local_hash
                    );
                    track_broadcast(&self.nonce_manager, chain_id, nonce, local_hash).await
                }
                SendRejection::Rejected(err) => {
                    if matches!(err, RelayerError::Nonce { .. }) {
                        warn!("Nonce too low on chain {}, syncing", chain_id);
                        self.nonce_manager.sync(&provider).await?;
                    } else {
                        self.nonce_manager.release_nonce(chain_id, nonce).await?;
                    }
                    error!("Transaction rejected on chain {}: {}", chain_id, err);
                    Err(err)
                }
            },
            Err(_) => {
                // The node may have accepted it. Treat as broadcast and let
                // confirmation decide.
                warn!(
                    "Transaction send timed out on chain {}, tracking {:?}",
                    chain_id, local_hash
                );
                track_broadcast(&self.nonce_manager, chain_id, nonce, local_hash).await
            }
        }
    }

    fn build_tx(
        &self,
        chain_id: u64,
        to: Address,
        data: Bytes,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let from = self.wallet.address();
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Get wallet balance on a chain
    pub async fn get_balance(&self, chain_id: u64) -> RelayerResult<U256> {
        let provider = self.chain_manager.get_provider(chain_id)?;
        provider
            .http()
            .get_balance(self.wallet.address(), None)
            .await
            .map_err(|e| RelayerError::ChainConnection {
                chain_id,
                message: e.to_string(),
            })
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }
}

/// Keep the nonce reserved for a transaction the network may hold
async fn track_broadcast(
    nonce_manager: &NonceManager,
    chain_id: u64,
    nonce: u64,
    tx_hash: H256,
) -> RelayerResult<H256> {
    nonce_manager
        .mark_pending(chain_id, nonce, &format!("{:?}", tx_hash))
        .await?;
    Ok(tx_hash)
}

/// Outcome of a node refusing `eth_sendRawTransaction`
#[derive(Debug)]
pub(crate) enum SendRejection {
    /// The node already holds this exact transaction
    AlreadyKnown,
    Rejected(RelayerError),
}

/// Map a node's rejection message onto the error taxonomy
pub(crate) fn classify_send_error(chain_id: u64, message: &str) -> SendRejection {
    let lower = message.to_lowercase();
    if lower.contains("already known") || lower.contains("known transaction") {
        return SendRejection::AlreadyKnown;
    }
    let err = if lower.contains("nonce too low") {
        RelayerError::Nonce {
            chain_id,
            message: message.to_string(),
        }
    } else if lower.contains("insufficient funds") {
        RelayerError::InsufficientBalance {
            chain_id,
            message: message.to_string(),
        }
    } else if lower.contains("revert") {
        RelayerError::Contract(message.to_string())
    } else {
        // Underpriced replacements, pool limits, and transport failures
        RelayerError::Transaction(message.to_string())
    };
    SendRejection::Rejected(err)
}

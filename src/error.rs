//! Error types for the TWAP relayer

use thiserror::Error;

/// Failure classes the coordinator reacts to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC/network timeouts, rate limits. Retried with bounded backoff at the call site.
    TransientInfra,
    /// Contract reverts, invalid quote requests, insufficient funds. Fails the chunk, no retry.
    PermanentRejection,
    /// Malformed log. The offending log is skipped.
    Decode,
    /// Missing or invalid configuration. Fatal at startup.
    Configuration,
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    Reverted { chain_id: u64, tx_hash: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event decoding error: {0}")]
    EventDecode(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract call error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Finality not reached for tx {tx_hash} on chain {chain_id}")]
    FinalityNotReached { chain_id: u64, tx_hash: String },

    #[error("Insufficient balance on chain {chain_id}: {message}")]
    InsufficientBalance { chain_id: u64, message: String },

    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Liquidity auction unavailable (status {status:?}): {message}")]
    AuctionUnavailable { status: Option<u16>, message: String },

    #[error("Liquidity auction rejected request (status {status}): {message}")]
    QuoteRejected { status: u16, message: String },

    #[error("Malformed liquidity auction response: {0}")]
    AuctionResponse(String),

    #[error("Quote of {quoted} is below the chunk floor of {floor}")]
    QuoteBelowFloor { quoted: String, floor: String },

    #[error("Order {order_id} rejected: {reason}")]
    OrderRejected { order_id: String, reason: String },

    #[error("Order {order_id} not tracked")]
    UnknownOrder { order_id: String },

    #[error("Chunk {chunk_index} of order {order_id} not found")]
    UnknownChunk { order_id: String, chunk_index: u32 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<RelayerError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Classify the error into the coordinator's failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayerError::Database(_)
            | RelayerError::ChainConnection { .. }
            | RelayerError::Transaction(_)
            | RelayerError::Nonce { .. }
            | RelayerError::GasEstimation(_)
            | RelayerError::Timeout { .. }
            | RelayerError::RateLimited { .. }
            | RelayerError::AuctionUnavailable { .. }
            | RelayerError::QuoteBelowFloor { .. }
            | RelayerError::Io(_) => ErrorClass::TransientInfra,

            RelayerError::EventDecode(_) => ErrorClass::Decode,

            RelayerError::Config(_)
            | RelayerError::ChainNotFound { .. }
            | RelayerError::Wallet(_) => ErrorClass::Configuration,

            RelayerError::InvalidFilter(_)
            | RelayerError::Reverted { .. }
            | RelayerError::Contract(_)
            | RelayerError::FinalityNotReached { .. }
            | RelayerError::InsufficientBalance { .. }
            | RelayerError::QuoteRejected { .. }
            | RelayerError::AuctionResponse(_)
            | RelayerError::OrderRejected { .. }
            | RelayerError::UnknownOrder { .. }
            | RelayerError::UnknownChunk { .. }
            | RelayerError::InvalidStateTransition { .. }
            | RelayerError::RetriesExhausted { .. }
            | RelayerError::Internal(_) => ErrorClass::PermanentRejection,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientInfra
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

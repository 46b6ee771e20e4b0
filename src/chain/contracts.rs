//! Calls into the scheduler, bridge, and executor contracts
//!
//! Calldata is built by hand from the function selector and ABI-encoded
//! arguments. Writes go through the shared `TransactionSender`; once a
//! transaction is broadcast, the only thing left to do is wait for finality.

use super::ChainManager;
use crate::bridge::{BridgeContract, LockRequest};
use crate::config::{ChainConfig, Settings};
use crate::coordination::{Direction, OrderId, OrderParams, OrderSource};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{selector, signatures, topics, ContractEvent, EventParser};
use crate::settlement::{SwapCall, SwapExecutor, SwapReceipt};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionRequest, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for a broadcast transaction to become final
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Selector followed by the ABI-encoded arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// Chain id -> contract address for every enabled chain that has one
pub fn contract_addresses(
    settings: &Settings,
    pick: impl Fn(&ChainConfig) -> Option<&String>,
) -> RelayerResult<HashMap<u64, Address>> {
    let mut addresses = HashMap::new();
    for (name, chain) in settings.enabled_chains() {
        if let Some(raw) = pick(chain) {
            let address = raw
                .parse::<Address>()
                .map_err(|e| RelayerError::Config(format!("Invalid contract address for {}: {}", name, e)))?;
            addresses.insert(chain.chain_id, address);
        }
    }
    Ok(addresses)
}

fn address_for(addresses: &HashMap<u64, Address>, chain_id: u64, contract: &str) -> RelayerResult<Address> {
    addresses
        .get(&chain_id)
        .copied()
        .ok_or_else(|| RelayerError::Config(format!("No {} contract on chain {}", contract, chain_id)))
}

/// Decode the return data of `orders(uint256)`
pub fn decode_order_params(order_id: OrderId, data: &[u8]) -> RelayerResult<OrderParams> {
    let tokens = abi::decode(
        &[
            ParamType::Address,   // owner
            ParamType::Address,   // fromToken
            ParamType::Address,   // toToken
            ParamType::Uint(256), // totalAmount
            ParamType::Uint(256), // numSlices
            ParamType::Uint(256), // interval
            ParamType::Uint(256), // startTime
            ParamType::Uint(256), // executedSlices
            ParamType::Uint(256), // minReturnAmount
            ParamType::Bool,      // canceled
            ParamType::Bool,      // isBaseToEtherlink
        ],
        data,
    )
    .map_err(|e| RelayerError::Contract(format!("orders({}) returned malformed data: {}", order_id, e)))?;

    let malformed = || RelayerError::Contract(format!("orders({}) returned malformed data", order_id));
    let mut tokens = tokens.into_iter();
    let mut address = || tokens.next().and_then(Token::into_address).ok_or_else(malformed);
    let owner = address()?;
    let from_token = address()?;
    let to_token = address()?;

    let mut uints = Vec::with_capacity(6);
    for _ in 0..6 {
        uints.push(tokens.next().and_then(Token::into_uint).ok_or_else(malformed)?);
    }
    let canceled = tokens.next().and_then(Token::into_bool).ok_or_else(malformed)?;
    let b_to_a = tokens.next().and_then(Token::into_bool).ok_or_else(malformed)?;

    if owner.is_zero() {
        return Err(RelayerError::OrderRejected {
            order_id: order_id.to_string(),
            reason: "order does not exist on chain".to_string(),
        });
    }

    let narrow = |value: U256, field: &str| -> RelayerResult<u64> {
        if value > U256::from(u64::MAX) {
            return Err(RelayerError::OrderRejected {
                order_id: order_id.to_string(),
                reason: format!("{} {} out of range", field, value),
            });
        }
        Ok(value.as_u64())
    };
    let num_slices = narrow(uints[1], "numSlices")?;
    let num_slices = u32::try_from(num_slices).map_err(|_| RelayerError::OrderRejected {
        order_id: order_id.to_string(),
        reason: format!("numSlices {} out of range", num_slices),
    })?;

    Ok(OrderParams {
        owner,
        from_token,
        to_token,
        total_amount: uints[0],
        num_slices,
        interval_secs: narrow(uints[2], "interval")?,
        start_time: narrow(uints[3], "startTime")?,
        min_return_amount: uints[5],
        direction: Direction::from_flag(b_to_a),
        canceled,
    })
}

/// `amountOut` of the executor's `SwapExecuted` log for this call
pub fn swap_amount_out(chain_id: u64, executor: Address, logs: &[Log], call: &SwapCall) -> RelayerResult<U256> {
    let parser = EventParser::new(chain_id);
    logs.iter()
        .filter(|log| log.address == executor && log.topics.first() == Some(&*topics::SWAP_EXECUTED))
        .filter_map(|log| parser.parse_log(log).ok())
        .find_map(|event| match event {
            ContractEvent::SwapExecuted {
                order_id,
                chunk_index,
                amount_out,
                ..
            } if order_id == call.order_id && chunk_index == call.chunk_index => Some(amount_out),
            _ => None,
        })
        .ok_or_else(|| {
            RelayerError::Contract(format!(
                "no SwapExecuted for chunk {} of order {} on chain {}",
                call.chunk_index, call.order_id, chain_id
            ))
        })
}

/// Read side of the order-scheduling contract
pub struct OnChainScheduler {
    chain_manager: Arc<ChainManager>,
    addresses: HashMap<u64, Address>,
}

impl OnChainScheduler {
    pub fn new(chain_manager: Arc<ChainManager>, addresses: HashMap<u64, Address>) -> Self {
        Self {
            chain_manager,
            addresses,
        }
    }
}

#[async_trait]
impl OrderSource for OnChainScheduler {
    async fn fetch_order(&self, chain_id: u64, order_id: OrderId) -> RelayerResult<OrderParams> {
        let scheduler = address_for(&self.addresses, chain_id, "scheduler")?;
        let provider = self.chain_manager.get_provider(chain_id)?;

        let data = encode_call(signatures::GET_ORDER, &[Token::Uint(order_id)]);
        let tx: TypedTransaction = TransactionRequest::new().to(scheduler).data(data).into();
        let raw = provider.call(&tx).await?;

        debug!("Read order {} from chain {}", order_id, chain_id);
        decode_order_params(order_id, &raw)
    }
}

/// Source-chain bridge contract
pub struct OnChainBridge {
    sender: Arc<TransactionSender>,
    chain_manager: Arc<ChainManager>,
    addresses: HashMap<u64, Address>,
    wait: ConfirmationWait,
}

impl OnChainBridge {
    pub fn new(
        sender: Arc<TransactionSender>,
        chain_manager: Arc<ChainManager>,
        addresses: HashMap<u64, Address>,
        wait: ConfirmationWait,
    ) -> Self {
        Self {
            sender,
            chain_manager,
            addresses,
            wait,
        }
    }
}

#[async_trait]
impl BridgeContract for OnChainBridge {
    async fn lock_tokens(&self, request: &LockRequest) -> RelayerResult<H256> {
        let chain_id = request.source_chain;
        let bridge = address_for(&self.addresses, chain_id, "bridge")?;
        let finality = self.chain_manager.get_finality_tracker(chain_id)?;

        let data = encode_call(
            signatures::LOCK_TOKENS,
            &[
                Token::Uint(request.order_id),
                Token::Uint(U256::from(request.chunk_index)),
                Token::Address(request.token),
                Token::Uint(request.amount),
                Token::Address(request.recipient),
            ],
        );
        let estimate = self.sender.estimate_gas(chain_id, bridge, &data).await?;
        let gas_limit = self.sender.gas_estimator().gas_limit(estimate, None);
        let tx_hash = self.sender.send(chain_id, bridge, data, gas_limit).await?;

        // Broadcast: a revert or timeout from here on is final
        finality
            .await_finality(tx_hash, self.wait.timeout, self.wait.poll_interval)
            .await?;
        Ok(tx_hash)
    }
}

/// Destination-chain executor contract
pub struct OnChainExecutor {
    sender: Arc<TransactionSender>,
    chain_manager: Arc<ChainManager>,
    addresses: HashMap<u64, Address>,
    wait: ConfirmationWait,
}

impl OnChainExecutor {
    pub fn new(
        sender: Arc<TransactionSender>,
        chain_manager: Arc<ChainManager>,
        addresses: HashMap<u64, Address>,
        wait: ConfirmationWait,
    ) -> Self {
        Self {
            sender,
            chain_manager,
            addresses,
            wait,
        }
    }

    fn calldata(call: &SwapCall) -> Bytes {
        encode_call(
            signatures::EXECUTE_SWAP,
            &[
                Token::Uint(call.order_id),
                Token::Uint(U256::from(call.chunk_index)),
                Token::Address(call.token_in),
                Token::Address(call.token_out),
                Token::Uint(call.amount),
                Token::Bytes(call.settlement_payload.to_vec()),
            ],
        )
    }
}

#[async_trait]
impl SwapExecutor for OnChainExecutor {
    async fn estimate_swap_gas(&self, call: &SwapCall) -> RelayerResult<U256> {
        let executor = address_for(&self.addresses, call.chain_id, "executor")?;
        self.sender
            .estimate_gas(call.chain_id, executor, &Self::calldata(call))
            .await
    }

    async fn execute_swap(&self, call: &SwapCall, gas_limit: U256) -> RelayerResult<H256> {
        let executor = address_for(&self.addresses, call.chain_id, "executor")?;
        self.sender
            .send(call.chain_id, executor, Self::calldata(call), gas_limit)
            .await
    }

    async fn confirm_swap(&self, call: &SwapCall, tx_hash: H256) -> RelayerResult<SwapReceipt> {
        let executor = address_for(&self.addresses, call.chain_id, "executor")?;
        let receipt = self
            .chain_manager
            .get_finality_tracker(call.chain_id)?
            .await_finality(tx_hash, self.wait.timeout, self.wait.poll_interval)
            .await?;

        let amount_out = swap_amount_out(call.chain_id, executor, &receipt.logs, call)?;
        info!(
            "Swap {:?} final on chain {}: {} out for chunk {} of order {}",
            tx_hash, call.chain_id, amount_out, call.chunk_index, call.order_id
        );

        Ok(SwapReceipt {
            tx_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
            amount_out,
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
        })
    }
}

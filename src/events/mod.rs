//! Contract event types and parsing
//!
//! Defines the events emitted by the order-scheduling, bridge, and executor
//! contracts and decodes raw logs into them.

use crate::coordination::{Direction, OrderId};
use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use sha3::{Digest, Keccak256};

/// Canonical event and function signatures
pub mod signatures {
    pub const ORDER_SCHEDULED: &str =
        "OrderScheduled(uint256,address,address,address,uint256,bool)";
    pub const ORDER_CANCELED: &str = "OrderCanceled(uint256)";
    pub const TRANSFER_CONFIRMED: &str =
        "TransferConfirmed(uint256,uint256,address,uint256,address)";
    pub const SWAP_EXECUTED: &str =
        "SwapExecuted(uint256,uint256,address,address,uint256,uint256)";

    pub const GET_ORDER: &str = "orders(uint256)";
    pub const LOCK_TOKENS: &str = "lockTokens(uint256,uint256,address,uint256,address)";
    pub const EXECUTE_SWAP: &str = "executeSwap(uint256,uint256,address,address,uint256,bytes)";
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 4-byte function selector for a signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use super::{keccak256, signatures};
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref ORDER_SCHEDULED: H256 = H256(keccak256(signatures::ORDER_SCHEDULED.as_bytes()));
        pub static ref ORDER_CANCELED: H256 = H256(keccak256(signatures::ORDER_CANCELED.as_bytes()));
        pub static ref TRANSFER_CONFIRMED: H256 =
            H256(keccak256(signatures::TRANSFER_CONFIRMED.as_bytes()));
        pub static ref SWAP_EXECUTED: H256 = H256(keccak256(signatures::SWAP_EXECUTED.as_bytes()));
    }

    pub fn scheduler() -> Vec<H256> {
        vec![*ORDER_SCHEDULED, *ORDER_CANCELED]
    }

    pub fn bridge() -> Vec<H256> {
        vec![*TRANSFER_CONFIRMED]
    }

    pub fn executor() -> Vec<H256> {
        vec![*SWAP_EXECUTED]
    }
}

/// Where a log came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMeta {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// Decoded contract events the coordinator acts on
#[derive(Debug, Clone, PartialEq)]
pub enum ContractEvent {
    OrderScheduled {
        meta: LogMeta,
        order_id: OrderId,
        owner: Address,
        from_token: Address,
        to_token: Address,
        total_amount: U256,
        direction: Direction,
    },

    OrderCanceled {
        meta: LogMeta,
        order_id: OrderId,
    },

    /// Bridge delivered a locked chunk to the destination chain
    TransferConfirmed {
        meta: LogMeta,
        order_id: OrderId,
        chunk_index: u32,
        token: Address,
        amount: U256,
        recipient: Address,
    },

    SwapExecuted {
        meta: LogMeta,
        order_id: OrderId,
        chunk_index: u32,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
    },
}

impl ContractEvent {
    pub fn meta(&self) -> &LogMeta {
        match self {
            ContractEvent::OrderScheduled { meta, .. }
            | ContractEvent::OrderCanceled { meta, .. }
            | ContractEvent::TransferConfirmed { meta, .. }
            | ContractEvent::SwapExecuted { meta, .. } => meta,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.meta().chain_id
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::OrderScheduled { .. } => "order_scheduled",
            ContractEvent::OrderCanceled { .. } => "order_canceled",
            ContractEvent::TransferConfirmed { .. } => "transfer_confirmed",
            ContractEvent::SwapExecuted { .. } => "swap_executed",
        }
    }
}

/// Event parser for a single chain
#[derive(Debug, Clone)]
pub struct EventParser {
    chain_id: u64,
}

impl EventParser {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    /// Parse a log entry into a ContractEvent
    pub fn parse_log(&self, log: &Log) -> RelayerResult<ContractEvent> {
        let meta = self.meta(log)?;
        let topic = log
            .topics
            .first()
            .copied()
            .ok_or_else(|| decode_err("log has no topics"))?;

        if topic == *topics::ORDER_SCHEDULED {
            let tokens = decode_data(
                log,
                &[
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Bool,
                ],
            )?;
            let mut tokens = tokens.into_iter();
            Ok(ContractEvent::OrderScheduled {
                meta,
                order_id: topic_uint(log, 1)?,
                owner: topic_address(log, 2)?,
                from_token: next_address(&mut tokens)?,
                to_token: next_address(&mut tokens)?,
                total_amount: next_uint(&mut tokens)?,
                direction: Direction::from_flag(next_bool(&mut tokens)?),
            })
        } else if topic == *topics::ORDER_CANCELED {
            Ok(ContractEvent::OrderCanceled {
                meta,
                order_id: topic_uint(log, 1)?,
            })
        } else if topic == *topics::TRANSFER_CONFIRMED {
            let tokens = decode_data(
                log,
                &[
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Address,
                ],
            )?;
            let mut tokens = tokens.into_iter();
            Ok(ContractEvent::TransferConfirmed {
                meta,
                order_id: topic_uint(log, 1)?,
                chunk_index: to_index(next_uint(&mut tokens)?)?,
                token: next_address(&mut tokens)?,
                amount: next_uint(&mut tokens)?,
                recipient: next_address(&mut tokens)?,
            })
        } else if topic == *topics::SWAP_EXECUTED {
            let tokens = decode_data(
                log,
                &[
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
            )?;
            let mut tokens = tokens.into_iter();
            Ok(ContractEvent::SwapExecuted {
                meta,
                order_id: topic_uint(log, 1)?,
                chunk_index: to_index(next_uint(&mut tokens)?)?,
                token_in: next_address(&mut tokens)?,
                token_out: next_address(&mut tokens)?,
                amount_in: next_uint(&mut tokens)?,
                amount_out: next_uint(&mut tokens)?,
            })
        } else {
            Err(decode_err(&format!("unrecognized topic {:?}", topic)))
        }
    }

    fn meta(&self, log: &Log) -> RelayerResult<LogMeta> {
        Ok(LogMeta {
            chain_id: self.chain_id,
            block_number: log
                .block_number
                .map(|b| b.as_u64())
                .ok_or_else(|| decode_err("log has no block number"))?,
            tx_hash: log
                .transaction_hash
                .ok_or_else(|| decode_err("log has no transaction hash"))?,
            log_index: log
                .log_index
                .map(|i| i.low_u64())
                .ok_or_else(|| decode_err("log has no log index"))?,
        })
    }
}

fn decode_err(message: &str) -> RelayerError {
    RelayerError::EventDecode(message.to_string())
}

fn decode_data(log: &Log, types: &[ParamType]) -> RelayerResult<Vec<Token>> {
    abi::decode(types, &log.data).map_err(|e| decode_err(&format!("invalid log data: {}", e)))
}

fn topic_uint(log: &Log, index: usize) -> RelayerResult<U256> {
    log.topics
        .get(index)
        .map(|t| U256::from_big_endian(t.as_bytes()))
        .ok_or_else(|| decode_err(&format!("missing indexed topic {}", index)))
}

fn topic_address(log: &Log, index: usize) -> RelayerResult<Address> {
    log.topics
        .get(index)
        .map(|t| Address::from_slice(&t.as_bytes()[12..32]))
        .ok_or_else(|| decode_err(&format!("missing indexed topic {}", index)))
}

fn next_uint(tokens: &mut impl Iterator<Item = Token>) -> RelayerResult<U256> {
    tokens
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| decode_err("expected uint"))
}

fn next_address(tokens: &mut impl Iterator<Item = Token>) -> RelayerResult<Address> {
    tokens
        .next()
        .and_then(Token::into_address)
        .ok_or_else(|| decode_err("expected address"))
}

fn next_bool(tokens: &mut impl Iterator<Item = Token>) -> RelayerResult<bool> {
    tokens
        .next()
        .and_then(Token::into_bool)
        .ok_or_else(|| decode_err("expected bool"))
}

fn to_index(value: U256) -> RelayerResult<u32> {
    if value > U256::from(u32::MAX) {
        return Err(decode_err(&format!("chunk index {} out of range", value)));
    }
    Ok(value.as_u32())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_known_selector() {
        // ERC-20 transfer(address,uint256)
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_parse_order_scheduled() {
        let owner = Address::repeat_byte(0x11);
        let log = order_scheduled(
            5,
            owner,
            Address::repeat_byte(0x22),
            Address::repeat_byte(0x33),
            U256::from(1_000_000u64),
            true,
            120,
            H256::repeat_byte(0xaa),
            3,
        );

        let event = EventParser::new(42793).parse_log(&log).unwrap();
        match event {
            ContractEvent::OrderScheduled {
                meta,
                order_id,
                owner: parsed_owner,
                total_amount,
                direction,
                ..
            } => {
                assert_eq!(meta.chain_id, 42793);
                assert_eq!(meta.block_number, 120);
                assert_eq!(meta.log_index, 3);
                assert_eq!(order_id, U256::from(5));
                assert_eq!(parsed_owner, owner);
                assert_eq!(total_amount, U256::from(1_000_000u64));
                assert_eq!(direction, Direction::BToA);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_transfer_confirmed() {
        let log = transfer_confirmed(
            9,
            2,
            Address::repeat_byte(0x44),
            U256::from(500),
            Address::repeat_byte(0x55),
            10,
            H256::repeat_byte(1),
            0,
        );
        let event = EventParser::new(1).parse_log(&log).unwrap();
        assert_eq!(event.name(), "transfer_confirmed");
        assert!(matches!(
            event,
            ContractEvent::TransferConfirmed { chunk_index: 2, .. }
        ));
    }

    #[test]
    fn test_truncated_data_is_a_decode_error() {
        let mut log = transfer_confirmed(
            9,
            2,
            Address::zero(),
            U256::from(500),
            Address::zero(),
            10,
            H256::repeat_byte(1),
            0,
        );
        log.data = log.data.0.slice(0..40).into();
        let err = EventParser::new(1).parse_log(&log).unwrap_err();
        assert!(matches!(err, RelayerError::EventDecode(_)));
    }

    #[test]
    fn test_unknown_topic_is_a_decode_error() {
        let log = raw_log(
            Address::zero(),
            vec![H256::repeat_byte(0x99)],
            Vec::new(),
            1,
            H256::zero(),
            0,
        );
        assert!(matches!(
            EventParser::new(1).parse_log(&log),
            Err(RelayerError::EventDecode(_))
        ));
    }
}

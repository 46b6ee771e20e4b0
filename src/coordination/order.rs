//! Orders, chunks, and the chunk state machine

use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, H256, U256, U512};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain-assigned order identifier
pub type OrderId = U256;

/// Which configured side an order moves funds from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    /// Decode the scheduler contract's `isBaseToEtherlink` flag
    pub fn from_flag(b_to_a: bool) -> Self {
        if b_to_a {
            Direction::BToA
        } else {
            Direction::AToB
        }
    }
}

/// Concrete chains an order travels between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source_chain: u64,
    pub destination_chain: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    Locking,
    Locked,
    Settling,
    Settled,
    Failed,
    Canceled,
}

impl ChunkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkState::Settled | ChunkState::Failed | ChunkState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Locking => "locking",
            ChunkState::Locked => "locked",
            ChunkState::Settling => "settling",
            ChunkState::Settled => "settled",
            ChunkState::Failed => "failed",
            ChunkState::Canceled => "canceled",
        }
    }

    /// Forward-only transitions. `Canceled` is only entered from `Pending`.
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Pending, Locking)
                | (Pending, Canceled)
                | (Locking, Locked)
                | (Locking, Failed)
                | (Locked, Settling)
                | (Locked, Failed)
                | (Settling, Settled)
                | (Settling, Failed)
        )
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order parameters as read from the scheduler contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderParams {
    pub owner: Address,
    pub from_token: Address,
    pub to_token: Address,
    pub total_amount: U256,
    pub num_slices: u32,
    pub interval_secs: u64,
    pub start_time: u64,
    pub min_return_amount: U256,
    pub direction: Direction,
    pub canceled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub amount: U256,
    pub due_at: u64,
    pub state: ChunkState,
    pub lock_tx: Option<H256>,
    pub settle_tx: Option<H256>,
    /// Bridge reported the transfer for this chunk as ready on the destination chain
    pub transfer_confirmed: bool,
    pub transfer_token: Option<Address>,
    pub amount_out: Option<U256>,
    /// Auction quote the settlement was measured against
    #[serde(default)]
    pub expected_out: Option<U256>,
    /// Wei
    #[serde(default)]
    pub gas_cost: Option<U256>,
    pub failure_reason: Option<String>,
    /// Unix time of the last state change
    pub updated_at: u64,
}

impl Chunk {
    fn new(index: u32, amount: U256, due_at: u64, now: u64) -> Self {
        Self {
            index,
            amount,
            due_at,
            state: ChunkState::Pending,
            lock_tx: None,
            settle_tx: None,
            transfer_confirmed: false,
            transfer_token: None,
            amount_out: None,
            expected_out: None,
            gas_cost: None,
            failure_reason: None,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: ChunkState, now: u64) -> RelayerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Ready to hand to settlement: locked on the source chain and delivered
    pub fn is_settleable(&self) -> bool {
        self.state == ChunkState::Locked && self.transfer_confirmed
    }
}

/// Split `total` into `slices` equal shares; the final share absorbs the remainder
pub fn partition_amount(total: U256, slices: u32) -> Vec<U256> {
    if slices == 0 {
        return Vec::new();
    }
    let n = U256::from(slices);
    let share = total / n;
    let remainder = total % n;
    let mut amounts = vec![share; slices as usize];
    if let Some(last) = amounts.last_mut() {
        *last += remainder;
    }
    amounts
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Chain hosting the scheduler contract that emitted the order
    pub origin_chain: u64,
    pub owner: Address,
    pub from_token: Address,
    pub to_token: Address,
    pub total_amount: U256,
    pub num_slices: u32,
    pub interval_secs: u64,
    pub min_return_amount: U256,
    pub direction: Direction,
    pub route: Route,
    pub start_time: u64,
    pub executed_slices: u32,
    pub canceled: bool,
    pub received_amount: U256,
    pub chunks: Vec<Chunk>,
    pub created_at: u64,
}

impl Order {
    /// Build an order and its chunk schedule, enforcing the partition invariants
    pub fn new(
        order_id: OrderId,
        origin_chain: u64,
        params: &OrderParams,
        route: Route,
        min_interval_secs: u64,
        now: u64,
    ) -> RelayerResult<Self> {
        let reject = |reason: String| RelayerError::OrderRejected {
            order_id: order_id.to_string(),
            reason,
        };

        if params.num_slices == 0 {
            return Err(reject("numSlices must be at least 1".to_string()));
        }
        if params.interval_secs < min_interval_secs {
            return Err(reject(format!(
                "interval {}s below minimum {}s",
                params.interval_secs, min_interval_secs
            )));
        }
        if params.total_amount < U256::from(params.num_slices) {
            return Err(reject(format!(
                "totalAmount {} cannot fill {} slices",
                params.total_amount, params.num_slices
            )));
        }

        let mut chunks = Vec::with_capacity(params.num_slices as usize);
        for (i, amount) in partition_amount(params.total_amount, params.num_slices)
            .into_iter()
            .enumerate()
        {
            let due_at = params
                .interval_secs
                .checked_mul(i as u64)
                .and_then(|offset| params.start_time.checked_add(offset))
                .ok_or_else(|| {
                    reject(format!(
                        "slice {} due time overflows (start {}, interval {}s)",
                        i, params.start_time, params.interval_secs
                    ))
                })?;
            let mut chunk = Chunk::new(i as u32, amount, due_at, now);
            if params.canceled {
                chunk.state = ChunkState::Canceled;
            }
            chunks.push(chunk);
        }

        Ok(Self {
            order_id,
            origin_chain,
            owner: params.owner,
            from_token: params.from_token,
            to_token: params.to_token,
            total_amount: params.total_amount,
            num_slices: params.num_slices,
            interval_secs: params.interval_secs,
            min_return_amount: params.min_return_amount,
            direction: params.direction,
            route,
            start_time: params.start_time,
            executed_slices: 0,
            canceled: params.canceled,
            received_amount: U256::zero(),
            chunks,
            created_at: now,
        })
    }

    /// First chunk that has not reached a terminal state
    pub fn current_chunk(&self) -> Option<&Chunk> {
        self.chunks.iter().find(|c| !c.state.is_terminal())
    }

    pub fn chunk(&self, index: u32) -> Option<&Chunk> {
        self.chunks.get(index as usize)
    }

    pub fn chunk_mut(&mut self, index: u32) -> RelayerResult<&mut Chunk> {
        let order_id = self.order_id;
        self.chunks
            .get_mut(index as usize)
            .ok_or_else(|| RelayerError::UnknownChunk {
                order_id: order_id.to_string(),
                chunk_index: index,
            })
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.state.is_terminal())
    }

    /// Pro-rata share of `minReturnAmount` a chunk's quote must meet
    pub fn chunk_floor(&self, index: u32) -> U256 {
        match self.chunk(index) {
            Some(chunk) if !self.total_amount.is_zero() => {
                // chunk.amount <= total_amount, so the quotient fits back into 256 bits
                let share = self.min_return_amount.full_mul(chunk.amount) / U512::from(self.total_amount);
                U256::try_from(share).unwrap_or(self.min_return_amount)
            }
            _ => U256::zero(),
        }
    }

    /// Cancel while no chunk has settled. Chunks still `Pending` become
    /// `Canceled`; a chunk already in flight runs to `Settled` or `Failed`.
    /// Returns false once a chunk has settled.
    pub fn cancel(&mut self, now: u64) -> bool {
        if self.canceled {
            return true;
        }
        if self.executed_slices > 0 {
            return false;
        }
        for chunk in &mut self.chunks {
            if chunk.state == ChunkState::Pending {
                chunk.state = ChunkState::Canceled;
                chunk.updated_at = now;
            }
        }
        self.canceled = true;
        true
    }

    pub fn record_settlement(&mut self, index: u32, settle_tx: H256, amount_out: U256, now: u64) -> RelayerResult<()> {
        let chunk = self.chunk_mut(index)?;
        chunk.transition(ChunkState::Settled, now)?;
        chunk.settle_tx = Some(settle_tx);
        chunk.amount_out = Some(amount_out);
        self.executed_slices += 1;
        self.received_amount = self.received_amount.saturating_add(amount_out);
        Ok(())
    }

    pub fn record_failure(&mut self, index: u32, reason: String, now: u64) -> RelayerResult<()> {
        let chunk = self.chunk_mut(index)?;
        chunk.transition(ChunkState::Failed, now)?;
        chunk.failure_reason = Some(reason);
        Ok(())
    }

    pub fn state_counts(&self) -> [(ChunkState, usize); 7] {
        use ChunkState::*;
        let count = |s: ChunkState| self.chunks.iter().filter(|c| c.state == s).count();
        [
            (Pending, count(Pending)),
            (Locking, count(Locking)),
            (Locked, count(Locked)),
            (Settling, count(Settling)),
            (Settled, count(Settled)),
            (Failed, count(Failed)),
            (Canceled, count(Canceled)),
        ]
    }
}

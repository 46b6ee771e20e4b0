//! Slice scheduling decisions
//!
//! Chunks of one order run strictly in index order and never overlap: only the
//! first non-terminal chunk is ever considered, and only while it is idle.

use super::order::{ChunkState, Order};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAction {
    /// Move the chunk from `Pending` to `Locking` and lock its funds
    Lock(u32),
    /// Move the chunk from `Locked` to `Settling` and settle it
    Settle(u32),
}

/// Decide what, if anything, to start for this order at `now`.
/// A canceled order never locks again, but a chunk locked before the
/// cancellation still settles.
pub fn next_action(order: &Order, now: u64) -> Option<ChunkAction> {
    let chunk = order.current_chunk()?;
    match chunk.state {
        ChunkState::Pending if !order.canceled && now >= chunk.due_at => Some(ChunkAction::Lock(chunk.index)),
        ChunkState::Locked if chunk.is_settleable() => Some(ChunkAction::Settle(chunk.index)),
        _ => None,
    }
}

/// Chunk locked for longer than `threshold_secs` without a transfer confirmation
pub fn stale_lock(order: &Order, now: u64, threshold_secs: u64) -> Option<u32> {
    let chunk = order.current_chunk()?;
    (chunk.state == ChunkState::Locked
        && !chunk.transfer_confirmed
        && now.saturating_sub(chunk.updated_at) >= threshold_secs)
        .then_some(chunk.index)
}

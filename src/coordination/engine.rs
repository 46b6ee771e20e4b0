//! Main coordination engine for time-weighted cross-chain orders
//!
//! The engine is the single writer of order state. Event cursors feed it
//! scheduler and bridge events; every tick it starts at most one lock or
//! settle step per order, bounded by a global in-flight limit. Steps run as
//! spawned tasks and report back through a channel, so a slow chunk never
//! blocks another order.

use super::order::{ChunkState, Direction, Order, OrderId, Route};
use super::scheduler::{next_action, stale_lock, ChunkAction};
use super::store::OrderStore;
use super::OrderSource;
use crate::analytics::AnalyticsRecorder;
use crate::bridge::BridgeCoordinator;
use crate::chain::{EventCursor, EventSink};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ContractEvent, LogMeta};
use crate::settlement::{SettlementClient, SettlementReport};
use crate::state::StateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use ethers::types::{Address, H256, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Result of one spawned lock or settle step
#[derive(Debug)]
pub enum ChunkOutcome {
    Locked {
        order_id: OrderId,
        chunk_index: u32,
        lock_tx: H256,
    },
    Settled(SettlementReport),
    Failed {
        order_id: OrderId,
        chunk_index: u32,
        stage: &'static str,
        reason: String,
    },
}

/// An outcome travels with its in-flight permit; the permit is released only
/// once the outcome has been applied.
type Completion = (ChunkOutcome, OwnedSemaphorePermit);

enum TransferMatch {
    Recorded,
    AlreadyConfirmed,
    Ignored(ChunkState),
    Mismatch(String),
}

/// Coordination engine
pub struct CoordinationEngine {
    store: Arc<OrderStore>,
    state: Arc<dyn StateStore>,
    cursors: Mutex<Vec<EventCursor>>,
    orders: Arc<dyn OrderSource>,
    bridge: Arc<BridgeCoordinator>,
    settlement: Arc<SettlementClient>,
    analytics: Arc<AnalyticsRecorder>,
    /// Route of `Direction::AToB`; the reverse direction swaps the chains
    a_to_b: Route,
    config: RelayerConfig,
    permits: Arc<Semaphore>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    stale_warned: DashSet<(OrderId, u32)>,
    /// Some settled chunk has no analytics record yet
    analytics_behind: AtomicBool,
    shutdown: Arc<RwLock<bool>>,
}

impl CoordinationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayerConfig,
        a_to_b: Route,
        state: Arc<dyn StateStore>,
        cursors: Vec<EventCursor>,
        orders: Arc<dyn OrderSource>,
        bridge: BridgeCoordinator,
        settlement: SettlementClient,
        analytics: Arc<AnalyticsRecorder>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store: Arc::new(OrderStore::new()),
            state,
            cursors: Mutex::new(cursors),
            orders,
            bridge: Arc::new(bridge),
            settlement: Arc::new(settlement),
            analytics,
            a_to_b,
            permits: Arc::new(Semaphore::new(config.max_concurrent_chunks)),
            config,
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
            stale_warned: DashSet::new(),
            analytics_behind: AtomicBool::new(false),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Read-only view of tracked orders
    pub fn store(&self) -> Arc<OrderStore> {
        self.store.clone()
    }

    /// Lock and settle steps currently running
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_chunks
            .saturating_sub(self.permits.available_permits())
    }

    /// Reload persisted orders. Chunks caught mid-lock or mid-settle by the
    /// previous shutdown are failed; their outcome is unknown and they are
    /// never retried.
    pub async fn recover(&self, now: u64) -> RelayerResult<usize> {
        let orders = self.state.load_orders().await?;
        let total = orders.len();
        let mut interrupted = 0;

        for mut order in orders {
            let stuck: Vec<u32> = order
                .chunks
                .iter()
                .filter(|c| matches!(c.state, ChunkState::Locking | ChunkState::Settling))
                .map(|c| c.index)
                .collect();

            for index in &stuck {
                order.record_failure(*index, "interrupted by restart".to_string(), now)?;
                warn!(
                    "Chunk {} of order {} was in flight at shutdown, marked failed",
                    index, order.order_id
                );
                crate::metrics::record_chunk_failure("restart");
            }
            if !stuck.is_empty() {
                interrupted += stuck.len();
                self.persist(&order).await;
            }
            self.store.insert(order).await;
        }

        info!(
            "Recovered {} orders ({} interrupted chunks failed)",
            total, interrupted
        );
        self.reconcile_analytics().await;
        Ok(total)
    }

    /// Main coordination loop
    pub async fn run(&self) -> RelayerResult<()> {
        let mut completions = self
            .completions_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayerError::Internal("coordination engine already running".to_string()))?;

        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));

        info!("Coordination engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                Some(completion) = completions.recv() => {
                    self.complete(completion, unix_now()).await;
                }

                _ = poll_interval.tick() => {
                    self.tick(unix_now()).await;
                }
            }
        }

        self.drain(&mut completions).await;
        info!("Coordination engine stopped");
        Ok(())
    }

    /// Poll every cursor once, then start whatever chunk steps are due
    pub async fn tick(&self, now: u64) {
        self.poll_cursors().await;
        if self.analytics_behind.load(Ordering::Relaxed) {
            self.reconcile_analytics().await;
        }
        self.schedule(now).await;
    }

    /// Write the missing analytics record of every settled chunk
    async fn reconcile_analytics(&self) {
        self.analytics_behind.store(false, Ordering::Relaxed);
        let mut written = 0;
        for order in self.store.snapshot().await {
            for chunk in order.chunks.iter().filter(|c| c.state == ChunkState::Settled) {
                if self.analytics.contains(order.order_id, chunk.index).await {
                    continue;
                }
                let Some(report) = settled_report(&order, chunk.index) else {
                    warn!(
                        "Chunk {} of order {} settled without a recorded quote, no analytics",
                        chunk.index, order.order_id
                    );
                    continue;
                };
                let timestamp =
                    DateTime::from_timestamp(chunk.updated_at as i64, 0).unwrap_or_else(Utc::now);
                if self.record_analytics(&order, &report, timestamp).await {
                    written += 1;
                }
            }
        }
        if written > 0 {
            info!("Wrote {} missing analytics records", written);
        }
    }

    /// Returns false and flags a later retry when the append fails
    async fn record_analytics(
        &self,
        order: &Order,
        report: &SettlementReport,
        timestamp: DateTime<Utc>,
    ) -> bool {
        match self.analytics.record(order, report, timestamp).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Failed to record analytics for chunk {} of order {}, will retry: {}",
                    report.chunk_index, report.order_id, e
                );
                self.analytics_behind.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    /// Stop the engine. In-flight steps get the configured grace period.
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordination engine shutdown requested");
    }

    async fn poll_cursors(&self) {
        let mut cursors = self.cursors.lock().await;
        for cursor in cursors.iter_mut() {
            match cursor.poll(self).await {
                Ok(0) => {}
                Ok(n) => debug!("Cursor {} handled {} events", cursor.stream(), n),
                Err(e) => warn!("Cursor {} poll failed: {}", cursor.stream(), e),
            }
        }
    }

    async fn schedule(&self, now: u64) {
        let mut orders = self.store.active().await;
        orders.sort_by_key(|o| o.order_id);

        for order in orders {
            self.warn_if_stale(&order, now);

            let Some(action) = next_action(&order, now) else {
                continue;
            };
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(
                    "In-flight limit of {} chunks reached",
                    self.config.max_concurrent_chunks
                );
                break;
            };

            match action {
                ChunkAction::Lock(index) => self.start_lock(&order, index, permit, now).await,
                ChunkAction::Settle(index) => self.start_settle(&order, index, permit, now).await,
            }
        }

        crate::metrics::set_chunks_in_flight(self.in_flight());
    }

    fn warn_if_stale(&self, order: &Order, now: u64) {
        if let Some(index) = stale_lock(order, now, self.config.stale_lock_warn_secs) {
            if self.stale_warned.insert((order.order_id, index)) {
                warn!(
                    "Chunk {} of order {} locked for over {}s without transfer confirmation",
                    index, order.order_id, self.config.stale_lock_warn_secs
                );
            }
        }
    }

    async fn start_lock(&self, order: &Order, index: u32, permit: OwnedSemaphorePermit, now: u64) {
        let order_id = order.order_id;
        let Some(snapshot) = self.advance(order_id, index, ChunkState::Locking, now).await else {
            return;
        };

        let request = match self.bridge.lock_request(&snapshot, index) {
            Ok(request) => request,
            Err(e) => {
                let outcome = ChunkOutcome::Failed {
                    order_id,
                    chunk_index: index,
                    stage: "lock",
                    reason: e.to_string(),
                };
                self.complete((outcome, permit), now).await;
                return;
            }
        };

        info!(
            "Locking chunk {} of order {}: {} on chain {}",
            index, order_id, request.amount, request.source_chain
        );

        let bridge = self.bridge.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = match bridge.lock(&request).await {
                Ok(lock_tx) => ChunkOutcome::Locked {
                    order_id,
                    chunk_index: index,
                    lock_tx,
                },
                Err(e) => ChunkOutcome::Failed {
                    order_id,
                    chunk_index: index,
                    stage: "lock",
                    reason: e.to_string(),
                },
            };
            let _ = completions.send((outcome, permit));
        });
    }

    async fn start_settle(&self, order: &Order, index: u32, permit: OwnedSemaphorePermit, now: u64) {
        let order_id = order.order_id;
        let Some(snapshot) = self.advance(order_id, index, ChunkState::Settling, now).await else {
            return;
        };
        let token_in = snapshot
            .chunk(index)
            .and_then(|c| c.transfer_token)
            .unwrap_or(snapshot.from_token);

        info!(
            "Settling chunk {} of order {} on chain {}",
            index, order_id, snapshot.route.destination_chain
        );

        let settlement = self.settlement.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = match settlement.settle(&snapshot, index, token_in).await {
                Ok(report) => ChunkOutcome::Settled(report),
                Err(e) => ChunkOutcome::Failed {
                    order_id,
                    chunk_index: index,
                    stage: "settle",
                    reason: e.to_string(),
                },
            };
            let _ = completions.send((outcome, permit));
        });
    }

    /// Move a chunk into an in-flight state and persist the order
    async fn advance(&self, order_id: OrderId, index: u32, next: ChunkState, now: u64) -> Option<Order> {
        match self
            .store
            .update(&order_id, |o| o.chunk_mut(index)?.transition(next, now))
            .await
        {
            Ok(((), order)) => {
                crate::metrics::record_chunk_transition(next.as_str());
                self.persist(&order).await;
                Some(order)
            }
            Err(e) => {
                error!("Cannot move chunk {} of order {} to {}: {}", index, order_id, next, e);
                None
            }
        }
    }

    async fn complete(&self, (outcome, permit): Completion, now: u64) {
        self.apply_outcome(outcome, now).await;
        drop(permit);
        crate::metrics::set_chunks_in_flight(self.in_flight());
    }

    /// Fold a finished step back into the order
    pub async fn apply_outcome(&self, outcome: ChunkOutcome, now: u64) {
        match outcome {
            ChunkOutcome::Locked {
                order_id,
                chunk_index,
                lock_tx,
            } => {
                let result = self
                    .store
                    .update(&order_id, |o| {
                        let chunk = o.chunk_mut(chunk_index)?;
                        chunk.transition(ChunkState::Locked, now)?;
                        chunk.lock_tx = Some(lock_tx);
                        Ok(chunk.transfer_confirmed)
                    })
                    .await;
                match result {
                    Ok((confirmed, order)) => {
                        info!(
                            "Chunk {} of order {} locked in {:?}{}",
                            chunk_index,
                            order_id,
                            lock_tx,
                            if confirmed { ", transfer already confirmed" } else { "" }
                        );
                        crate::metrics::record_chunk_transition(ChunkState::Locked.as_str());
                        self.persist(&order).await;
                    }
                    Err(e) => error!(
                        "Dropping lock result for chunk {} of order {}: {}",
                        chunk_index, order_id, e
                    ),
                }
            }

            ChunkOutcome::Settled(report) => {
                let result = self
                    .store
                    .update(&report.order_id, |o| {
                        o.record_settlement(report.chunk_index, report.tx_hash, report.amount_out, now)?;
                        let chunk = o.chunk_mut(report.chunk_index)?;
                        chunk.expected_out = Some(report.expected_out);
                        chunk.gas_cost = Some(report.gas_cost);
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(((), order)) => {
                        info!(
                            "Chunk {} of order {} settled: {} in, {} out (quoted {})",
                            report.chunk_index,
                            report.order_id,
                            report.amount_in,
                            report.amount_out,
                            report.expected_out
                        );
                        crate::metrics::record_chunk_transition(ChunkState::Settled.as_str());
                        self.persist(&order).await;
                        self.record_analytics(&order, &report, Utc::now()).await;
                        log_if_complete(&order);
                    }
                    Err(e) => error!(
                        "Dropping settlement of chunk {} of order {} ({:?}): {}",
                        report.chunk_index, report.order_id, report.tx_hash, e
                    ),
                }
            }

            ChunkOutcome::Failed {
                order_id,
                chunk_index,
                stage,
                reason,
            } => {
                let message = format!("{} failed: {}", stage, reason);
                let result = self
                    .store
                    .update(&order_id, |o| o.record_failure(chunk_index, message.clone(), now))
                    .await;
                match result {
                    Ok(((), order)) => {
                        error!("Chunk {} of order {} failed: {}", chunk_index, order_id, message);
                        crate::metrics::record_chunk_transition(ChunkState::Failed.as_str());
                        crate::metrics::record_chunk_failure(stage);
                        self.persist(&order).await;
                        log_if_complete(&order);
                    }
                    Err(e) => error!(
                        "Dropping failure of chunk {} of order {} ({}): {}",
                        chunk_index, order_id, message, e
                    ),
                }
            }
        }
    }

    /// Apply outcomes of running steps until they all finish or the grace period ends
    async fn drain(&self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        let running = self.in_flight();
        if running > 0 {
            info!(
                "Waiting up to {}s for {} in-flight chunk steps",
                self.config.shutdown_grace_secs, running
            );
        }

        let grace = tokio::time::sleep(Duration::from_secs(self.config.shutdown_grace_secs));
        tokio::pin!(grace);
        let idle = self
            .permits
            .acquire_many(self.config.max_concurrent_chunks as u32);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                Some(completion) = completions.recv() => {
                    self.complete(completion, unix_now()).await;
                }

                _ = &mut idle => break,

                _ = &mut grace => {
                    warn!(
                        "{} chunk steps still running after {}s grace period",
                        self.in_flight(),
                        self.config.shutdown_grace_secs
                    );
                    break;
                }
            }
        }

        while let Ok(completion) = completions.try_recv() {
            self.complete(completion, unix_now()).await;
        }
    }

    async fn persist(&self, order: &Order) {
        if let Err(e) = self.state.save_order(order).await {
            error!("Failed to persist order {}: {}", order.order_id, e);
        }
    }

    fn route(&self, direction: Direction) -> Route {
        match direction {
            Direction::AToB => self.a_to_b,
            Direction::BToA => Route {
                source_chain: self.a_to_b.destination_chain,
                destination_chain: self.a_to_b.source_chain,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_order_scheduled(
        &self,
        meta: LogMeta,
        order_id: OrderId,
        owner: Address,
        from_token: Address,
        to_token: Address,
        total_amount: U256,
        direction: Direction,
    ) -> RelayerResult<()> {
        if self.store.contains(&order_id).await {
            debug!("Order {} already tracked", order_id);
            return Ok(());
        }

        let params = self.orders.fetch_order(meta.chain_id, order_id).await?;
        if params.owner != owner
            || params.from_token != from_token
            || params.to_token != to_token
            || params.total_amount != total_amount
            || params.direction != direction
        {
            crate::metrics::record_order_rejected();
            return Err(RelayerError::OrderRejected {
                order_id: order_id.to_string(),
                reason: "scheduled event disagrees with on-chain order".to_string(),
            });
        }

        let order = Order::new(
            order_id,
            meta.chain_id,
            &params,
            self.route(direction),
            self.config.min_interval_secs,
            unix_now(),
        )
        .inspect_err(|_| crate::metrics::record_order_rejected())?;

        if !self.store.insert(order.clone()).await {
            return Ok(());
        }
        self.persist(&order).await;

        info!(
            "Order {} scheduled by {:?}: {} in {} slices every {}s, chain {} -> {}",
            order_id,
            owner,
            total_amount,
            order.num_slices,
            order.interval_secs,
            order.route.source_chain,
            order.route.destination_chain
        );
        crate::metrics::record_order_scheduled(meta.chain_id);
        Ok(())
    }

    async fn handle_order_canceled(&self, order_id: OrderId) -> RelayerResult<()> {
        let (accepted, order) = self
            .store
            .update(&order_id, |o| Ok(o.cancel(unix_now())))
            .await?;

        if accepted {
            match order.current_chunk() {
                Some(chunk) => info!(
                    "Order {} canceled; chunk {} is {} and runs to completion",
                    order_id, chunk.index, chunk.state
                ),
                None => info!("Order {} canceled", order_id),
            }
            crate::metrics::record_order_canceled();
            self.persist(&order).await;
        } else {
            warn!(
                "Ignoring cancellation of order {}: {} slices already settled",
                order_id, order.executed_slices
            );
        }
        Ok(())
    }

    async fn handle_transfer_confirmed(
        &self,
        order_id: OrderId,
        chunk_index: u32,
        token: Address,
        amount: U256,
    ) -> RelayerResult<()> {
        let now = unix_now();
        let (matched, order) = self
            .store
            .update(&order_id, |o| {
                let from_token = o.from_token;
                let (state, confirmed, expected) = {
                    let chunk = o.chunk_mut(chunk_index)?;
                    (chunk.state, chunk.transfer_confirmed, chunk.amount)
                };

                if confirmed {
                    return Ok(TransferMatch::AlreadyConfirmed);
                }
                if !matches!(state, ChunkState::Locking | ChunkState::Locked) {
                    return Ok(TransferMatch::Ignored(state));
                }
                if token != from_token || amount != expected {
                    let reason = format!(
                        "transfer mismatch: bridged {} of {:?}, expected {} of {:?}",
                        amount, token, expected, from_token
                    );
                    o.record_failure(chunk_index, reason.clone(), now)?;
                    return Ok(TransferMatch::Mismatch(reason));
                }

                let chunk = o.chunk_mut(chunk_index)?;
                chunk.transfer_confirmed = true;
                chunk.transfer_token = Some(token);
                Ok(TransferMatch::Recorded)
            })
            .await?;

        match matched {
            TransferMatch::Recorded => {
                info!("Transfer confirmed for chunk {} of order {}", chunk_index, order_id);
                self.persist(&order).await;
            }
            TransferMatch::AlreadyConfirmed => {
                debug!(
                    "Transfer for chunk {} of order {} already confirmed",
                    chunk_index, order_id
                );
            }
            TransferMatch::Ignored(state) => {
                warn!(
                    "Ignoring transfer confirmation for chunk {} of order {} in state {}",
                    chunk_index, order_id, state
                );
            }
            TransferMatch::Mismatch(reason) => {
                error!("Chunk {} of order {} failed: {}", chunk_index, order_id, reason);
                crate::metrics::record_chunk_transition(ChunkState::Failed.as_str());
                crate::metrics::record_chunk_failure("transfer");
                self.persist(&order).await;
                log_if_complete(&order);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for CoordinationEngine {
    async fn dispatch(&self, event: ContractEvent) -> RelayerResult<()> {
        debug!("Handling event: {}", event.name());

        match event {
            ContractEvent::OrderScheduled {
                meta,
                order_id,
                owner,
                from_token,
                to_token,
                total_amount,
                direction,
            } => {
                self.handle_order_scheduled(meta, order_id, owner, from_token, to_token, total_amount, direction)
                    .await
            }

            ContractEvent::OrderCanceled { order_id, .. } => self.handle_order_canceled(order_id).await,

            ContractEvent::TransferConfirmed {
                order_id,
                chunk_index,
                token,
                amount,
                ..
            } => {
                self.handle_transfer_confirmed(order_id, chunk_index, token, amount)
                    .await
            }

            ContractEvent::SwapExecuted {
                meta,
                order_id,
                chunk_index,
                amount_out,
                ..
            } => {
                debug!(
                    "Swap executed on chain {} for chunk {} of order {}: {} out",
                    meta.chain_id, chunk_index, order_id, amount_out
                );
                crate::metrics::record_swap_executed(meta.chain_id);
                Ok(())
            }
        }
    }
}

/// Settlement figures of a settled chunk, as kept in its snapshot
fn settled_report(order: &Order, chunk_index: u32) -> Option<SettlementReport> {
    let chunk = order.chunk(chunk_index)?;
    Some(SettlementReport {
        order_id: order.order_id,
        chunk_index,
        chain_id: order.route.destination_chain,
        tx_hash: chunk.settle_tx?,
        amount_in: chunk.amount,
        expected_out: chunk.expected_out?,
        amount_out: chunk.amount_out?,
        gas_cost: chunk.gas_cost?,
    })
}

fn log_if_complete(order: &Order) {
    if !order.is_complete() || order.canceled {
        return;
    }
    info!(
        "Order {} complete: {}/{} slices settled, received {}",
        order.order_id, order.executed_slices, order.num_slices, order.received_amount
    );
    crate::metrics::record_order_completed();
    if order.received_amount < order.min_return_amount {
        warn!(
            "Order {} received {} below its minimum return of {}",
            order.order_id, order.received_amount, order.min_return_amount
        );
    }
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
impl CoordinationEngine {
    /// Wait for the next step to finish and apply it
    async fn complete_next(&self, now: u64) {
        let completion = {
            let mut rx = self.completions_rx.lock().await;
            let rx = rx.as_mut().expect("engine loop owns the receiver");
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("step did not finish")
                .expect("channel closed")
        };
        self.complete(completion, now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeContract, LockRequest, MockBridgeContract};
    use crate::chain::cursor::testing::ScriptedLedger;
    use crate::chain::cursor::CursorSettings;
    use crate::chain::LogFilter;
    use crate::coordination::order::tests::params;
    use crate::coordination::{MockOrderSource, OrderParams};
    use crate::events::{fixtures, topics};
    use crate::retry::RetryPolicy;
    use crate::settlement::{MockLiquidityAuction, MockSwapExecutor, Quote, SubmittedOrder, SwapReceipt};
    use crate::state::memory::MemoryStore;
    use crate::tx::GasEstimator;
    use ethers::types::Bytes;
    use std::collections::HashMap;

    const SOURCE: u64 = 42793;
    const DESTINATION: u64 = 8453;

    fn config(max_concurrent_chunks: usize) -> RelayerConfig {
        RelayerConfig {
            instance_id: "test".to_string(),
            poll_interval_ms: 10,
            max_concurrent_chunks,
            min_interval_secs: 60,
            max_block_range: 1_000,
            dedup_retention_blocks: 1_000,
            dedup_max_entries: 10_000,
            shutdown_grace_secs: 5,
            health_check_interval_secs: 30,
            stale_lock_warn_secs: 900,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2), 2.0)
    }

    fn source(p: OrderParams) -> MockOrderSource {
        let mut source = MockOrderSource::new();
        source.expect_fetch_order().returning(move |_, _| Ok(p.clone()));
        source
    }

    fn bridge_ok() -> MockBridgeContract {
        let mut bridge = MockBridgeContract::new();
        bridge
            .expect_lock_tokens()
            .returning(|request| Ok(H256::from_low_u64_be(0x100 + request.chunk_index as u64)));
        bridge
    }

    fn auction_ok() -> MockLiquidityAuction {
        let mut auction = MockLiquidityAuction::new();
        auction.expect_quote().returning(|request| {
            Ok(Quote {
                expected_out: request.amount,
                settlement_payload: Bytes::from(vec![0xaa]),
                gas_estimate: U256::from(150_000),
            })
        });
        auction.expect_submit_order().returning(|_, _| {
            Ok(SubmittedOrder {
                tx_payload: Bytes::from(vec![0xbb]),
            })
        });
        auction
    }

    fn executor_ok() -> MockSwapExecutor {
        let mut executor = MockSwapExecutor::new();
        executor
            .expect_estimate_swap_gas()
            .returning(|_| Ok(U256::from(100_000)));
        executor
            .expect_execute_swap()
            .returning(|call, _| Ok(H256::from_low_u64_be(0x200 + call.chunk_index as u64)));
        executor.expect_confirm_swap().returning(|call, tx_hash| {
            Ok(SwapReceipt {
                tx_hash,
                block_number: 50,
                amount_out: call.amount * 99 / 100,
                gas_used: U256::from(90_000),
                effective_gas_price: U256::from(2),
            })
        });
        executor
    }

    struct Harness {
        engine: Arc<CoordinationEngine>,
        scheduler: Arc<ScriptedLedger>,
        bridge: Arc<ScriptedLedger>,
        state: Arc<MemoryStore>,
        analytics: Arc<AnalyticsRecorder>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(
            source: MockOrderSource,
            bridge: Arc<dyn BridgeContract>,
            auction: MockLiquidityAuction,
            executor: MockSwapExecutor,
            max_concurrent_chunks: usize,
        ) -> Self {
            Self::with_state(
                Arc::new(MemoryStore::default()),
                source,
                bridge,
                auction,
                executor,
                max_concurrent_chunks,
            )
            .await
        }

        async fn with_state(
            state: Arc<MemoryStore>,
            source: MockOrderSource,
            bridge: Arc<dyn BridgeContract>,
            auction: MockLiquidityAuction,
            executor: MockSwapExecutor,
            max_concurrent_chunks: usize,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let scheduler_ledger = Arc::new(ScriptedLedger::new(SOURCE, 0));
            let bridge_ledger = Arc::new(ScriptedLedger::new(SOURCE, 0));
            let settings = CursorSettings {
                confirmations: 0,
                max_block_range: 1_000,
                retention_blocks: 1_000,
                max_entries: 10_000,
            };

            let scheduler_cursor = EventCursor::open(
                scheduler_ledger.clone(),
                LogFilter::new(Address::repeat_byte(0x70), topics::scheduler()),
                state.clone(),
                settings,
                Some(1),
            )
            .await
            .unwrap();
            let bridge_cursor = EventCursor::open(
                bridge_ledger.clone(),
                LogFilter::new(Address::repeat_byte(0x80), topics::bridge()),
                state.clone(),
                settings,
                Some(1),
            )
            .await
            .unwrap();

            let mut recipients = HashMap::new();
            recipients.insert(DESTINATION, Address::repeat_byte(0xee));
            let analytics = Arc::new(
                AnalyticsRecorder::open(dir.path().join("analytics.jsonl"), 0.8)
                    .await
                    .unwrap(),
            );

            let engine = CoordinationEngine::new(
                config(max_concurrent_chunks),
                Route {
                    source_chain: SOURCE,
                    destination_chain: DESTINATION,
                },
                state.clone(),
                vec![scheduler_cursor, bridge_cursor],
                Arc::new(source),
                BridgeCoordinator::new(bridge, policy(), recipients),
                SettlementClient::new(
                    Arc::new(auction),
                    Arc::new(executor),
                    policy(),
                    GasEstimator::new(130),
                    30,
                ),
                analytics.clone(),
            );

            Self {
                engine: Arc::new(engine),
                scheduler: scheduler_ledger,
                bridge: bridge_ledger,
                state,
                analytics,
                dir,
            }
        }

        fn emit_scheduler(&self, log: ethers::types::Log) {
            let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
            self.scheduler.push(log);
            self.scheduler.set_height(block);
        }

        fn emit_bridge(&self, log: ethers::types::Log) {
            let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
            self.bridge.push(log);
            self.bridge.set_height(block);
        }

        async fn order(&self, id: u64) -> Order {
            self.engine.store().get(&U256::from(id)).await.unwrap()
        }

        async fn states(&self, id: u64) -> Vec<ChunkState> {
            self.order(id).await.chunks.iter().map(|c| c.state).collect()
        }
    }

    fn scheduled(order_id: u64, total: u64, block: u64, tx: u8) -> ethers::types::Log {
        fixtures::order_scheduled(
            order_id,
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x22),
            Address::repeat_byte(0x33),
            U256::from(total),
            false,
            block,
            H256::repeat_byte(tx),
            0,
        )
    }

    fn confirmed(order_id: u64, chunk_index: u32, amount: u64, block: u64, tx: u8) -> ethers::types::Log {
        fixtures::transfer_confirmed(
            order_id,
            chunk_index,
            Address::repeat_byte(0x22),
            U256::from(amount),
            Address::repeat_byte(0xee),
            block,
            H256::repeat_byte(tx),
            0,
        )
    }

    #[tokio::test]
    async fn test_two_slice_order_runs_to_completion() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));

        // First chunk is due at startTime
        h.engine.tick(1_000).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Locking, ChunkState::Pending]);
        h.engine.complete_next(1_001).await;
        assert_eq!(h.order(1).await.chunks[0].lock_tx, Some(H256::from_low_u64_be(0x100)));

        // Chunk 1 is overdue but chunk 0 has not been bridged yet
        h.engine.tick(1_100).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Locked, ChunkState::Pending]);

        h.emit_bridge(confirmed(1, 0, 500, 2, 0xb1));
        h.engine.tick(1_100).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Settling, ChunkState::Pending]);
        h.engine.complete_next(1_101).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Settled, ChunkState::Pending]);
        assert_eq!(h.order(1).await.executed_slices, 1);

        h.engine.tick(1_102).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Settled, ChunkState::Locking]);
        h.engine.complete_next(1_103).await;
        h.emit_bridge(confirmed(1, 1, 500, 3, 0xb2));
        h.engine.tick(1_104).await;
        h.engine.complete_next(1_105).await;

        let order = h.order(1).await;
        assert!(order.is_complete());
        assert_eq!(order.executed_slices, 2);
        assert_eq!(order.received_amount, U256::from(990));
        assert_eq!(h.analytics.len().await, 2);
        assert_eq!(h.engine.in_flight(), 0);

        let persisted = h.state.order(U256::from(1)).unwrap();
        assert!(persisted.chunks.iter().all(|c| c.state == ChunkState::Settled));
    }

    #[tokio::test]
    async fn test_replayed_schedule_creates_one_order() {
        let mut source = MockOrderSource::new();
        source
            .expect_fetch_order()
            .times(1)
            .returning(|_, _| Ok(params(1_000, 2, 60, 5_000)));
        let h = Harness::new(source, Arc::new(bridge_ok()), auction_ok(), executor_ok(), 4).await;

        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        // Node delivers the same log twice
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        // And another log for the same order id
        h.emit_scheduler(scheduled(1, 1_000, 2, 0xa2));
        h.engine.tick(1_000).await;

        assert_eq!(h.engine.store().len().await, 1);
        assert_eq!(h.state.processed_count(), 2);
    }

    #[tokio::test]
    async fn test_event_disagreeing_with_contract_is_rejected() {
        // Contract reports a different total than the event
        let h = Harness::new(
            source(params(2_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;

        assert_eq!(h.engine.store().len().await, 0);
        // Rejected events are not redelivered
        assert_eq!(h.state.processed_count(), 1);
    }

    /// Settle chunk 0 of a two-slice order while the analytics file cannot be opened
    async fn settle_first_chunk_without_analytics(h: &Harness) -> std::path::PathBuf {
        let path = h.dir.path().join("analytics.jsonl");
        std::fs::create_dir(&path).unwrap();
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;
        h.emit_bridge(confirmed(1, 0, 500, 1, 0xb1));
        h.engine.tick(1_002).await;
        h.engine.complete_next(1_003).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Settled, ChunkState::Pending]);
        assert_eq!(h.analytics.len().await, 0);
        path
    }

    #[tokio::test]
    async fn test_failed_analytics_append_is_retried() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        let path = settle_first_chunk_without_analytics(&h).await;

        // Still unwritable
        h.engine.tick(1_010).await;
        assert_eq!(h.analytics.len().await, 0);

        std::fs::remove_dir(&path).unwrap();
        h.engine.tick(1_020).await;
        h.engine.tick(1_030).await;

        let records = h.analytics.query(&Default::default()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order_id, U256::from(1));
        assert_eq!(records[0].chunk_index, 0);
        assert_eq!(records[0].expected_amount, U256::from(500));
        assert_eq!(records[0].actual_amount, U256::from(495));
        assert_eq!(records[0].gas_cost, U256::from(180_000));
        assert_eq!(records[0].timestamp.timestamp(), 1_003);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_recover_writes_missing_analytics() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        settle_first_chunk_without_analytics(&h).await;

        let restarted = Harness::with_state(
            h.state.clone(),
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        restarted.engine.recover(1_010).await.unwrap();

        assert_eq!(restarted.analytics.len().await, 1);
        assert!(restarted.analytics.contains(U256::from(1), 0).await);
        assert!(!restarted.analytics.contains(U256::from(1), 1).await);
    }

    #[tokio::test]
    async fn test_cancel_before_start_prevents_locking() {
        let mut bridge = MockBridgeContract::new();
        bridge.expect_lock_tokens().never();
        let h = Harness::new(
            source(params(1_000, 2, 60, 5_000)),
            Arc::new(bridge),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.emit_scheduler(fixtures::order_canceled(1, 2, H256::repeat_byte(0xa2), 0));

        h.engine.tick(1_000).await;
        h.engine.tick(10_000).await;

        let order = h.order(1).await;
        assert!(order.canceled);
        assert!(order.chunks.iter().all(|c| c.state == ChunkState::Canceled));
        assert!(h.state.order(U256::from(1)).unwrap().canceled);
    }

    #[tokio::test]
    async fn test_cancel_while_locked_lets_chunk_finish() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Locked, ChunkState::Pending]);

        h.emit_scheduler(fixtures::order_canceled(1, 2, H256::repeat_byte(0xa2), 0));
        h.emit_bridge(confirmed(1, 0, 500, 1, 0xb1));
        h.engine.tick(1_002).await;

        let order = h.order(1).await;
        assert!(order.canceled);
        assert_eq!(order.chunks[0].state, ChunkState::Settling);
        assert_eq!(order.chunks[1].state, ChunkState::Canceled);
        h.engine.complete_next(1_003).await;

        // Chunk 1 is long overdue but must never lock
        h.engine.tick(10_000).await;
        let order = h.order(1).await;
        assert_eq!(order.chunks[0].state, ChunkState::Settled);
        assert_eq!(order.chunks[1].state, ChunkState::Canceled);
        assert!(order.is_complete());
        assert_eq!(h.engine.in_flight(), 0);
        assert!(h.state.order(U256::from(1)).unwrap().canceled);
    }

    #[tokio::test]
    async fn test_cancel_after_failed_first_chunk_stops_order() {
        let mut bridge = MockBridgeContract::new();
        bridge.expect_lock_tokens().times(1).returning(|_| {
            Err(RelayerError::Reverted {
                chain_id: SOURCE,
                tx_hash: "0x01".to_string(),
            })
        });
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;
        assert_eq!(h.states(1).await, vec![ChunkState::Failed, ChunkState::Pending]);

        h.emit_scheduler(fixtures::order_canceled(1, 2, H256::repeat_byte(0xa2), 0));
        h.engine.tick(1_070).await;
        h.engine.tick(10_000).await;

        let order = h.order(1).await;
        assert!(order.canceled);
        assert_eq!(order.executed_slices, 0);
        assert_eq!(h.states(1).await, vec![ChunkState::Failed, ChunkState::Canceled]);
        assert_eq!(h.engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_settled_chunk_is_ignored() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;
        h.emit_bridge(confirmed(1, 0, 500, 1, 0xb1));
        h.engine.tick(1_002).await;
        h.engine.complete_next(1_003).await;
        assert_eq!(h.order(1).await.executed_slices, 1);

        h.emit_scheduler(fixtures::order_canceled(1, 2, H256::repeat_byte(0xa2), 0));
        h.engine.tick(1_060).await;

        let order = h.order(1).await;
        assert!(!order.canceled);
        assert_eq!(order.chunks[1].state, ChunkState::Locking);
        h.engine.complete_next(1_061).await;
    }

    #[tokio::test]
    async fn test_transfer_mismatch_fails_chunk_and_order_continues() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;

        h.emit_bridge(confirmed(1, 0, 499, 1, 0xb1));
        h.engine.tick(1_002).await;
        let order = h.order(1).await;
        assert_eq!(order.chunks[0].state, ChunkState::Failed);
        assert!(order.chunks[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("mismatch"));

        // The next chunk still waits for its own due time
        h.engine.tick(1_059).await;
        assert_eq!(h.states(1).await[1], ChunkState::Pending);
        h.engine.tick(1_060).await;
        assert_eq!(h.states(1).await[1], ChunkState::Locking);
    }

    #[tokio::test]
    async fn test_unavailable_auction_fails_chunk_after_retries() {
        let mut auction = MockLiquidityAuction::new();
        auction.expect_quote().times(3).returning(|_| {
            Err(RelayerError::AuctionUnavailable {
                status: Some(503),
                message: "maintenance".to_string(),
            })
        });
        let mut executor = MockSwapExecutor::new();
        executor.expect_execute_swap().never();
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction,
            executor,
            4,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.engine.tick(1_000).await;
        h.engine.complete_next(1_001).await;
        h.emit_bridge(confirmed(1, 0, 500, 1, 0xb1));
        h.engine.tick(1_002).await;
        h.engine.complete_next(1_003).await;

        let order = h.order(1).await;
        assert_eq!(order.chunks[0].state, ChunkState::Failed);
        let reason = order.chunks[0].failure_reason.clone().unwrap();
        assert!(reason.starts_with("settle failed"), "{}", reason);
        assert!(reason.contains("after 3 attempts"), "{}", reason);
        assert_eq!(order.executed_slices, 0);
        assert_eq!(h.analytics.len().await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_limit_is_global() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 1_000)),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            1,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));
        h.emit_scheduler(scheduled(2, 1_000, 1, 0xa2));

        h.engine.tick(1_000).await;
        assert_eq!(h.states(1).await[0], ChunkState::Locking);
        assert_eq!(h.states(2).await[0], ChunkState::Pending);
        assert_eq!(h.engine.in_flight(), 1);

        h.engine.complete_next(1_001).await;
        h.engine.tick(1_001).await;
        assert_eq!(h.states(2).await[0], ChunkState::Locking);
    }

    #[tokio::test]
    async fn test_recovery_fails_interrupted_chunks() {
        let state = Arc::new(MemoryStore::default());
        let route = Route {
            source_chain: SOURCE,
            destination_chain: DESTINATION,
        };

        let mut settling = Order::new(U256::from(1), SOURCE, &params(1_000, 2, 60, 0), route, 60, 0).unwrap();
        {
            let chunk = settling.chunk_mut(0).unwrap();
            chunk.transition(ChunkState::Locking, 1).unwrap();
            chunk.transition(ChunkState::Locked, 2).unwrap();
            chunk.transition(ChunkState::Settling, 3).unwrap();
        }
        let mut locked = Order::new(U256::from(2), SOURCE, &params(1_000, 2, 60, 0), route, 60, 0).unwrap();
        {
            let chunk = locked.chunk_mut(0).unwrap();
            chunk.transition(ChunkState::Locking, 1).unwrap();
            chunk.transition(ChunkState::Locked, 2).unwrap();
        }
        state.save_order(&settling).await.unwrap();
        state.save_order(&locked).await.unwrap();

        let h = Harness::with_state(
            state,
            MockOrderSource::new(),
            Arc::new(bridge_ok()),
            auction_ok(),
            executor_ok(),
            4,
        )
        .await;
        assert_eq!(h.engine.recover(100).await.unwrap(), 2);

        let order = h.order(1).await;
        assert_eq!(order.chunks[0].state, ChunkState::Failed);
        assert_eq!(
            order.chunks[0].failure_reason.as_deref(),
            Some("interrupted by restart")
        );
        assert_eq!(
            h.state.order(U256::from(1)).unwrap().chunks[0].state,
            ChunkState::Failed
        );
        assert_eq!(h.states(2).await[0], ChunkState::Locked);
    }

    struct SlowBridge;

    #[async_trait]
    impl BridgeContract for SlowBridge {
        async fn lock_tokens(&self, _request: &LockRequest) -> RelayerResult<H256> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(H256::repeat_byte(0x10))
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_lock() {
        let h = Harness::new(
            source(params(1_000, 2, 60, 0)),
            Arc::new(SlowBridge),
            auction_ok(),
            executor_ok(),
            2,
        )
        .await;
        h.emit_scheduler(scheduled(1, 1_000, 1, 0xa1));

        let engine = h.engine.clone();
        let handle = tokio::spawn(async move { engine.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.states(1).await[0], ChunkState::Locking);

        h.engine.stop().await;
        handle.await.unwrap().unwrap();

        assert_eq!(h.states(1).await[0], ChunkState::Locked);
        assert_eq!(h.engine.in_flight(), 0);
        assert!(h.engine.run().await.is_err());
    }
}

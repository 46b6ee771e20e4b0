//! In-memory state store for tests

use super::StateStore;
use crate::chain::ProcessedEventKey;
use crate::coordination::{Order, OrderId};
use crate::error::RelayerResult;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MemoryStore {
    checkpoints: Mutex<HashMap<String, u64>>,
    processed: Mutex<HashMap<(String, ProcessedEventKey), u64>>,
    orders: Mutex<HashMap<OrderId, Order>>,
}

impl MemoryStore {
    pub(crate) fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    pub(crate) fn processed_in(&self, stream: &str) -> usize {
        self.processed
            .lock()
            .unwrap()
            .keys()
            .filter(|(s, _)| s == stream)
            .count()
    }

    pub(crate) fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.lock().unwrap().get(&order_id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>> {
        Ok(self.checkpoints.lock().unwrap().get(stream).copied())
    }

    async fn save_checkpoint(&self, stream: &str, _chain_id: u64, block_number: u64) -> RelayerResult<()> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(stream.to_string(), block_number);
        Ok(())
    }

    async fn load_processed_events(
        &self,
        stream: &str,
        since_block: u64,
    ) -> RelayerResult<Vec<(ProcessedEventKey, u64)>> {
        Ok(self
            .processed
            .lock()
            .unwrap()
            .iter()
            .filter(|((s, _), b)| s == stream && **b >= since_block)
            .map(|((_, k), b)| (*k, *b))
            .collect())
    }

    async fn record_processed_event(
        &self,
        stream: &str,
        key: &ProcessedEventKey,
        block_number: u64,
    ) -> RelayerResult<()> {
        self.processed
            .lock()
            .unwrap()
            .insert((stream.to_string(), *key), block_number);
        Ok(())
    }

    async fn prune_processed_events(&self, stream: &str, below_block: u64) -> RelayerResult<u64> {
        let mut processed = self.processed.lock().unwrap();
        let before = processed.len();
        processed.retain(|(s, _), b| s != stream || *b >= below_block);
        Ok((before - processed.len()) as u64)
    }

    async fn save_order(&self, order: &Order) -> RelayerResult<()> {
        self.orders
            .lock()
            .unwrap()
            .insert(order.order_id, order.clone());
        Ok(())
    }

    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        Ok(self.orders.lock().unwrap().values().cloned().collect())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

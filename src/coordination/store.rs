//! In-memory order store
//!
//! Owned by the coordination engine, which is the only writer. Other
//! components (the HTTP API) take read-only snapshots.

use super::order::{ChunkState, Order, OrderId};
use crate::error::{RelayerError, RelayerResult};

use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct OrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new order. Returns false if the order id is already known.
    pub async fn insert(&self, order: Order) -> bool {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_id) {
            return false;
        }
        orders.insert(order.order_id, order);
        true
    }

    pub async fn contains(&self, order_id: &OrderId) -> bool {
        self.orders.read().await.contains_key(order_id)
    }

    pub async fn get(&self, order_id: &OrderId) -> Option<Order> {
        self.orders.read().await.get(order_id).cloned()
    }

    /// Apply a mutation to one order and return the updated snapshot
    pub async fn update<R>(
        &self,
        order_id: &OrderId,
        f: impl FnOnce(&mut Order) -> RelayerResult<R>,
    ) -> RelayerResult<(R, Order)> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| RelayerError::UnknownOrder {
                order_id: order_id.to_string(),
            })?;
        let result = f(order)?;
        Ok((result, order.clone()))
    }

    /// Orders that still have non-terminal chunks
    pub async fn active(&self) -> Vec<Order> {
        self.orders
            .read()
            .await
            .values()
            .filter(|o| !o.is_complete())
            .cloned()
            .collect()
    }

    /// All orders sorted by id
    pub async fn snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.read().await.values().cloned().collect();
        orders.sort_by_key(|o| o.order_id);
        orders
    }

    /// Chunk counts by state across every tracked order
    pub async fn chunk_counts(&self) -> HashMap<ChunkState, usize> {
        let mut counts = HashMap::new();
        for order in self.orders.read().await.values() {
            for (state, n) in order.state_counts() {
                *counts.entry(state).or_insert(0) += n;
            }
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::order::tests::{params, route};
    use ethers::types::U256;

    #[tokio::test]
    async fn test_insert_is_idempotent_by_order_id() {
        let store = OrderStore::new();
        let order = Order::new(U256::from(7), 1, &params(100, 2, 60, 0), route(), 60, 0).unwrap();
        assert!(store.insert(order.clone()).await);
        assert!(!store.insert(order).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_order_fails() {
        let store = OrderStore::new();
        let result = store.update(&U256::from(1), |_| Ok(())).await;
        assert!(matches!(result, Err(RelayerError::UnknownOrder { .. })));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_order_unchanged() {
        let store = OrderStore::new();
        let order = Order::new(U256::from(3), 1, &params(100, 2, 60, 0), route(), 60, 0).unwrap();
        store.insert(order).await;

        let result = store
            .update(&U256::from(3), |o| o.chunk_mut(0)?.transition(ChunkState::Settled, 1))
            .await;
        assert!(result.is_err());

        let order = store.get(&U256::from(3)).await.unwrap();
        assert_eq!(order.chunks[0].state, ChunkState::Pending);
        let counts = store.chunk_counts().await;
        assert_eq!(counts[&ChunkState::Pending], 2);
    }
}

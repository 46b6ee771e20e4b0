//! PostgreSQL state manager

use super::StateStore;
use crate::chain::ProcessedEventKey;
use crate::config::DatabaseConfig;
use crate::coordination::Order;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                stream VARCHAR(128) PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                stream VARCHAR(128) NOT NULL,
                chain_id BIGINT NOT NULL,
                tx_hash BYTEA NOT NULL,
                log_index BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (stream, chain_id, tx_hash, log_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_processed_events_stream_block
            ON processed_events (stream, block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id VARCHAR(78) PRIMARY KEY,
                origin_chain BIGINT NOT NULL,
                snapshot JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for StateManager {
    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE stream = $1")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_checkpoint(&self, stream: &str, chain_id: u64, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (stream, chain_id, block_number, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (stream)
            DO UPDATE SET block_number = $3, updated_at = NOW()
            "#,
        )
        .bind(stream)
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: block {}", stream, block_number);
        Ok(())
    }

    async fn load_processed_events(
        &self,
        stream: &str,
        since_block: u64,
    ) -> RelayerResult<Vec<(ProcessedEventKey, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, tx_hash, log_index, block_number
            FROM processed_events
            WHERE stream = $1 AND block_number >= $2
            "#,
        )
        .bind(stream)
        .bind(since_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let tx_hash: Vec<u8> = row.get("tx_hash");
                if tx_hash.len() != 32 {
                    return Err(RelayerError::Internal(format!(
                        "stored tx hash has {} bytes",
                        tx_hash.len()
                    )));
                }
                let key = ProcessedEventKey {
                    chain_id: row.get::<i64, _>("chain_id") as u64,
                    tx_hash: H256::from_slice(&tx_hash),
                    log_index: row.get::<i64, _>("log_index") as u64,
                };
                Ok((key, row.get::<i64, _>("block_number") as u64))
            })
            .collect()
    }

    async fn record_processed_event(
        &self,
        stream: &str,
        key: &ProcessedEventKey,
        block_number: u64,
    ) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (stream, chain_id, tx_hash, log_index, block_number)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stream, chain_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(key.chain_id as i64)
        .bind(key.tx_hash.as_bytes())
        .bind(key.log_index as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_processed_events(&self, stream: &str, below_block: u64) -> RelayerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE stream = $1 AND block_number < $2",
        )
        .bind(stream)
        .bind(below_block as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn save_order(&self, order: &Order) -> RelayerResult<()> {
        let snapshot =
            serde_json::to_value(order).map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, origin_chain, snapshot, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (order_id)
            DO UPDATE SET snapshot = $3, updated_at = NOW()
            "#,
        )
        .bind(order.order_id.to_string())
        .bind(order.origin_chain as i64)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        let rows = sqlx::query("SELECT snapshot FROM orders")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let snapshot: serde_json::Value = row.get("snapshot");
                serde_json::from_value(snapshot).map_err(|e| RelayerError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

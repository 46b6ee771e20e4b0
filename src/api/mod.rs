//! HTTP API for health checks, status, orders, and execution analytics

use crate::analytics::{AnalyticsQuery, AnalyticsRecorder};
use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::{ChunkState, Order, OrderId, OrderStore};
use crate::error::RelayerResult;
use crate::state::StateStore;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub state_store: Arc<dyn StateStore>,
    pub chain_manager: Arc<ChainManager>,
    pub orders: Arc<OrderStore>,
    pub analytics: Arc<AnalyticsRecorder>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/orders", get(list_orders))
        .route("/orders/:order_id", get(get_order))
        .route("/analytics", get(query_analytics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.state_store.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(id, h)| ChainHealth {
                    chain_id: id,
                    healthy: h,
                })
                .collect(),
        }),
    )
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.orders.chunk_counts().await;
    let chunks = [
        ChunkState::Pending,
        ChunkState::Locking,
        ChunkState::Locked,
        ChunkState::Settling,
        ChunkState::Settled,
        ChunkState::Failed,
        ChunkState::Canceled,
    ]
    .into_iter()
    .map(|s| (s.as_str(), counts.get(&s).copied().unwrap_or(0)))
    .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_chains: state.chain_manager.connected_chains(),
        orders: state.orders.len().await,
        active_orders: state.orders.active().await.len(),
        chunks,
    })
}

async fn list_orders(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orders.snapshot().await)
}

async fn get_order(State(state): State<AppState>, Path(order_id): Path<String>) -> Response {
    let Some(order_id) = parse_order_id(&order_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid order id");
    };
    match state.orders.get(&order_id).await {
        Some(order) => Json::<Order>(order).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "order not found"),
    }
}

async fn query_analytics(State(state): State<AppState>, Query(params): Query<AnalyticsParams>) -> Response {
    let order_id = match params.order_id.as_deref().map(parse_order_id) {
        Some(None) => return error_response(StatusCode::BAD_REQUEST, "invalid orderId"),
        Some(id) => id,
        None => None,
    };
    let query = AnalyticsQuery {
        order_id,
        from: params.from,
        to: params.to,
    };
    Json(state.analytics.query(&query).await).into_response()
}

/// Decimal, or hex with a `0x` prefix
fn parse_order_id(raw: &str) -> Option<OrderId> {
    match raw.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(raw).ok(),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// Request and response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsParams {
    order_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    connected_chains: Vec<u64>,
    orders: usize,
    active_orders: usize,
    chunks: BTreeMap<&'static str, usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::Settings;
    use crate::coordination::order::tests::{params, route};
    use crate::settlement::SettlementReport;
    use crate::state::memory::MemoryStore;
    use chrono::TimeZone;
    use ethers::types::H256;

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn app_state(dir: &tempfile::TempDir) -> AppState {
        let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
        // No RPC traffic in tests
        for chain in settings.chains.values_mut() {
            chain.enabled = false;
        }
        let orders = Arc::new(OrderStore::new());
        let order = Order::new(U256::from(42), 42793, &params(1_000, 2, 60, 0), route(), 60, 0).unwrap();
        orders.insert(order.clone()).await;

        let analytics = Arc::new(
            AnalyticsRecorder::open(dir.path().join("analytics.jsonl"), 0.8)
                .await
                .unwrap(),
        );
        let report = SettlementReport {
            order_id: U256::from(42),
            chunk_index: 0,
            chain_id: 8453,
            tx_hash: H256::repeat_byte(1),
            amount_in: U256::from(500),
            expected_out: U256::from(1_000),
            amount_out: U256::from(997),
            gas_cost: U256::from(21_000),
        };
        analytics
            .record(&order, &report, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .await
            .unwrap();

        AppState {
            state_store: Arc::new(MemoryStore::default()),
            chain_manager: Arc::new(ChainManager::new(&settings).await.unwrap()),
            orders,
            analytics,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_parse_order_id() {
        assert_eq!(parse_order_id("42"), Some(U256::from(42)));
        assert_eq!(parse_order_id("0x2a"), Some(U256::from(42)));
        assert_eq!(parse_order_id("forty-two"), None);
    }

    #[tokio::test]
    async fn test_orders_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(app_state(&dir).await).await;
        let client = reqwest::Client::new();

        let ready = client.get(format!("{}/ready", base)).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        let status: serde_json::Value = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["orders"], 1);
        assert_eq!(status["chunks"]["pending"], 2);

        let found = client.get(format!("{}/orders/42", base)).send().await.unwrap();
        assert_eq!(found.status(), reqwest::StatusCode::OK);
        let order: serde_json::Value = found.json().await.unwrap();
        assert_eq!(order["num_slices"], 2);

        let missing = client.get(format!("{}/orders/7", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let invalid = client.get(format!("{}/orders/nope", base)).send().await.unwrap();
        assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analytics_query() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(app_state(&dir).await).await;
        let client = reqwest::Client::new();

        let records: Vec<serde_json::Value> = client
            .get(format!("{}/analytics?orderId=42&from=2023-11-14T00:00:00Z", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["slippagePct"], "0.300");
        assert_eq!(records[0]["actualAmount"], "997");

        let empty: Vec<serde_json::Value> = client
            .get(format!("{}/analytics?orderId=7", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(empty.is_empty());

        let bad = client
            .get(format!("{}/analytics?orderId=x", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}

//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and cursor progress
//! - Event intake (received, duplicated, undecodable, rejected)
//! - Order and chunk lifecycle
//! - Retries, submitted transactions, and realized slippage

use crate::error::RelayerResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, CounterVec,
    Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "twap_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CURSOR_HEIGHT: GaugeVec = register_gauge_vec!(
        "twap_relayer_cursor_height",
        "Last fully processed block per cursor stream",
        &["stream"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "twap_relayer_events_received_total",
        "Total events received by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "twap_relayer_events_duplicate_total",
        "Logs skipped because their key was already processed",
        &["chain_id"]
    ).unwrap();

    pub static ref EVENTS_UNDECODABLE: CounterVec = register_counter_vec!(
        "twap_relayer_events_undecodable_total",
        "Logs skipped because they could not be decoded",
        &["chain_id"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "twap_relayer_events_rejected_total",
        "Events dropped after a permanent handling error",
        &["chain_id", "event_type"]
    ).unwrap();

    // Order and chunk metrics
    pub static ref ORDERS_SCHEDULED: CounterVec = register_counter_vec!(
        "twap_relayer_orders_scheduled_total",
        "Orders accepted for execution",
        &["chain_id"]
    ).unwrap();

    pub static ref ORDER_OUTCOMES: CounterVec = register_counter_vec!(
        "twap_relayer_order_outcomes_total",
        "Orders rejected, canceled, or completed",
        &["outcome"]
    ).unwrap();

    pub static ref CHUNK_TRANSITIONS: CounterVec = register_counter_vec!(
        "twap_relayer_chunk_transitions_total",
        "Chunk state transitions by new state",
        &["state"]
    ).unwrap();

    pub static ref CHUNK_FAILURES: CounterVec = register_counter_vec!(
        "twap_relayer_chunk_failures_total",
        "Failed chunks by the stage that failed",
        &["stage"]
    ).unwrap();

    pub static ref CHUNKS_IN_FLIGHT: Gauge = register_gauge!(
        "twap_relayer_chunks_in_flight",
        "Lock and settle steps currently running"
    ).unwrap();

    // Transaction and retry metrics
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "twap_relayer_retries_total",
        "Retried attempts by operation",
        &["operation"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "twap_relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref SWAPS_EXECUTED: CounterVec = register_counter_vec!(
        "twap_relayer_swaps_executed_total",
        "SwapExecuted events observed",
        &["chain_id"]
    ).unwrap();

    pub static ref SLIPPAGE: Histogram = register_histogram!(
        "twap_relayer_slippage_percent",
        "Realized slippage per settled chunk, in percent",
        vec![-1.0, -0.1, 0.0, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "twap_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "twap_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_cursor_height(stream: &str, block_number: u64) {
    CURSOR_HEIGHT
        .with_label_values(&[stream])
        .set(block_number as f64);
}

pub fn record_event_received(chain_id: u64, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_event_duplicate(chain_id: u64) {
    EVENTS_DUPLICATE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_event_undecodable(chain_id: u64) {
    EVENTS_UNDECODABLE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_event_rejected(chain_id: u64, event_type: &str) {
    EVENTS_REJECTED
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_order_scheduled(chain_id: u64) {
    ORDERS_SCHEDULED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_order_rejected() {
    ORDER_OUTCOMES.with_label_values(&["rejected"]).inc();
}

pub fn record_order_canceled() {
    ORDER_OUTCOMES.with_label_values(&["canceled"]).inc();
}

pub fn record_order_completed() {
    ORDER_OUTCOMES.with_label_values(&["completed"]).inc();
}

pub fn record_chunk_transition(state: &str) {
    CHUNK_TRANSITIONS.with_label_values(&[state]).inc();
}

pub fn record_chunk_failure(stage: &str) {
    CHUNK_FAILURES.with_label_values(&[stage]).inc();
}

pub fn set_chunks_in_flight(count: usize) {
    CHUNKS_IN_FLIGHT.set(count as f64);
}

pub fn record_retry(operation: &str) {
    RETRIES.with_label_values(&[operation]).inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_swap_executed(chain_id: u64) {
    SWAPS_EXECUTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_slippage(slippage_pct: &Decimal) {
    if let Some(value) = slippage_pct.to_f64() {
        SLIPPAGE.observe(value);
    }
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

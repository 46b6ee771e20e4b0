//! HTTP client for the liquidity-auction service

use super::{LiquidityAuction, Quote, QuoteRequest, SubmittedOrder};
use crate::config::SettlementConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "liquidity auction";

pub struct AuctionClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    /// Decimal string, smallest unit
    expected_out: String,
    settlement_payload: String,
    gas_estimate: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderBody<'a> {
    chain_id: u64,
    order_id: String,
    chunk_index: u32,
    token_in: String,
    token_out: String,
    amount: String,
    expected_out: String,
    settlement_payload: &'a str,
    auction_period: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    tx_payload: String,
}

impl AuctionClient {
    pub fn new(config: &SettlementConfig) -> RelayerResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayerError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn read<T: DeserializeOwned>(&self, response: reqwest::Response) -> RelayerResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, body));
        }
        serde_json::from_str(&body).map_err(|e| RelayerError::AuctionResponse(e.to_string()))
    }
}

#[async_trait]
impl LiquidityAuction for AuctionClient {
    async fn quote(&self, request: &QuoteRequest) -> RelayerResult<Quote> {
        let url = format!("{}/quote", self.base_url);
        debug!(
            "Requesting quote for chunk {} of order {}: {} of {:?}",
            request.chunk_index, request.order_id, request.amount, request.token_in
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("chainId", request.chain_id.to_string()),
                ("tokenIn", format!("{:?}", request.token_in)),
                ("tokenOut", format!("{:?}", request.token_out)),
                ("amount", request.amount.to_string()),
                ("auctionPeriod", request.auction_period_secs.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let body: QuoteResponse = self.read(response).await?;
        Ok(Quote {
            expected_out: U256::from_dec_str(&body.expected_out)
                .map_err(|e| RelayerError::AuctionResponse(format!("expectedOut: {}", e)))?,
            settlement_payload: decode_hex(&body.settlement_payload)?,
            gas_estimate: U256::from(body.gas_estimate),
        })
    }

    async fn submit_order(&self, request: &QuoteRequest, quote: &Quote) -> RelayerResult<SubmittedOrder> {
        let url = format!("{}/order", self.base_url);
        let payload = format!("0x{}", hex::encode(&quote.settlement_payload));
        let body = OrderBody {
            chain_id: request.chain_id,
            order_id: request.order_id.to_string(),
            chunk_index: request.chunk_index,
            token_in: format!("{:?}", request.token_in),
            token_out: format!("{:?}", request.token_out),
            amount: request.amount.to_string(),
            expected_out: quote.expected_out.to_string(),
            settlement_payload: &payload,
            auction_period: request.auction_period_secs,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let body: OrderResponse = self.read(response).await?;
        Ok(SubmittedOrder {
            tx_payload: decode_hex(&body.tx_payload)?,
        })
    }
}

fn decode_hex(value: &str) -> RelayerResult<Bytes> {
    hex::decode(value.trim_start_matches("0x"))
        .map(Bytes::from)
        .map_err(|e| RelayerError::AuctionResponse(format!("invalid hex payload: {}", e)))
}

fn transport_error(e: reqwest::Error) -> RelayerError {
    if e.is_timeout() {
        RelayerError::Timeout {
            operation: SERVICE.to_string(),
        }
    } else {
        RelayerError::AuctionUnavailable {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// 429 and 408/5xx are transient; any other 4xx means the request itself is bad
fn classify_status(status: StatusCode, body: String) -> RelayerError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayerError::RateLimited {
            service: SERVICE.to_string(),
        },
        StatusCode::REQUEST_TIMEOUT => RelayerError::AuctionUnavailable {
            status: Some(status.as_u16()),
            message: body,
        },
        s if s.is_server_error() => RelayerError::AuctionUnavailable {
            status: Some(s.as_u16()),
            message: body,
        },
        s => RelayerError::QuoteRejected {
            status: s.as_u16(),
            message: body,
        },
    }
}

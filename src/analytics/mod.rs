//! Execution analytics: one immutable record per settled chunk
//!
//! Records are appended to a JSON-lines file and mirrored in memory for the
//! query surface. Appending is the only mutation.

use crate::coordination::{Order, OrderId};
use crate::error::{RelayerError, RelayerResult};
use crate::settlement::SettlementReport;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// U256 as a decimal string, the way amounts are written in the log
mod u256_dec {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    #[serde(with = "u256_dec")]
    pub order_id: OrderId,
    pub chunk_index: u32,
    #[serde(with = "u256_dec")]
    pub amount_in: U256,
    #[serde(with = "u256_dec")]
    pub expected_amount: U256,
    #[serde(with = "u256_dec")]
    pub actual_amount: U256,
    pub slippage_pct: Decimal,
    pub price_impact_pct: Decimal,
    /// Wei
    #[serde(with = "u256_dec")]
    pub gas_cost: U256,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: H256,
    pub from_token: Address,
    pub to_token: Address,
    pub source_chain: u64,
    pub destination_chain: u64,
}

/// Read-side filter; all bounds inclusive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsQuery {
    pub order_id: Option<OrderId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AnalyticsQuery {
    fn matches(&self, record: &AnalyticsRecord) -> bool {
        self.order_id.map_or(true, |id| record.order_id == id)
            && self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
    }
}

/// `(expected - actual) / expected * 100`, rounded half away from zero to 3 decimals.
/// Negative when the fill beat the quote.
pub fn slippage_pct(expected: U256, actual: U256) -> Decimal {
    if expected.is_zero() {
        return Decimal::ZERO;
    }
    let (diff, negative) = if expected >= actual {
        (expected - actual, false)
    } else {
        (actual - expected, true)
    };

    // Percent scaled by 1000, i.e. three decimal places
    let scaled = diff.saturating_mul(U256::from(100_000u64));
    let rounded = scaled.saturating_mul(U256::from(2u64)).saturating_add(expected) / expected.saturating_mul(U256::from(2u64));
    let milli = if rounded > U256::from(i64::MAX as u64) {
        i64::MAX
    } else {
        rounded.as_u64() as i64
    };

    Decimal::new(if negative { -milli } else { milli }, 3)
}

/// Price impact approximated as a fixed fraction of absolute slippage
pub fn price_impact_pct(slippage: Decimal, fraction: Decimal) -> Decimal {
    (slippage.abs() * fraction).round_dp(3)
}

pub struct AnalyticsRecorder {
    path: PathBuf,
    price_impact_fraction: Decimal,
    records: RwLock<Vec<AnalyticsRecord>>,
    write_lock: Mutex<()>,
}

impl AnalyticsRecorder {
    /// Open the log, loading any records already in it
    pub async fn open(path: impl AsRef<Path>, price_impact_fraction: f64) -> RelayerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let fraction = Decimal::try_from(price_impact_fraction).map_err(|e| {
            RelayerError::Config(format!("invalid price impact fraction: {}", e))
        })?;

        let mut records = Vec::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (n, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AnalyticsRecord>(line) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!("Skipping analytics line {} in {:?}: {}", n + 1, path, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Loaded {} analytics records from {:?}", records.len(), path);

        Ok(Self {
            path,
            price_impact_fraction: fraction,
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    /// Build, persist, and return the record for a settled chunk
    pub async fn record(
        &self,
        order: &Order,
        report: &SettlementReport,
        timestamp: DateTime<Utc>,
    ) -> RelayerResult<AnalyticsRecord> {
        let slippage = slippage_pct(report.expected_out, report.amount_out);
        let record = AnalyticsRecord {
            order_id: report.order_id,
            chunk_index: report.chunk_index,
            amount_in: report.amount_in,
            expected_amount: report.expected_out,
            actual_amount: report.amount_out,
            slippage_pct: slippage,
            price_impact_pct: price_impact_pct(slippage, self.price_impact_fraction),
            gas_cost: report.gas_cost,
            timestamp,
            tx_hash: report.tx_hash,
            from_token: order.from_token,
            to_token: order.to_token,
            source_chain: order.route.source_chain,
            destination_chain: order.route.destination_chain,
        };

        let mut line =
            serde_json::to_string(&record).map_err(|e| RelayerError::Internal(e.to_string()))?;
        line.push('\n');

        {
            let _guard = self.write_lock.lock().await;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }

        self.records.write().await.push(record.clone());
        crate::metrics::record_slippage(&record.slippage_pct);
        Ok(record)
    }

    /// Matching records ordered by timestamp
    pub async fn query(&self, query: &AnalyticsQuery) -> Vec<AnalyticsRecord> {
        let mut matching: Vec<AnalyticsRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp);
        matching
    }

    /// Whether a record for this chunk was already written
    pub async fn contains(&self, order_id: OrderId, chunk_index: u32) -> bool {
        self.records
            .read()
            .await
            .iter()
            .any(|r| r.order_id == order_id && r.chunk_index == chunk_index)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::order::tests::{params, route};
    use chrono::TimeZone;

    fn order(id: u64) -> Order {
        Order::new(U256::from(id), 42793, &params(200_000, 2, 60, 0), route(), 60, 0).unwrap()
    }

    fn report(order_id: u64, chunk_index: u32, expected: u64, actual: u64) -> SettlementReport {
        SettlementReport {
            order_id: U256::from(order_id),
            chunk_index,
            chain_id: 8453,
            tx_hash: H256::repeat_byte(0x42),
            amount_in: U256::from(100_000u64),
            expected_out: U256::from(expected),
            amount_out: U256::from(actual),
            gas_cost: U256::from(21_000u64 * 7),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_slippage_three_decimals() {
        let s = slippage_pct(U256::from(100_000u64), U256::from(99_700u64));
        assert_eq!(s, Decimal::new(300, 3));
        assert_eq!(s.to_string(), "0.300");

        assert_eq!(price_impact_pct(s, Decimal::new(8, 1)), Decimal::new(240, 3));
    }

    #[test]
    fn test_slippage_rounding_and_sign() {
        // 1/3 % -> 0.333
        assert_eq!(
            slippage_pct(U256::from(300_000u64), U256::from(299_000u64)),
            Decimal::new(333, 3)
        );
        // 2/3 % -> 0.667
        assert_eq!(
            slippage_pct(U256::from(300_000u64), U256::from(298_000u64)),
            Decimal::new(667, 3)
        );
        // Better than quoted
        assert_eq!(
            slippage_pct(U256::from(100_000u64), U256::from(100_500u64)),
            Decimal::new(-500, 3)
        );
        assert_eq!(slippage_pct(U256::zero(), U256::from(5u64)), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_records_are_appended_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.jsonl");

        let recorder = AnalyticsRecorder::open(&path, 0.8).await.unwrap();
        let record = recorder
            .record(&order(1), &report(1, 0, 100_000, 99_700), at(0))
            .await
            .unwrap();
        assert_eq!(record.slippage_pct.to_string(), "0.300");
        assert_eq!(record.price_impact_pct, Decimal::new(240, 3));
        assert_eq!(record.source_chain, 42793);
        assert_eq!(record.gas_cost, U256::from(147_000u64));
        recorder
            .record(&order(1), &report(1, 1, 100_000, 100_000), at(60))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"orderId\":\"1\""));
        assert!(contents.contains("\"expectedAmount\":\"100000\""));

        let reopened = AnalyticsRecorder::open(&path, 0.8).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        let all = reopened.query(&AnalyticsQuery::default()).await;
        assert_eq!(all[0], record);
    }

    #[tokio::test]
    async fn test_query_filters_inclusive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = AnalyticsRecorder::open(dir.path().join("a.jsonl"), 0.8)
            .await
            .unwrap();

        recorder.record(&order(2), &report(2, 0, 1_000, 990), at(120)).await.unwrap();
        recorder.record(&order(1), &report(1, 0, 1_000, 999), at(0)).await.unwrap();
        recorder.record(&order(1), &report(1, 1, 1_000, 998), at(60)).await.unwrap();

        let by_order = recorder
            .query(&AnalyticsQuery {
                order_id: Some(U256::from(1)),
                ..Default::default()
            })
            .await;
        let chunks: Vec<u32> = by_order.iter().map(|r| r.chunk_index).collect();
        assert_eq!(chunks, vec![0, 1]);

        let window = recorder
            .query(&AnalyticsQuery {
                order_id: None,
                from: Some(at(60)),
                to: Some(at(120)),
            })
            .await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].timestamp, at(60));
        assert_eq!(window[1].order_id, U256::from(2));
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.jsonl");
        std::fs::write(&path, "not json\n\n").unwrap();

        let recorder = AnalyticsRecorder::open(&path, 0.8).await.unwrap();
        assert_eq!(recorder.len().await, 0);
    }
}

//! Gas estimation and safety margins for different chain types

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::U256;
use tracing::debug;

/// Lowest gas limit multiplier accepted, in percent
pub const MIN_GAS_LIMIT_MULTIPLIER_PERCENT: u64 = 120;

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Gas limit safety multiplier in percent (130 = 1.3x)
    gas_limit_multiplier_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Multipliers below the minimum are raised to it
    pub fn new(gas_limit_multiplier_percent: u64) -> Self {
        Self {
            gas_limit_multiplier_percent: gas_limit_multiplier_percent
                .max(MIN_GAS_LIMIT_MULTIPLIER_PERCENT),
            gas_price_buffer_percent: 10,
        }
    }

    /// Gas limit for a call: the larger of the node estimate and any
    /// externally provided hint, scaled by the safety multiplier
    pub fn gas_limit(&self, estimate: U256, hint: Option<U256>) -> U256 {
        let base = hint.map_or(estimate, |h| h.max(estimate));
        base * U256::from(self.gas_limit_multiplier_percent) / U256::from(100u64)
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = self.buffer_price(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), gas_price);
        Ok(gas_price)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        let buffer = |v: U256| v + v * U256::from(self.gas_price_buffer_percent) / U256::from(100u64);
        match gas_price {
            GasPrice::Legacy(price) => GasPrice::Legacy(buffer(price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: buffer(max_fee_per_gas),
                max_priority_fee_per_gas: buffer(max_priority_fee_per_gas),
            },
        }
    }

    /// Upper bound on the cost of a transaction in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(130)
    }
}

// Gas 费优化 - EVM 链
// 最新区块带 baseFee 时走 EIP-1559，否则走 legacy gasPrice（取建议价与区块均价的较小值 + 5%）

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{BlockNumber, U256},
};
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};

/// 固定优先费 2 gwei
pub const PRIORITY_FEE_WEI: u64 = 2_000_000_000;
/// legacy 价格上浮百分比
pub const LEGACY_BUFFER_PERCENT: u64 = 5;
/// gasLimit 上浮比例（1/5 = 20%）
pub const GAS_LIMIT_PAD_DIVISOR: u64 = 5;

/// 链上费用数据来源
#[async_trait]
pub trait FeeDataSource: Send + Sync {
    /// 最新区块的 baseFeePerGas，不支持 EIP-1559 的链返回 None
    async fn latest_base_fee(&self) -> anyhow::Result<Option<U256>>;

    /// 最新区块内各交易的 gasPrice
    async fn latest_block_gas_prices(&self) -> anyhow::Result<Vec<U256>>;

    /// 节点建议 gasPrice（eth_gasPrice）
    async fn suggested_gas_price(&self) -> anyhow::Result<U256>;
}

#[async_trait]
impl FeeDataSource for Provider<Http> {
    async fn latest_base_fee(&self) -> anyhow::Result<Option<U256>> {
        let block = self.get_block(BlockNumber::Latest).await?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }

    async fn latest_block_gas_prices(&self) -> anyhow::Result<Vec<U256>> {
        let block = self.get_block_with_txs(BlockNumber::Latest).await?;
        Ok(block
            .map(|b| b.transactions.iter().filter_map(|tx| tx.gas_price).collect())
            .unwrap_or_default())
    }

    async fn suggested_gas_price(&self) -> anyhow::Result<U256> {
        Ok(self.get_gas_price().await?)
    }
}

/// 费用参数：EIP-1559 时 gas_price 为 None，legacy 时另两项为 None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSuggestion {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee: Option<U256>,
}

impl FeeSuggestion {
    pub fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GasOptimizer {
    optimize_enabled: bool,
}

impl GasOptimizer {
    pub fn new(optimize_enabled: bool) -> Self {
        Self { optimize_enabled }
    }

    /// 计算交易费用参数
    pub async fn suggest(&self, source: &dyn FeeDataSource) -> GatewayResult<FeeSuggestion> {
        match source.latest_base_fee().await {
            Ok(Some(base_fee)) => {
                let tip = U256::from(PRIORITY_FEE_WEI);
                let max_fee = base_fee.saturating_mul(U256::from(2)).saturating_add(tip);
                tracing::debug!(base_fee = %base_fee, max_fee = %max_fee, "eip1559 fee selected");
                return Ok(FeeSuggestion {
                    gas_price: None,
                    max_fee_per_gas: Some(max_fee),
                    max_priority_fee: Some(tip),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read latest block header, using legacy gas price");
            }
        }

        let suggested = source
            .suggested_gas_price()
            .await
            .map_err(|e| GatewayError::ChainQueryFailed(format!("eth_gasPrice: {}", e)))?;

        if !self.optimize_enabled {
            return Ok(legacy(suggested));
        }

        let base = match source.latest_block_gas_prices().await {
            Ok(prices) => match average(&prices) {
                Some(avg) if !avg.is_zero() => avg.min(suggested),
                _ => suggested,
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read latest block transactions");
                suggested
            }
        };

        let price = with_buffer(base);
        tracing::debug!(suggested = %suggested, price = %price, "legacy gas price selected");
        Ok(legacy(price))
    }
}

fn legacy(price: U256) -> FeeSuggestion {
    FeeSuggestion {
        gas_price: Some(price),
        max_fee_per_gas: None,
        max_priority_fee: None,
    }
}

/// 只统计非零 gasPrice（BSC 系统交易价格为 0）
fn average(prices: &[U256]) -> Option<U256> {
    let (sum, count) = prices
        .iter()
        .filter(|p| !p.is_zero())
        .fold((U256::zero(), 0u64), |(sum, count), p| {
            (sum.saturating_add(*p), count + 1)
        });
    if count == 0 {
        return None;
    }
    Some(sum / U256::from(count))
}

fn with_buffer(price: U256) -> U256 {
    price.saturating_mul(U256::from(100 + LEGACY_BUFFER_PERCENT)) / U256::from(100)
}

/// 估算值上浮 20%
pub fn pad_gas_limit(estimate: U256) -> U256 {
    estimate.saturating_add(estimate / U256::from(GAS_LIMIT_PAD_DIVISOR))
}

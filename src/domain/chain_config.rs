//! 多链配置模块
//!
//! 每条支持链的静态元数据：USDT 合约、精度、RPC 节点池、原生币符号。
//! 注册表在启动时由 `ChainsConfig` 构建，之后只读。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::ChainsConfig,
    error::{GatewayError, GatewayResult},
    utils::chain_normalizer::{lookup_chain, CHAIN_BSC, CHAIN_ETH, CHAIN_POLYGON, CHAIN_TRON},
};

/// 链族：决定地址格式、签名方式与交易构建方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// TRON：Base58Check 地址，节点构建交易，本地签 txID
    Tron,
    /// EVM：0x 地址，本地构建并签名 RLP 交易
    Evm,
}

/// 链配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// 规范名称（TRON / ETH / BSC / POLYGON）
    pub name: String,
    pub family: ChainFamily,
    /// EIP-155 链ID
    pub chain_id: Option<u64>,
    /// 原生币符号
    pub native_symbol: String,
    /// USDT 合约地址
    pub token_contract: String,
    /// USDT 精度
    pub token_decimals: u32,
    /// RPC 节点池（TRON 为 HTTP API 根地址）
    pub rpc_urls: Vec<String>,
}

impl ChainConfig {
    pub fn is_evm(&self) -> bool {
        self.family == ChainFamily::Evm
    }
}

/// 链配置注册表
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    configs: HashMap<String, ChainConfig>,
}

fn or_default_urls(urls: &[String], defaults: &[&str]) -> Vec<String> {
    if urls.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        urls.to_vec()
    }
}

impl ChainRegistry {
    /// 按配置构建注册表，未配置项使用主网默认值
    pub fn from_config(cfg: &ChainsConfig) -> Self {
        let mut registry = Self {
            configs: HashMap::new(),
        };

        registry.register(ChainConfig {
            name: CHAIN_TRON.to_string(),
            family: ChainFamily::Tron,
            chain_id: None,
            native_symbol: "TRX".to_string(),
            token_contract: cfg.tron_usdt_contract.clone(),
            token_decimals: 6,
            rpc_urls: or_default_urls(&cfg.tron_api_urls, &["https://api.trongrid.io"])
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
        });

        registry.register(ChainConfig {
            name: CHAIN_ETH.to_string(),
            family: ChainFamily::Evm,
            chain_id: Some(1),
            native_symbol: "ETH".to_string(),
            token_contract: cfg
                .eth_usdt_contract
                .clone()
                .unwrap_or_else(|| "0xdAC17F958D2ee523a2206206994597C13D831ec7".into()),
            token_decimals: cfg.eth_usdt_decimals.unwrap_or(6),
            rpc_urls: or_default_urls(
                &cfg.eth_rpc_urls,
                &["https://eth.llamarpc.com", "https://ethereum-rpc.publicnode.com"],
            ),
        });

        registry.register(ChainConfig {
            name: CHAIN_BSC.to_string(),
            family: ChainFamily::Evm,
            chain_id: Some(56),
            native_symbol: "BNB".to_string(),
            token_contract: cfg
                .bsc_usdt_contract
                .clone()
                .unwrap_or_else(|| "0x55d398326f99059fF775485246999027B3197955".into()),
            // BSC-USD 为18位精度
            token_decimals: cfg.bsc_usdt_decimals.unwrap_or(18),
            rpc_urls: or_default_urls(
                &cfg.bsc_rpc_urls,
                &["https://bsc-dataseed.binance.org/", "https://bsc.publicnode.com"],
            ),
        });

        registry.register(ChainConfig {
            name: CHAIN_POLYGON.to_string(),
            family: ChainFamily::Evm,
            chain_id: Some(137),
            native_symbol: "MATIC".to_string(),
            token_contract: cfg
                .polygon_usdt_contract
                .clone()
                .unwrap_or_else(|| "0xc2132D05D31c914a87C6611C10748AEb04B58e8F".into()),
            token_decimals: cfg.polygon_usdt_decimals.unwrap_or(6),
            rpc_urls: or_default_urls(&cfg.polygon_rpc_urls, &["https://polygon-rpc.com/"]),
        });

        registry
    }

    /// 注册或覆盖一条链
    pub fn register(&mut self, config: ChainConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    /// 按任意写法的链名称查询配置
    pub fn get(&self, chain: &str) -> GatewayResult<&ChainConfig> {
        lookup_chain(chain)
            .and_then(|id| self.configs.get(id.canonical_name))
            .ok_or_else(|| GatewayError::UnsupportedChain(chain.to_string()))
    }

    pub fn family_of(&self, chain: &str) -> GatewayResult<ChainFamily> {
        self.get(chain).map(|c| c.family)
    }

    pub fn all(&self) -> impl Iterator<Item = &ChainConfig> {
        self.configs.values()
    }
}

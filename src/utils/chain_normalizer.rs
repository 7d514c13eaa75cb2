//! 链标识符标准化模块
//!
//! 统一前端、商户后台和数据库中各种链写法（TRC20 / BEP20 / MATIC ...）

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{
    domain::chain_config::ChainFamily,
    error::{GatewayError, GatewayResult},
};

/// 规范链名称
pub const CHAIN_TRON: &str = "TRON";
pub const CHAIN_ETH: &str = "ETH";
pub const CHAIN_BSC: &str = "BSC";
pub const CHAIN_POLYGON: &str = "POLYGON";

/// 链标识符配置
#[derive(Debug, Clone)]
pub struct ChainIdentifier {
    /// 规范名称（大写）
    pub canonical_name: &'static str,
    /// EVM 链ID，TRON 为 None
    pub chain_id: Option<u64>,
    pub family: ChainFamily,
    /// 别名列表（大写）
    pub aliases: &'static [&'static str],
}

static CHAIN_ALIASES: Lazy<HashMap<&'static str, ChainIdentifier>> = Lazy::new(|| {
    let chains = [
        ChainIdentifier {
            canonical_name: CHAIN_TRON,
            chain_id: None,
            family: ChainFamily::Tron,
            aliases: &["TRON", "TRC20", "TRX"],
        },
        ChainIdentifier {
            canonical_name: CHAIN_ETH,
            chain_id: Some(1),
            family: ChainFamily::Evm,
            aliases: &["ETH", "EVM", "ETHEREUM", "ERC20"],
        },
        ChainIdentifier {
            canonical_name: CHAIN_BSC,
            chain_id: Some(56),
            family: ChainFamily::Evm,
            aliases: &["BSC", "BEP20", "BNB"],
        },
        ChainIdentifier {
            canonical_name: CHAIN_POLYGON,
            chain_id: Some(137),
            family: ChainFamily::Evm,
            aliases: &["POLYGON", "MATIC"],
        },
    ];

    let mut registry = HashMap::new();
    for chain in chains {
        for alias in chain.aliases {
            registry.insert(*alias, chain.clone());
        }
    }
    registry
});

/// 查找链标识（空字符串默认为 TRON）
pub fn lookup_chain(chain: &str) -> Option<&'static ChainIdentifier> {
    let key = chain.trim().to_uppercase();
    let key = if key.is_empty() { CHAIN_TRON.to_string() } else { key };
    CHAIN_ALIASES.get(key.as_str())
}

/// 标准化链名称
///
/// ```rust
/// # use ktvpay::utils::chain_normalizer::normalize_chain;
/// assert_eq!(normalize_chain("bep20").unwrap(), "BSC");
/// assert_eq!(normalize_chain("").unwrap(), "TRON");
/// ```
pub fn normalize_chain(chain: &str) -> GatewayResult<&'static str> {
    lookup_chain(chain)
        .map(|c| c.canonical_name)
        .ok_or_else(|| GatewayError::UnsupportedChain(chain.to_string()))
}

pub fn is_tron_chain(chain: &str) -> bool {
    matches!(lookup_chain(chain), Some(c) if c.family == ChainFamily::Tron)
}

pub fn is_evm_chain(chain: &str) -> bool {
    matches!(lookup_chain(chain), Some(c) if c.family == ChainFamily::Evm)
}

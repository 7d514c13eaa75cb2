//! 配置管理模块
//! 支持从环境变量和配置文件加载配置
//!
//! 配置在启动时构建一次，之后以 `Arc<Config>` 只读传递给各组件。

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// 敏感配置值（私钥、主密钥），Debug 输出时脱敏，释放时清零
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// 应用配置结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub chains: ChainsConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

/// 授权扣款网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 前台地址，用于拼接授权链接
    pub app_uri: String,
    /// 商户汇率（法币/USDT）
    pub usdt_rate: Decimal,
    /// 强制汇率，大于0时覆盖 usdt_rate
    #[serde(default)]
    pub forced_usdt_rate: Option<Decimal>,
    /// 授权有效期（秒）
    pub authorization_ttl_secs: i64,
    /// 剩余额度小于等于此值视为用尽
    pub depletion_epsilon: Decimal,
    /// 扣款金额保留的小数位
    pub token_amount_scale: u32,
    /// EVM 中转（公司）钱包
    #[serde(default)]
    pub company_wallet: Option<String>,
    /// TRON 中转（公司）钱包
    #[serde(default)]
    pub company_tron_wallet: Option<String>,
    /// 公司钱包私钥（提现出款）
    #[serde(default)]
    pub company_private_key: Option<Secret>,
    /// 商户收款地址 -> 私钥（地址已小写）
    #[serde(default)]
    pub merchant_private_keys: HashMap<String, Secret>,
    /// 未配置映射时所有收款地址共用的私钥
    #[serde(default)]
    pub merchant_private_key: Option<Secret>,
    /// 访问密码加密主密钥（64位hex）
    #[serde(default)]
    pub auth_master_key: Option<Secret>,
    pub approval_monitor_enabled: bool,
    pub approval_monitor_interval_secs: u64,
    pub expiry_sweep_enabled: bool,
    /// 提现默认链
    pub default_withdrawal_chain: String,
}

/// 链接入配置✅
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    /// TronGrid / FullNode HTTP 地址，多个时轮询
    pub tron_api_urls: Vec<String>,
    #[serde(default)]
    pub trongrid_api_key: Option<String>,
    pub tron_usdt_contract: String,
    /// transferFrom 的 fee_limit（sun）
    pub tron_fee_limit_sun: i64,
    pub eth_rpc_urls: Vec<String>,
    pub bsc_rpc_urls: Vec<String>,
    pub polygon_rpc_urls: Vec<String>,
    #[serde(default)]
    pub eth_usdt_contract: Option<String>,
    #[serde(default)]
    pub bsc_usdt_contract: Option<String>,
    #[serde(default)]
    pub polygon_usdt_contract: Option<String>,
    #[serde(default)]
    pub eth_usdt_decimals: Option<u32>,
    #[serde(default)]
    pub bsc_usdt_decimals: Option<u32>,
    #[serde(default)]
    pub polygon_usdt_decimals: Option<u32>,
    /// 所有出站 RPC 调用的超时（秒）
    pub rpc_timeout_secs: u64,
    pub gas_optimize_enabled: bool,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| split_and_trim(&raw))
        .unwrap_or_default()
}

fn split_and_trim(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://postgres@localhost:5432/ktvpay".into()),
            max_connections: env_parse("DB_MAX_CONNS").unwrap_or(16),
            min_connections: env_parse("DB_MIN_CONNS").unwrap_or(2),
            acquire_timeout_secs: env_parse("DB_ACQ_TIMEOUT_SECS").unwrap_or(5),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS").unwrap_or(300),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let merchant_private_keys = std::env::var("MERCHANT_PRIVATE_KEYS")
            .map(|raw| parse_key_map(&raw))
            .unwrap_or_default();

        Self {
            app_uri: env_string("APP_URI").unwrap_or_else(|| "http://localhost:8000".into()),
            usdt_rate: env_parse("USDT_RATE").unwrap_or_else(|| Decimal::new(65, 1)),
            forced_usdt_rate: env_parse("FORCED_USDT_RATE"),
            authorization_ttl_secs: env_parse("AUTHORIZATION_TTL_SECS").unwrap_or(24 * 3600),
            depletion_epsilon: env_parse("DEPLETION_EPSILON").unwrap_or_else(|| Decimal::new(1, 2)),
            token_amount_scale: 4,
            company_wallet: env_string("COMPANY_WALLET"),
            company_tron_wallet: env_string("COMPANY_TRON_WALLET"),
            company_private_key: env_string("COMPANY_PRIVATE_KEY").map(Secret::new),
            merchant_private_keys,
            merchant_private_key: env_string("MERCHANT_PRIVATE_KEY").map(Secret::new),
            auth_master_key: env_string("AUTH_MASTER_KEY").map(Secret::new),
            approval_monitor_enabled: env_parse("APPROVAL_MONITOR_ENABLED").unwrap_or(true),
            approval_monitor_interval_secs: env_parse("APPROVAL_MONITOR_INTERVAL")
                .filter(|&n: &u64| n > 0)
                .unwrap_or(15),
            expiry_sweep_enabled: env_parse("EXPIRY_SWEEP_ENABLED").unwrap_or(true),
            default_withdrawal_chain: env_string("WITHDRAWAL_DEFAULT_CHAIN")
                .unwrap_or_else(|| "BSC".into()),
        }
    }
}

impl Default for ChainsConfig {
    fn default() -> Self {
        let bsc_rpc_urls = {
            let urls = env_list("BSC_RPC_URLS");
            if urls.is_empty() {
                env_string("BSC_RPC_URL").map(|u| vec![u]).unwrap_or_default()
            } else {
                urls
            }
        };

        let tron_api_urls = {
            let urls = env_list("TRON_API_URLS");
            if urls.is_empty() {
                env_string("TRON_API_URL").map(|u| vec![u]).unwrap_or_default()
            } else {
                urls
            }
        };

        Self {
            tron_api_urls,
            trongrid_api_key: env_string("TRONGRID_API_KEY"),
            tron_usdt_contract: env_string("TRON_USDT_CONTRACT")
                .unwrap_or_else(|| "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into()),
            tron_fee_limit_sun: env_parse("TRON_FEE_LIMIT_SUN").unwrap_or(30_000_000),
            eth_rpc_urls: env_list("ETH_RPC_URLS"),
            bsc_rpc_urls,
            polygon_rpc_urls: env_list("POLYGON_RPC_URLS"),
            eth_usdt_contract: env_string("ETH_USDT_CONTRACT"),
            bsc_usdt_contract: env_string("BSC_USDT_CONTRACT"),
            polygon_usdt_contract: env_string("POLYGON_USDT_CONTRACT"),
            eth_usdt_decimals: env_parse("ETH_USDT_DECIMALS").filter(|&d: &u32| d > 0),
            bsc_usdt_decimals: env_parse("BSC_USDT_DECIMALS").filter(|&d: &u32| d > 0),
            polygon_usdt_decimals: env_parse("POLYGON_USDT_DECIMALS").filter(|&d: &u32| d > 0),
            rpc_timeout_secs: env_parse("RPC_TIMEOUT_SECS")
                .filter(|&n: &u64| n > 0 && n < 10)
                .unwrap_or(8),
            gas_optimize_enabled: env_parse("GAS_OPTIMIZE_ENABLED").unwrap_or(true),
        }
    }
}

impl GatewayConfig {
    /// 当前生效汇率：强制汇率 > 配置汇率 > 6.5
    pub fn effective_usdt_rate(&self) -> Decimal {
        if let Some(forced) = self.forced_usdt_rate.filter(|r| *r > Decimal::ZERO) {
            return forced;
        }
        if self.usdt_rate > Decimal::ZERO {
            return self.usdt_rate;
        }
        Decimal::new(65, 1)
    }

    pub fn has_merchant_key_map(&self) -> bool {
        !self.merchant_private_keys.is_empty()
    }
}

/// 解析 "addr=key,addr2=key2" 格式的私钥映射，地址统一小写
pub fn parse_key_map(raw: &str) -> HashMap<String, Secret> {
    let mut out = HashMap::new();
    for pair in split_and_trim(raw) {
        let Some((addr, key)) = pair.split_once('=') else {
            continue;
        };
        let addr = addr.trim().to_lowercase();
        let key = key.trim();
        if addr.is_empty() || key.is_empty() {
            continue;
        }
        out.insert(addr, Secret::new(key));
    }
    out
}

/// 解析64位hex主密钥
pub fn parse_master_key(hex_key: &str) -> Result<Zeroizing<[u8; 32]>> {
    let trimmed = hex_key.trim();
    if trimmed.len() != 64 {
        anyhow::bail!("auth_master_key must be 64 hex characters");
    }
    let bytes = Zeroizing::new(hex::decode(trimmed).context("auth_master_key is not valid hex")?);
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            gateway: GatewayConfig::default(),
            chains: ChainsConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        config.gateway.merchant_private_keys = config
            .gateway
            .merchant_private_keys
            .drain()
            .map(|(addr, key)| (addr.to_lowercase(), key))
            .collect();

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if let Some(master) = &self.gateway.auth_master_key {
            parse_master_key(master.expose())?;
        }

        if self.gateway.authorization_ttl_secs <= 0 {
            anyhow::bail!("AUTHORIZATION_TTL_SECS must be positive");
        }

        Ok(())
    }
}

//! 签名私钥解析
//!
//! 核心只依赖"按地址解析签名私钥"的能力，私钥只在进程内存中短暂存在，
//! 用完即清零，不落库、不打日志。

use std::collections::HashMap;

use ethers::signers::LocalWallet;
use zeroize::Zeroizing;

use crate::{
    config::{GatewayConfig, Secret},
    error::{GatewayError, GatewayResult},
};

/// 32字节 secp256k1 私钥（释放时清零）
pub struct SigningKeyMaterial {
    bytes: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKeyMaterial(***)")
    }
}

impl SigningKeyMaterial {
    /// 解析hex私钥（可带 0x 前缀）
    pub fn from_hex(hex_key: &str) -> GatewayResult<Self> {
        let trimmed = hex_key.trim().trim_start_matches("0x");
        let decoded = Zeroizing::new(
            hex::decode(trimmed)
                .map_err(|_| GatewayError::InvalidInput("private key is not valid hex".into()))?,
        );
        if decoded.len() != 32 {
            return Err(GatewayError::InvalidInput(
                "private key must be 32 bytes".into(),
            ));
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    /// TRON 本地签名使用
    pub fn to_k256(&self) -> GatewayResult<k256::ecdsa::SigningKey> {
        k256::ecdsa::SigningKey::from_slice(self.bytes.as_slice())
            .map_err(|_| GatewayError::InvalidInput("invalid secp256k1 private key".into()))
    }

    /// EVM 本地签名使用
    pub fn to_local_wallet(&self, chain_id: u64) -> GatewayResult<LocalWallet> {
        use ethers::signers::Signer;

        let wallet = LocalWallet::from_bytes(self.bytes.as_slice())
            .map_err(|_| GatewayError::InvalidInput("invalid secp256k1 private key".into()))?;
        Ok(wallet.with_chain_id(chain_id))
    }
}

/// 签名私钥解析能力
pub trait KeyResolver: Send + Sync {
    /// 解析收款钱包对应的签名私钥
    fn resolve(&self, address: &str) -> Option<SigningKeyMaterial>;

    /// 公司（中转）钱包私钥，用于提现出款
    fn company_key(&self) -> Option<SigningKeyMaterial>;

    fn has_key(&self, address: &str) -> bool {
        self.resolve(address).is_some()
    }
}

/// 基于启动配置的私钥表
pub struct ConfigKeyResolver {
    keys: HashMap<String, Secret>,
    fallback: Option<Secret>,
    company: Option<Secret>,
}

impl ConfigKeyResolver {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            keys: cfg.merchant_private_keys.clone(),
            fallback: cfg.merchant_private_key.clone().filter(|s| !s.is_empty()),
            company: cfg.company_private_key.clone().filter(|s| !s.is_empty()),
        }
    }

    fn parse(address: &str, secret: &Secret) -> Option<SigningKeyMaterial> {
        match SigningKeyMaterial::from_hex(secret.expose()) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "configured private key is malformed");
                None
            }
        }
    }
}

impl KeyResolver for ConfigKeyResolver {
    fn resolve(&self, address: &str) -> Option<SigningKeyMaterial> {
        let lower = address.trim().to_lowercase();
        if let Some(secret) = self.keys.get(&lower) {
            return Self::parse(address, secret);
        }
        self.fallback
            .as_ref()
            .and_then(|secret| Self::parse(address, secret))
    }

    fn company_key(&self) -> Option<SigningKeyMaterial> {
        self.company
            .as_ref()
            .and_then(|secret| Self::parse("company", secret))
    }
}

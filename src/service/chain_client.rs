//! 链客户端统一接口
//!
//! TRON 与 EVM 两个链族实现同一组能力，`ChainGateway` 按链配置中的链族一次性分派。

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    domain::chain_config::{ChainConfig, ChainFamily},
    error::GatewayResult,
    infrastructure::key_store::SigningKeyMaterial,
    utils::address_validator::AddressValidator,
};

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// 查询 USDT allowance(owner, spender)，返回十进制金额
    async fn query_allowance(
        &self,
        chain: &ChainConfig,
        owner: &str,
        spender: &str,
    ) -> GatewayResult<Decimal>;

    /// spender 以自己的私钥调用 transferFrom(from, to, amount)，返回交易哈希
    async fn transfer_from(
        &self,
        chain: &ChainConfig,
        spender: &str,
        key: &SigningKeyMaterial,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String>;

    /// 私钥持有地址直接 transfer(to, amount)，返回交易哈希
    async fn transfer(
        &self,
        chain: &ChainConfig,
        key: &SigningKeyMaterial,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String>;

    fn validate_address(&self, chain: &ChainConfig, address: &str) -> bool {
        AddressValidator::validate(chain.family, address)
    }
}

/// 按链族分派到具体客户端
pub struct ChainGateway {
    tron: Arc<dyn ChainClient>,
    evm: Arc<dyn ChainClient>,
}

impl ChainGateway {
    pub fn new(tron: Arc<dyn ChainClient>, evm: Arc<dyn ChainClient>) -> Self {
        Self { tron, evm }
    }

    fn client_for(&self, chain: &ChainConfig) -> &dyn ChainClient {
        match chain.family {
            ChainFamily::Tron => self.tron.as_ref(),
            ChainFamily::Evm => self.evm.as_ref(),
        }
    }
}

#[async_trait]
impl ChainClient for ChainGateway {
    async fn query_allowance(
        &self,
        chain: &ChainConfig,
        owner: &str,
        spender: &str,
    ) -> GatewayResult<Decimal> {
        self.client_for(chain)
            .query_allowance(chain, owner, spender)
            .await
    }

    async fn transfer_from(
        &self,
        chain: &ChainConfig,
        spender: &str,
        key: &SigningKeyMaterial,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        self.client_for(chain)
            .transfer_from(chain, spender, key, from, to, amount)
            .await
    }

    async fn transfer(
        &self,
        chain: &ChainConfig,
        key: &SigningKeyMaterial,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        self.client_for(chain).transfer(chain, key, to, amount).await
    }

    fn validate_address(&self, chain: &ChainConfig, address: &str) -> bool {
        self.client_for(chain).validate_address(chain, address)
    }
}

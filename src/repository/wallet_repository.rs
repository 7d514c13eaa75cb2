// 收款钱包 Repository

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{domain::settlement::PayoutWallet, error::GatewayResult};

#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// 列出指定链上启用的收款钱包（按 id 升序）
    async fn list_enabled(&self, chain: &str) -> GatewayResult<Vec<PayoutWallet>>;
}

pub struct PgWalletRepository {
    pool: PgPool,
}

impl PgWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletRepository for PgWalletRepository {
    async fn list_enabled(&self, chain: &str) -> GatewayResult<Vec<PayoutWallet>> {
        let rows = sqlx::query_as::<_, (i64, String, String, bool)>(
            "SELECT id, chain, address, enabled FROM payout_wallets
             WHERE chain = $1 AND enabled = TRUE ORDER BY id",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, chain, address, enabled)| PayoutWallet {
                id,
                chain,
                address,
                enabled,
            })
            .collect())
    }
}

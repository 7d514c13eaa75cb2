// 商户提现服务
// 审核通过即在同一事务内扣减账本余额，出款由公司钱包在后台转账，失败退回余额

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    config::GatewayConfig,
    domain::{
        chain_config::ChainRegistry,
        settlement::{NewWithdrawal, Withdrawal, WithdrawalStatus},
    },
    error::{GatewayError, GatewayResult},
    infrastructure::{
        event_bus::{publish_best_effort, EventBus, GatewayEvent},
        key_store::KeyResolver,
    },
    repository::LedgerRepository,
    service::chain_client::ChainClient,
    utils::id_generator::generate_withdraw_no,
};

const MAX_PAGE_SIZE: i64 = 100;

/// 提现分页结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WithdrawalPage {
    pub items: Vec<Withdrawal>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

pub struct WithdrawalService {
    ledger: Arc<dyn LedgerRepository>,
    chains: Arc<dyn ChainClient>,
    registry: Arc<ChainRegistry>,
    keys: Arc<dyn KeyResolver>,
    events: Arc<dyn EventBus>,
    config: Arc<GatewayConfig>,
}

impl WithdrawalService {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        chains: Arc<dyn ChainClient>,
        registry: Arc<ChainRegistry>,
        keys: Arc<dyn KeyResolver>,
        events: Arc<dyn EventBus>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            ledger,
            chains,
            registry,
            keys,
            events,
            config,
        }
    }

    /// 商户发起提现，chain 为空时使用默认提现链
    pub async fn request_withdrawal(
        &self,
        merchant_id: i64,
        amount: Decimal,
        to_wallet: &str,
        chain: Option<&str>,
    ) -> GatewayResult<Withdrawal> {
        if amount <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "withdrawal amount must be positive".into(),
            ));
        }
        let to_wallet = to_wallet.trim();
        if to_wallet.is_empty() {
            return Err(GatewayError::InvalidInput("target wallet is required".into()));
        }

        let chain_name = chain
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.default_withdrawal_chain);
        let chain = self.registry.get(chain_name)?;
        if !self.chains.validate_address(chain, to_wallet) {
            return Err(GatewayError::InvalidAddress(to_wallet.to_string()));
        }

        let merchant = self
            .ledger
            .find_merchant(merchant_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("merchant {}", merchant_id)))?;
        if merchant.balance < amount {
            return Err(GatewayError::InsufficientBalance);
        }

        let withdrawal = self
            .ledger
            .create_withdrawal(NewWithdrawal {
                withdraw_no: generate_withdraw_no(),
                merchant_id,
                amount,
                to_wallet: to_wallet.to_string(),
                chain: chain.name.clone(),
            })
            .await?;

        tracing::info!(
            withdraw_no = %withdrawal.withdraw_no,
            merchant_id,
            amount = %amount,
            chain = %withdrawal.chain,
            "withdrawal requested"
        );
        Ok(withdrawal)
    }

    async fn load(&self, withdraw_no: &str) -> GatewayResult<Withdrawal> {
        self.ledger
            .find_withdrawal(withdraw_no)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("withdrawal {}", withdraw_no)))
    }

    /// 审核通过：扣减余额后在后台出款
    pub async fn approve(self: &Arc<Self>, withdraw_no: &str, reviewer: &str) -> GatewayResult<Withdrawal> {
        let withdrawal = self.load(withdraw_no).await?;
        withdrawal.status.validate_transition(WithdrawalStatus::Approved)?;

        let merchant = self
            .ledger
            .find_merchant(withdrawal.merchant_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("merchant {}", withdrawal.merchant_id)))?;
        if merchant.balance < withdrawal.amount {
            return Err(GatewayError::InsufficientBalance);
        }

        let approved = self
            .ledger
            .approve_withdrawal(withdrawal.id, reviewer, Utc::now().timestamp())
            .await?;
        tracing::info!(
            withdraw_no = %approved.withdraw_no,
            reviewer = %reviewer,
            amount = %approved.amount,
            "withdrawal approved, ledger debited"
        );

        let service = Arc::clone(self);
        let payout = approved.clone();
        tokio::spawn(async move {
            service.execute_payout(&payout).await;
        });

        Ok(approved)
    }

    /// 拒绝待审核提现（余额未扣，无需退回）
    pub async fn reject(&self, withdraw_no: &str, reviewer: &str, reason: &str) -> GatewayResult<()> {
        let withdrawal = self.load(withdraw_no).await?;
        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is {}",
                withdraw_no,
                withdrawal.status.as_str()
            )));
        }

        self.ledger
            .reject_pending_withdrawal(withdrawal.id, reviewer, reason, Utc::now().timestamp())
            .await?;

        tracing::info!(withdraw_no = %withdraw_no, reviewer = %reviewer, "withdrawal rejected");
        publish_best_effort(
            self.events.as_ref(),
            GatewayEvent::WithdrawalRejected {
                withdraw_no: withdraw_no.to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn transfer_out(&self, withdrawal: &Withdrawal) -> GatewayResult<String> {
        let chain = self.registry.get(&withdrawal.chain)?;
        let key = self
            .keys
            .company_key()
            .ok_or_else(|| GatewayError::SigningKeyMissing("company wallet".into()))?;
        self.chains
            .transfer(chain, &key, &withdrawal.to_wallet, withdrawal.amount)
            .await
    }

    /// 公司钱包出款，失败时标记 Rejected 并退回余额，返回最终状态
    pub async fn execute_payout(&self, withdrawal: &Withdrawal) -> WithdrawalStatus {
        match self.transfer_out(withdrawal).await {
            Ok(tx_hash) => {
                if let Err(e) = self.ledger.complete_withdrawal(withdrawal.id, &tx_hash).await {
                    tracing::error!(
                        withdraw_no = %withdrawal.withdraw_no,
                        tx_hash = %tx_hash,
                        error = %e,
                        "failed to record completed withdrawal"
                    );
                    return WithdrawalStatus::Approved;
                }
                tracing::info!(
                    withdraw_no = %withdrawal.withdraw_no,
                    tx_hash = %tx_hash,
                    "withdrawal paid out"
                );
                publish_best_effort(
                    self.events.as_ref(),
                    GatewayEvent::WithdrawalCompleted {
                        withdraw_no: withdrawal.withdraw_no.clone(),
                        tx_hash,
                    },
                )
                .await;
                WithdrawalStatus::Completed
            }
            Err(e) => {
                let reason = format!("transfer failed: {}", e);
                tracing::warn!(
                    withdraw_no = %withdrawal.withdraw_no,
                    reason = %reason,
                    "withdrawal payout failed, re-crediting ledger"
                );
                if let Err(db_err) = self
                    .ledger
                    .reject_approved_withdrawal(withdrawal.id, &reason)
                    .await
                {
                    tracing::error!(
                        withdraw_no = %withdrawal.withdraw_no,
                        error = %db_err,
                        "failed to re-credit rejected withdrawal"
                    );
                    return WithdrawalStatus::Approved;
                }
                publish_best_effort(
                    self.events.as_ref(),
                    GatewayEvent::WithdrawalRejected {
                        withdraw_no: withdrawal.withdraw_no.clone(),
                        reason,
                    },
                )
                .await;
                WithdrawalStatus::Rejected
            }
        }
    }

    pub async fn get_withdrawal(&self, withdraw_no: &str) -> GatewayResult<Withdrawal> {
        self.load(withdraw_no).await
    }

    /// 商户提现记录，page 从 1 开始
    pub async fn list_withdrawals(
        &self,
        merchant_id: i64,
        page: i64,
        page_size: i64,
    ) -> GatewayResult<WithdrawalPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);
        let (items, total) = self
            .ledger
            .list_withdrawals(merchant_id, page_size, offset)
            .await?;
        Ok(WithdrawalPage {
            items,
            total,
            page,
            page_size,
        })
    }
}

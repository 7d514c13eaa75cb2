// 扣款与结算服务
// 准入（按授权加锁预占额度）同步完成，链上 transferFrom 在后台任务中执行

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    config::GatewayConfig,
    domain::{
        authorization::{Authorization, AuthorizationStatus, Deduction, DeductionStatus, NewDeduction},
        chain_config::{ChainConfig, ChainFamily, ChainRegistry},
    },
    error::{GatewayError, GatewayResult},
    infrastructure::{
        admission_lock::AdmissionLock,
        event_bus::{publish_best_effort, EventBus, GatewayEvent},
        key_store::KeyResolver,
    },
    repository::AuthorizationRepository,
    service::chain_client::ChainClient,
    utils::{amount::fiat_to_token, id_generator::generate_deduct_no},
};

const RESERVE_ATTEMPTS: usize = 3;

/// 扣款受理回执（链上结算尚未完成）
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeductionReceipt {
    pub deduct_no: String,
    pub amount_cny: Decimal,
    pub amount_usdt: Decimal,
    /// 预占后的剩余额度
    pub remaining_usdt: Decimal,
    pub status: DeductionStatus,
    pub customer_wallet: String,
}

pub struct DeductionService {
    auths: Arc<dyn AuthorizationRepository>,
    chains: Arc<dyn ChainClient>,
    registry: Arc<ChainRegistry>,
    keys: Arc<dyn KeyResolver>,
    events: Arc<dyn EventBus>,
    config: Arc<GatewayConfig>,
    admission: AdmissionLock,
}

impl DeductionService {
    pub fn new(
        auths: Arc<dyn AuthorizationRepository>,
        chains: Arc<dyn ChainClient>,
        registry: Arc<ChainRegistry>,
        keys: Arc<dyn KeyResolver>,
        events: Arc<dyn EventBus>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            auths,
            chains,
            registry,
            keys,
            events,
            config,
            admission: AdmissionLock::new(),
        }
    }

    /// 受理扣款：校验凭证、换算金额、原子预占额度，然后在后台执行链上结算
    pub async fn request_deduction(
        self: &Arc<Self>,
        password: &str,
        amount_cny: Decimal,
        product_info: &str,
        operator_id: &str,
    ) -> GatewayResult<DeductionReceipt> {
        let (auth, deduction, remaining) = self
            .admit(password, amount_cny, product_info, operator_id)
            .await?;

        let receipt = DeductionReceipt {
            deduct_no: deduction.deduct_no.clone(),
            amount_cny,
            amount_usdt: deduction.amount_usdt,
            remaining_usdt: remaining,
            status: DeductionStatus::Processing,
            customer_wallet: auth.customer_wallet.clone(),
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.execute_settlement(&auth, &deduction).await;
        });

        Ok(receipt)
    }

    /// 同步准入部分，锁只覆盖读取授权到写入 Processing 记录
    async fn admit(
        &self,
        password: &str,
        amount_cny: Decimal,
        product_info: &str,
        operator_id: &str,
    ) -> GatewayResult<(Authorization, Deduction, Decimal)> {
        if password.trim().is_empty() {
            return Err(GatewayError::InvalidCredential);
        }
        let amount_usdt = fiat_to_token(
            amount_cny,
            self.config.effective_usdt_rate(),
            self.config.token_amount_scale,
        )?;
        if amount_usdt <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "amount is below the smallest token unit".into(),
            ));
        }

        let auth = self
            .auths
            .find_by_password(password)
            .await?
            .ok_or(GatewayError::InvalidCredential)?;

        let _guard = self.admission.acquire(auth.id).await;

        // 取锁后重新读取，拿到其他扣款预占后的最新额度
        let auth = self
            .auths
            .find_by_auth_no(&auth.auth_no)
            .await?
            .filter(|a| a.status == AuthorizationStatus::Active)
            .ok_or(GatewayError::InvalidCredential)?;

        let now = Utc::now().timestamp();
        if auth.is_expired_at(now) {
            self.auths
                .update_status(auth.id, AuthorizationStatus::Active, AuthorizationStatus::Expired)
                .await?;
            return Err(GatewayError::Expired(auth.auth_no));
        }
        if amount_usdt > auth.remaining_usdt {
            return Err(GatewayError::InsufficientQuota {
                remaining: auth.remaining_usdt,
                requested: amount_usdt,
            });
        }

        let mut attempt = 0;
        let (deduction, remaining) = loop {
            attempt += 1;
            let params = NewDeduction {
                deduct_no: generate_deduct_no(),
                auth_id: auth.id,
                auth_no: auth.auth_no.clone(),
                password: password.to_string(),
                amount_usdt,
                amount_cny,
                product_info: product_info.to_string(),
                operator_id: operator_id.to_string(),
                deduct_time: now,
            };
            match self.auths.reserve_deduction(params).await {
                Ok(reserved) => break reserved,
                Err(e) if attempt < RESERVE_ATTEMPTS && e.is_duplicate() => {
                    tracing::debug!(attempt, auth_no = %auth.auth_no, "deduction number collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        };

        tracing::info!(
            deduct_no = %deduction.deduct_no,
            auth_no = %auth.auth_no,
            amount_cny = %amount_cny,
            amount_usdt = %amount_usdt,
            remaining = %remaining,
            "deduction admitted"
        );
        Ok((auth, deduction, remaining))
    }

    /// 资金去向：与授权同链族的公司钱包，未配置或格式不符时直接进商户钱包
    fn settlement_target(&self, chain: &ChainConfig, auth: &Authorization) -> String {
        let custodial = match chain.family {
            ChainFamily::Evm => self.config.company_wallet.as_deref(),
            ChainFamily::Tron => self.config.company_tron_wallet.as_deref(),
        };
        match custodial.map(str::trim).filter(|w| !w.is_empty()) {
            Some(wallet) if self.chains.validate_address(chain, wallet) => wallet.to_string(),
            Some(wallet) => {
                tracing::warn!(
                    chain = %chain.name,
                    wallet = %wallet,
                    "company wallet is not valid for chain, settling to merchant wallet"
                );
                auth.merchant_wallet.clone()
            }
            None => auth.merchant_wallet.clone(),
        }
    }

    async fn pull_funds(&self, auth: &Authorization, deduction: &Deduction) -> GatewayResult<String> {
        let chain = self.registry.get(&auth.chain)?;
        let key = self
            .keys
            .resolve(&auth.merchant_wallet)
            .ok_or_else(|| GatewayError::SigningKeyMissing(auth.merchant_wallet.clone()))?;
        let target = self.settlement_target(chain, auth);

        self.chains
            .transfer_from(
                chain,
                &auth.merchant_wallet,
                &key,
                &auth.customer_wallet,
                &target,
                deduction.amount_usdt,
            )
            .await
    }

    /// 执行链上结算并落账，错误只记录在扣款记录上，返回最终状态
    pub async fn execute_settlement(
        &self,
        auth: &Authorization,
        deduction: &Deduction,
    ) -> DeductionStatus {
        match self.pull_funds(auth, deduction).await {
            Ok(tx_hash) => {
                match self
                    .auths
                    .complete_deduction(deduction.id, &tx_hash, self.config.depletion_epsilon)
                    .await
                {
                    Ok(outcome) => {
                        if !outcome.merchant_credited {
                            tracing::warn!(
                                deduct_no = %deduction.deduct_no,
                                merchant_wallet = %auth.merchant_wallet,
                                "no merchant linked to payout wallet, ledger not credited"
                            );
                        }
                        tracing::info!(
                            deduct_no = %deduction.deduct_no,
                            tx_hash = %tx_hash,
                            remaining = %outcome.remaining_usdt,
                            depleted = outcome.depleted,
                            "deduction settled"
                        );
                        publish_best_effort(
                            self.events.as_ref(),
                            GatewayEvent::DeductionSucceeded {
                                deduct_no: deduction.deduct_no.clone(),
                                auth_no: deduction.auth_no.clone(),
                                amount_usdt: deduction.amount_usdt,
                                tx_hash,
                                depleted: outcome.depleted,
                            },
                        )
                        .await;
                        if outcome.depleted {
                            publish_best_effort(
                                self.events.as_ref(),
                                GatewayEvent::AuthorizationClosed {
                                    auth_no: deduction.auth_no.clone(),
                                    status: AuthorizationStatus::Depleted.as_str().to_string(),
                                },
                            )
                            .await;
                        }
                        DeductionStatus::Success
                    }
                    Err(e) => {
                        // 链上已成功但落账失败，记录保持 Processing 等待人工对账
                        tracing::error!(
                            deduct_no = %deduction.deduct_no,
                            tx_hash = %tx_hash,
                            error = %e,
                            "failed to record settled deduction"
                        );
                        DeductionStatus::Processing
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    deduct_no = %deduction.deduct_no,
                    auth_no = %deduction.auth_no,
                    reason = %reason,
                    "deduction settlement failed"
                );
                let outcome = match self
                    .auths
                    .fail_deduction(deduction.id, &reason, self.config.depletion_epsilon)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(db_err) => {
                        tracing::error!(
                            deduct_no = %deduction.deduct_no,
                            error = %db_err,
                            "failed to record deduction failure"
                        );
                        return DeductionStatus::Processing;
                    }
                };
                publish_best_effort(
                    self.events.as_ref(),
                    GatewayEvent::DeductionFailed {
                        deduct_no: deduction.deduct_no.clone(),
                        auth_no: deduction.auth_no.clone(),
                        reason,
                    },
                )
                .await;
                if outcome.depleted {
                    tracing::info!(
                        auth_no = %deduction.auth_no,
                        remaining = %outcome.remaining_usdt,
                        "authorization depleted after last in-flight deduction failed"
                    );
                    publish_best_effort(
                        self.events.as_ref(),
                        GatewayEvent::AuthorizationClosed {
                            auth_no: deduction.auth_no.clone(),
                            status: AuthorizationStatus::Depleted.as_str().to_string(),
                        },
                    )
                    .await;
                }
                DeductionStatus::Failed
            }
        }
    }

    pub async fn get_deduction(&self, deduct_no: &str) -> GatewayResult<Deduction> {
        self.auths
            .find_deduction(deduct_no)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("deduction {}", deduct_no)))
    }

    pub fn admission_shards(&self) -> usize {
        self.admission.shard_count()
    }
}

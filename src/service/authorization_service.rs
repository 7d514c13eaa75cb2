// 授权生命周期服务
// 创建 → 确认（手动 / 自动 allowance 校验）→ 撤销 / 过期 / 用尽

use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    config::GatewayConfig,
    domain::{
        authorization::{Authorization, AuthorizationStatus, Deduction, NewAuthorization, SealedPassword},
        chain_config::{ChainConfig, ChainRegistry},
    },
    error::{GatewayError, GatewayResult},
    infrastructure::{
        encryption::{constant_time_eq, CredentialVault},
        event_bus::{publish_best_effort, EventBus, GatewayEvent},
        key_store::KeyResolver,
    },
    repository::{AuthorizationRepository, WalletRepository},
    service::chain_client::ChainClient,
    utils::id_generator::{generate_access_password, generate_auth_no},
};

/// 单号 / 密码冲突时的最大重试次数
const CREATE_ATTEMPTS: usize = 3;
/// 列表查询上限
const LIST_LIMIT: i64 = 500;

/// 创建授权请求
#[derive(Debug, Clone, Default)]
pub struct CreateAuthorizationRequest {
    pub amount_usdt: Decimal,
    /// 链名称，空字符串为 TRON
    pub chain: String,
    pub table_no: String,
    pub customer_name: String,
    pub remark: String,
}

/// 创建授权返回给前台的凭证
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizationTicket {
    pub auth_no: String,
    pub password: String,
    pub amount_usdt: Decimal,
    pub merchant_wallet: String,
    pub expire_time: i64,
    pub auth_url: String,
    pub chain: String,
}

/// 自动确认结果
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AutoConfirmStatus {
    /// pending 或 active
    pub status: AuthorizationStatus,
    pub authorized_usdt: Decimal,
    pub allowance_usdt: Decimal,
}

pub struct AuthorizationService {
    auths: Arc<dyn AuthorizationRepository>,
    wallets: Arc<dyn WalletRepository>,
    chains: Arc<dyn ChainClient>,
    registry: Arc<ChainRegistry>,
    keys: Arc<dyn KeyResolver>,
    vault: Option<Arc<CredentialVault>>,
    events: Arc<dyn EventBus>,
    config: Arc<GatewayConfig>,
}

impl AuthorizationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auths: Arc<dyn AuthorizationRepository>,
        wallets: Arc<dyn WalletRepository>,
        chains: Arc<dyn ChainClient>,
        registry: Arc<ChainRegistry>,
        keys: Arc<dyn KeyResolver>,
        vault: Option<Arc<CredentialVault>>,
        events: Arc<dyn EventBus>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            auths,
            wallets,
            chains,
            registry,
            keys,
            vault,
            events,
            config,
        }
    }

    /// 创建授权：随机选取一个可签名的收款钱包，状态 Pending
    pub async fn create_authorization(
        &self,
        req: CreateAuthorizationRequest,
    ) -> GatewayResult<AuthorizationTicket> {
        if req.amount_usdt <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "authorized amount must be positive".into(),
            ));
        }
        let chain = self.registry.get(&req.chain)?;

        let merchant_wallet = self.pick_payout_wallet(chain).await?;
        let expire_time = Utc::now().timestamp() + self.config.authorization_ttl_secs;

        let mut attempt = 0;
        let auth = loop {
            attempt += 1;
            let params = NewAuthorization {
                auth_no: generate_auth_no(),
                password: generate_access_password(),
                merchant_wallet: merchant_wallet.clone(),
                chain: chain.name.clone(),
                authorized_usdt: req.amount_usdt,
                table_no: req.table_no.clone(),
                customer_name: req.customer_name.clone(),
                remark: req.remark.clone(),
                expire_time,
            };
            match self.auths.create(params).await {
                Ok(auth) => break auth,
                Err(e) if attempt < CREATE_ATTEMPTS && e.is_duplicate() => {
                    tracing::debug!(attempt, "authorization number collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        };

        tracing::info!(
            auth_no = %auth.auth_no,
            chain = %auth.chain,
            merchant_wallet = %auth.merchant_wallet,
            amount = %auth.authorized_usdt,
            "authorization created"
        );
        publish_best_effort(
            self.events.as_ref(),
            GatewayEvent::AuthorizationCreated {
                auth_no: auth.auth_no.clone(),
                chain: auth.chain.clone(),
                merchant_wallet: auth.merchant_wallet.clone(),
                authorized_usdt: auth.authorized_usdt,
            },
        )
        .await;

        Ok(AuthorizationTicket {
            auth_url: self.auth_url(&auth.auth_no),
            auth_no: auth.auth_no,
            password: auth.password,
            amount_usdt: auth.authorized_usdt,
            merchant_wallet: auth.merchant_wallet,
            expire_time: auth.expire_time,
            chain: auth.chain,
        })
    }

    async fn pick_payout_wallet(&self, chain: &ChainConfig) -> GatewayResult<String> {
        let candidates: Vec<String> = self
            .wallets
            .list_enabled(&chain.name)
            .await?
            .into_iter()
            .map(|w| w.address)
            .filter(|addr| self.chains.validate_address(chain, addr) && self.keys.has_key(addr))
            .collect();

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| GatewayError::NoWalletAvailable(chain.name.clone()))
    }

    fn auth_url(&self, auth_no: &str) -> String {
        format!("{}/auth/{}", self.config.app_uri.trim_end_matches('/'), auth_no)
    }

    async fn load(&self, auth_no: &str) -> GatewayResult<Authorization> {
        self.auths
            .find_by_auth_no(auth_no)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("authorization {}", auth_no)))
    }

    /// 激活时用客户钱包绑定加密访问密码，未配置主密钥时跳过
    async fn seal_for(&self, password: &str, customer_wallet: &str) -> GatewayResult<Option<SealedPassword>> {
        let Some(vault) = self.vault.clone() else {
            return Ok(None);
        };
        let password = password.to_string();
        let binding = customer_wallet.to_string();
        let sealed = tokio::task::spawn_blocking(move || vault.seal(&password, &binding))
            .await
            .map_err(|e| anyhow::anyhow!("seal task panicked: {}", e))??;
        Ok(Some(sealed))
    }

    /// 运营人工确认：仅 Pending 可确认，不做链上校验
    pub async fn confirm_manual(
        &self,
        auth_no: &str,
        customer_wallet: &str,
        tx_hash: &str,
    ) -> GatewayResult<()> {
        let auth = self.load(auth_no).await?;
        if auth.status != AuthorizationStatus::Pending {
            return Err(GatewayError::InvalidState(format!(
                "authorization {} is {}",
                auth_no,
                auth.status.as_str()
            )));
        }
        if customer_wallet.trim().is_empty() {
            return Err(GatewayError::InvalidInput("customer wallet is required".into()));
        }

        let sealed = self.seal_for(&auth.password, customer_wallet).await?;
        let tx_hash = Some(tx_hash).filter(|h| !h.is_empty());
        let activated = self
            .auths
            .activate(
                auth.id,
                customer_wallet,
                tx_hash,
                Utc::now().timestamp(),
                sealed.as_ref(),
            )
            .await?;
        if !activated {
            return Err(GatewayError::InvalidState(format!(
                "authorization {} changed state concurrently",
                auth_no
            )));
        }

        tracing::info!(auth_no = %auth_no, customer_wallet = %customer_wallet, "authorization confirmed manually");
        publish_best_effort(
            self.events.as_ref(),
            GatewayEvent::AuthorizationActivated {
                auth_no: auth_no.to_string(),
                customer_wallet: customer_wallet.to_string(),
                manual: true,
            },
        )
        .await;
        Ok(())
    }

    /// 链上 allowance 自动确认，可重复调用
    pub async fn confirm_auto(
        &self,
        auth_no: &str,
        customer_wallet: &str,
    ) -> GatewayResult<AutoConfirmStatus> {
        let auth = self.load(auth_no).await?;

        if auth.status == AuthorizationStatus::Active {
            return Ok(AutoConfirmStatus {
                status: AuthorizationStatus::Active,
                authorized_usdt: auth.authorized_usdt,
                allowance_usdt: auth.authorized_usdt,
            });
        }

        let now = Utc::now().timestamp();
        if auth.is_expired_at(now) {
            if auth.status == AuthorizationStatus::Pending {
                self.auths
                    .update_status(auth.id, AuthorizationStatus::Pending, AuthorizationStatus::Expired)
                    .await?;
            }
            return Err(GatewayError::Expired(auth_no.to_string()));
        }
        if auth.status != AuthorizationStatus::Pending {
            return Err(GatewayError::InvalidState(format!(
                "authorization {} is {}",
                auth_no,
                auth.status.as_str()
            )));
        }

        let chain = self.registry.get(&auth.chain)?;
        if !self.chains.validate_address(chain, customer_wallet) {
            return Err(GatewayError::InvalidAddress(customer_wallet.to_string()));
        }

        let allowance = self
            .chains
            .query_allowance(chain, customer_wallet, &auth.merchant_wallet)
            .await?;

        if allowance < auth.authorized_usdt {
            if auth.customer_wallet != customer_wallet {
                self.auths.bind_customer_wallet(auth.id, customer_wallet).await?;
            }
            tracing::debug!(auth_no = %auth_no, allowance = %allowance, "allowance below authorized amount");
            return Ok(AutoConfirmStatus {
                status: AuthorizationStatus::Pending,
                authorized_usdt: auth.authorized_usdt,
                allowance_usdt: allowance,
            });
        }

        let sealed = self.seal_for(&auth.password, customer_wallet).await?;
        let activated = self
            .auths
            .activate(auth.id, customer_wallet, None, now, sealed.as_ref())
            .await?;
        if !activated {
            // 查询 allowance 期间状态被并发修改
            let current = self.load(auth_no).await?;
            if current.status != AuthorizationStatus::Active {
                return Err(GatewayError::InvalidState(format!(
                    "authorization {} is {}",
                    auth_no,
                    current.status.as_str()
                )));
            }
            return Ok(AutoConfirmStatus {
                status: AuthorizationStatus::Active,
                authorized_usdt: current.authorized_usdt,
                allowance_usdt: allowance,
            });
        }

        tracing::info!(
            auth_no = %auth_no,
            customer_wallet = %customer_wallet,
            allowance = %allowance,
            "authorization activated by on-chain allowance"
        );
        publish_best_effort(
            self.events.as_ref(),
            GatewayEvent::AuthorizationActivated {
                auth_no: auth_no.to_string(),
                customer_wallet: customer_wallet.to_string(),
                manual: false,
            },
        )
        .await;

        Ok(AutoConfirmStatus {
            status: AuthorizationStatus::Active,
            authorized_usdt: auth.authorized_usdt,
            allowance_usdt: allowance,
        })
    }

    /// 撤销 Pending / Active 授权
    pub async fn revoke(&self, auth_no: &str) -> GatewayResult<()> {
        let auth = self.load(auth_no).await?;
        auth.status.validate_transition(AuthorizationStatus::Revoked)?;

        if !self
            .auths
            .update_status(auth.id, auth.status, AuthorizationStatus::Revoked)
            .await?
        {
            return Err(GatewayError::InvalidState(format!(
                "authorization {} changed state concurrently",
                auth_no
            )));
        }

        tracing::info!(auth_no = %auth_no, from = auth.status.as_str(), "authorization revoked");
        publish_best_effort(
            self.events.as_ref(),
            GatewayEvent::AuthorizationClosed {
                auth_no: auth_no.to_string(),
                status: AuthorizationStatus::Revoked.as_str().to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn get_active(&self) -> GatewayResult<Vec<Authorization>> {
        self.auths
            .list_by_status(AuthorizationStatus::Active, LIST_LIMIT)
            .await
    }

    pub async fn list_pending(&self) -> GatewayResult<Vec<Authorization>> {
        self.auths
            .list_by_status(AuthorizationStatus::Pending, LIST_LIMIT)
            .await
    }

    /// 按访问密码查询有效授权，读取时过期即落库为 Expired
    pub async fn get_by_password(&self, password: &str) -> GatewayResult<Authorization> {
        let auth = self
            .auths
            .find_by_password(password)
            .await?
            .filter(|a| a.status == AuthorizationStatus::Active)
            .ok_or(GatewayError::InvalidCredential)?;

        if auth.is_expired_at(Utc::now().timestamp()) {
            self.auths
                .update_status(auth.id, AuthorizationStatus::Active, AuthorizationStatus::Expired)
                .await?;
            return Err(GatewayError::Expired(auth.auth_no));
        }
        Ok(auth)
    }

    pub async fn get_by_auth_no(&self, auth_no: &str) -> GatewayResult<Authorization> {
        self.load(auth_no).await
    }

    pub async fn deduction_history(&self, password: &str) -> GatewayResult<Vec<Deduction>> {
        self.auths
            .list_deductions_by_password(password, LIST_LIMIT)
            .await
    }

    pub async fn list_deductions(&self, auth_no: &str) -> GatewayResult<Vec<Deduction>> {
        let auth = self.load(auth_no).await?;
        self.auths.list_deductions_by_auth(auth.id).await
    }

    /// 校验访问密码：已加密保存时解密后常量时间比较，否则直接常量时间比较明文
    pub async fn verify_password(&self, auth: &Authorization, candidate: &str) -> GatewayResult<bool> {
        match (&auth.sealed_password, &self.vault) {
            (Some(sealed), Some(vault)) => {
                let vault = vault.clone();
                let sealed = sealed.clone();
                let binding = auth.customer_wallet.clone();
                let candidate = candidate.to_string();
                let ok = tokio::task::spawn_blocking(move || vault.verify(&sealed, &binding, &candidate))
                    .await
                    .map_err(|e| anyhow::anyhow!("verify task panicked: {}", e))?;
                Ok(ok)
            }
            (Some(_), None) => Err(GatewayError::DecryptionFailed),
            (None, _) => Ok(constant_time_eq(auth.password.as_bytes(), candidate.as_bytes())),
        }
    }

    /// 为已绑定客户钱包但尚未加密的授权补写密文，返回处理条数
    pub async fn seal_password_backlog(&self, batch: i64) -> GatewayResult<usize> {
        if self.vault.is_none() {
            return Err(GatewayError::InvalidInput(
                "auth_master_key is not configured".into(),
            ));
        }

        let mut sealed_count = 0;
        for auth in self.auths.list_unsealed(batch).await? {
            if let Some(sealed) = self.seal_for(&auth.password, &auth.customer_wallet).await? {
                self.auths.set_sealed_password(auth.id, &sealed).await?;
                sealed_count += 1;
            }
        }
        Ok(sealed_count)
    }

    /// 将过期的 Pending / Active 授权落库为 Expired
    pub async fn expire_overdue(&self) -> GatewayResult<u64> {
        let expired = self.auths.expire_overdue(Utc::now().timestamp()).await?;
        if expired > 0 {
            tracing::info!(count = expired, "authorizations expired");
        }
        Ok(expired)
    }
}

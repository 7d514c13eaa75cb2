//! 内存存储实现（测试与本地开发）
//!
//! 所有表共用一把写锁，多行写操作与 Postgres 事务具有相同的原子语义。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::{
    domain::{
        authorization::{
            Authorization, AuthorizationStatus, Deduction, DeductionStatus, NewAuthorization,
            NewDeduction, SealedPassword, SettlementOutcome,
        },
        settlement::{Merchant, NewWithdrawal, PayoutWallet, Withdrawal, WithdrawalStatus},
    },
    error::{GatewayError, GatewayResult},
    repository::{AuthorizationRepository, LedgerRepository, WalletRepository},
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    authorizations: HashMap<i64, Authorization>,
    deductions: HashMap<i64, Deduction>,
    merchants: HashMap<i64, Merchant>,
    withdrawals: HashMap<i64, Withdrawal>,
    wallets: Vec<PayoutWallet>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn auth_mut(&mut self, auth_id: i64) -> GatewayResult<&mut Authorization> {
        self.authorizations
            .get_mut(&auth_id)
            .ok_or_else(|| GatewayError::NotFound(format!("authorization {}", auth_id)))
    }

    fn withdrawal_mut(&mut self, withdrawal_id: i64) -> GatewayResult<&mut Withdrawal> {
        self.withdrawals
            .get_mut(&withdrawal_id)
            .ok_or_else(|| GatewayError::NotFound(format!("withdrawal {}", withdrawal_id)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记收款钱包
    pub async fn add_payout_wallet(&self, chain: &str, address: &str) -> i64 {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.wallets.push(PayoutWallet {
            id,
            chain: chain.to_string(),
            address: address.to_string(),
            enabled: true,
        });
        id
    }

    /// 登记商户，wallet_token 为其关联的收款钱包
    pub async fn add_merchant(&self, name: &str, wallet_token: &str, balance: Decimal) -> i64 {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.merchants.insert(
            id,
            Merchant {
                id,
                merchant_name: name.to_string(),
                wallet_token: wallet_token.to_string(),
                balance,
            },
        );
        id
    }

    /// 调整授权过期时间
    pub async fn set_expire_time(&self, auth_no: &str, expire_time: i64) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let auth = state
            .authorizations
            .values_mut()
            .find(|a| a.auth_no == auth_no)
            .ok_or_else(|| GatewayError::NotFound(auth_no.to_string()))?;
        auth.expire_time = expire_time;
        Ok(())
    }
}

fn newest_first<T, F: Fn(&T) -> i64>(items: &mut [T], key: F) {
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
}

#[async_trait]
impl AuthorizationRepository for MemoryStore {
    async fn create(&self, params: NewAuthorization) -> GatewayResult<Authorization> {
        let mut state = self.state.write().await;
        if state
            .authorizations
            .values()
            .any(|a| a.auth_no == params.auth_no || a.password == params.password)
        {
            return Err(GatewayError::InvalidInput(
                "duplicate authorization number or password".into(),
            ));
        }

        let id = state.next_id();
        let now = Utc::now();
        let auth = Authorization {
            id,
            auth_no: params.auth_no,
            password: params.password,
            sealed_password: None,
            customer_wallet: String::new(),
            merchant_wallet: params.merchant_wallet,
            chain: params.chain,
            authorized_usdt: params.authorized_usdt,
            used_usdt: Decimal::ZERO,
            remaining_usdt: params.authorized_usdt,
            status: AuthorizationStatus::Pending,
            table_no: params.table_no,
            customer_name: params.customer_name,
            remark: params.remark,
            tx_hash: None,
            authorize_time: None,
            expire_time: params.expire_time,
            created_at: now,
            updated_at: now,
        };
        state.authorizations.insert(id, auth.clone());
        Ok(auth)
    }

    async fn find_by_auth_no(&self, auth_no: &str) -> GatewayResult<Option<Authorization>> {
        let state = self.state.read().await;
        Ok(state
            .authorizations
            .values()
            .find(|a| a.auth_no == auth_no)
            .cloned())
    }

    async fn find_by_password(&self, password: &str) -> GatewayResult<Option<Authorization>> {
        let state = self.state.read().await;
        Ok(state
            .authorizations
            .values()
            .find(|a| a.password == password)
            .cloned())
    }

    async fn list_by_status(
        &self,
        status: AuthorizationStatus,
        limit: i64,
    ) -> GatewayResult<Vec<Authorization>> {
        let state = self.state.read().await;
        let mut items: Vec<Authorization> = state
            .authorizations
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        newest_first(&mut items, |a| a.id);
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn bind_customer_wallet(&self, auth_id: i64, customer_wallet: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let auth = state.auth_mut(auth_id)?;
        if auth.status == AuthorizationStatus::Pending {
            auth.customer_wallet = customer_wallet.to_string();
            auth.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn activate(
        &self,
        auth_id: i64,
        customer_wallet: &str,
        tx_hash: Option<&str>,
        authorize_time: i64,
        sealed: Option<&SealedPassword>,
    ) -> GatewayResult<bool> {
        let mut state = self.state.write().await;
        let auth = state.auth_mut(auth_id)?;
        if auth.status != AuthorizationStatus::Pending {
            return Ok(false);
        }
        auth.status = AuthorizationStatus::Active;
        auth.customer_wallet = customer_wallet.to_string();
        if let Some(hash) = tx_hash {
            auth.tx_hash = Some(hash.to_string());
        }
        auth.authorize_time = Some(authorize_time);
        if let Some(sealed) = sealed {
            auth.sealed_password = Some(sealed.clone());
        }
        auth.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_status(
        &self,
        auth_id: i64,
        from: AuthorizationStatus,
        to: AuthorizationStatus,
    ) -> GatewayResult<bool> {
        from.validate_transition(to)?;
        let mut state = self.state.write().await;
        let auth = state.auth_mut(auth_id)?;
        if auth.status != from {
            return Ok(false);
        }
        auth.status = to;
        auth.updated_at = Utc::now();
        Ok(true)
    }

    async fn expire_overdue(&self, now: i64) -> GatewayResult<u64> {
        let mut state = self.state.write().await;
        let mut expired = 0;
        for auth in state.authorizations.values_mut() {
            let open = matches!(
                auth.status,
                AuthorizationStatus::Pending | AuthorizationStatus::Active
            );
            if open && auth.is_expired_at(now) {
                auth.status = AuthorizationStatus::Expired;
                auth.updated_at = Utc::now();
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_unsealed(&self, limit: i64) -> GatewayResult<Vec<Authorization>> {
        let state = self.state.read().await;
        let mut items: Vec<Authorization> = state
            .authorizations
            .values()
            .filter(|a| a.sealed_password.is_none() && !a.customer_wallet.is_empty())
            .cloned()
            .collect();
        items.sort_by_key(|a| a.id);
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn set_sealed_password(
        &self,
        auth_id: i64,
        sealed: &SealedPassword,
    ) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let auth = state.auth_mut(auth_id)?;
        auth.sealed_password = Some(sealed.clone());
        auth.updated_at = Utc::now();
        Ok(())
    }

    async fn reserve_deduction(&self, params: NewDeduction) -> GatewayResult<(Deduction, Decimal)> {
        if params.amount_usdt <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "deduction amount must be positive".into(),
            ));
        }

        let mut state = self.state.write().await;
        if state
            .deductions
            .values()
            .any(|d| d.deduct_no == params.deduct_no)
        {
            return Err(GatewayError::InvalidInput("duplicate deduction number".into()));
        }

        let auth = state
            .authorizations
            .get_mut(&params.auth_id)
            .ok_or(GatewayError::InvalidCredential)?;
        if auth.status != AuthorizationStatus::Active {
            return Err(GatewayError::InvalidState(format!(
                "authorization {} is not active",
                auth.auth_no
            )));
        }
        if auth.remaining_usdt < params.amount_usdt {
            return Err(GatewayError::InsufficientQuota {
                remaining: auth.remaining_usdt,
                requested: params.amount_usdt,
            });
        }
        auth.used_usdt += params.amount_usdt;
        auth.remaining_usdt -= params.amount_usdt;
        auth.updated_at = Utc::now();
        let remaining = auth.remaining_usdt;

        let id = state.next_id();
        let deduction = Deduction {
            id,
            deduct_no: params.deduct_no,
            auth_id: params.auth_id,
            auth_no: params.auth_no,
            password: params.password,
            amount_usdt: params.amount_usdt,
            amount_cny: params.amount_cny,
            tx_hash: None,
            status: DeductionStatus::Processing,
            fail_reason: None,
            product_info: params.product_info,
            operator_id: params.operator_id,
            deduct_time: params.deduct_time,
            created_at: Utc::now(),
        };
        state.deductions.insert(id, deduction.clone());
        Ok((deduction, remaining))
    }

    async fn complete_deduction(
        &self,
        deduction_id: i64,
        tx_hash: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        let mut state = self.state.write().await;

        let (auth_id, amount) = match state.deductions.get(&deduction_id) {
            Some(d) if d.status == DeductionStatus::Processing => (d.auth_id, d.amount_usdt),
            _ => {
                return Err(GatewayError::InvalidState(format!(
                    "deduction {} is not processing",
                    deduction_id
                )))
            }
        };
        let in_flight = state
            .deductions
            .values()
            .filter(|d| {
                d.auth_id == auth_id && d.id != deduction_id && d.status == DeductionStatus::Processing
            })
            .count();

        let auth = state.auth_mut(auth_id)?;
        let remaining = auth.remaining_usdt;
        let merchant_wallet = auth.merchant_wallet.to_lowercase();
        let depleted = remaining <= depletion_epsilon
            && in_flight == 0
            && auth.status == AuthorizationStatus::Active;
        if depleted {
            auth.status = AuthorizationStatus::Depleted;
            auth.updated_at = Utc::now();
        }

        let merchant_id = state
            .merchants
            .values()
            .filter(|m| m.wallet_token.to_lowercase() == merchant_wallet)
            .map(|m| m.id)
            .min();
        if let Some(merchant) = merchant_id.and_then(|id| state.merchants.get_mut(&id)) {
            merchant.balance += amount;
        }

        if let Some(deduction) = state.deductions.get_mut(&deduction_id) {
            deduction.status = DeductionStatus::Success;
            deduction.tx_hash = Some(tx_hash.to_string());
        }

        Ok(SettlementOutcome {
            remaining_usdt: remaining,
            depleted,
            merchant_credited: merchant_id.is_some(),
        })
    }

    async fn fail_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        let mut state = self.state.write().await;

        let (auth_id, amount) = match state.deductions.get_mut(&deduction_id) {
            Some(d) if d.status == DeductionStatus::Processing => {
                d.status = DeductionStatus::Failed;
                d.fail_reason = Some(reason.to_string());
                (d.auth_id, d.amount_usdt)
            }
            _ => {
                return Err(GatewayError::InvalidState(format!(
                    "deduction {} is not processing",
                    deduction_id
                )))
            }
        };

        let siblings = state.deductions.values().filter(|d| d.auth_id == auth_id);
        let in_flight = siblings
            .clone()
            .any(|d| d.status == DeductionStatus::Processing);
        let settled = siblings
            .clone()
            .any(|d| d.status == DeductionStatus::Success);

        let auth = state.auth_mut(auth_id)?;
        auth.used_usdt -= amount;
        auth.remaining_usdt += amount;
        auth.updated_at = Utc::now();

        let depleted = auth.remaining_usdt <= depletion_epsilon
            && !in_flight
            && settled
            && auth.status == AuthorizationStatus::Active;
        if depleted {
            auth.status = AuthorizationStatus::Depleted;
        }

        Ok(SettlementOutcome {
            remaining_usdt: auth.remaining_usdt,
            depleted,
            merchant_credited: false,
        })
    }

    async fn find_deduction(&self, deduct_no: &str) -> GatewayResult<Option<Deduction>> {
        let state = self.state.read().await;
        Ok(state
            .deductions
            .values()
            .find(|d| d.deduct_no == deduct_no)
            .cloned())
    }

    async fn list_deductions_by_password(
        &self,
        password: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Deduction>> {
        let state = self.state.read().await;
        let mut items: Vec<Deduction> = state
            .deductions
            .values()
            .filter(|d| d.password == password)
            .cloned()
            .collect();
        newest_first(&mut items, |d| d.id);
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn list_deductions_by_auth(&self, auth_id: i64) -> GatewayResult<Vec<Deduction>> {
        let state = self.state.read().await;
        let mut items: Vec<Deduction> = state
            .deductions
            .values()
            .filter(|d| d.auth_id == auth_id)
            .cloned()
            .collect();
        newest_first(&mut items, |d| d.id);
        Ok(items)
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn find_merchant(&self, merchant_id: i64) -> GatewayResult<Option<Merchant>> {
        let state = self.state.read().await;
        Ok(state.merchants.get(&merchant_id).cloned())
    }

    async fn find_merchant_by_wallet(&self, wallet: &str) -> GatewayResult<Option<Merchant>> {
        let state = self.state.read().await;
        let wallet = wallet.to_lowercase();
        Ok(state
            .merchants
            .values()
            .filter(|m| m.wallet_token.to_lowercase() == wallet)
            .min_by_key(|m| m.id)
            .cloned())
    }

    async fn create_withdrawal(&self, params: NewWithdrawal) -> GatewayResult<Withdrawal> {
        let mut state = self.state.write().await;
        if !state.merchants.contains_key(&params.merchant_id) {
            return Err(GatewayError::NotFound(format!(
                "merchant {}",
                params.merchant_id
            )));
        }
        let id = state.next_id();
        let withdrawal = Withdrawal {
            id,
            withdraw_no: params.withdraw_no,
            merchant_id: params.merchant_id,
            amount: params.amount,
            to_wallet: params.to_wallet,
            chain: params.chain,
            status: WithdrawalStatus::Pending,
            tx_hash: None,
            reject_reason: None,
            reviewed_by: None,
            reviewed_at: None,
            created_at: Utc::now(),
        };
        state.withdrawals.insert(id, withdrawal.clone());
        Ok(withdrawal)
    }

    async fn find_withdrawal(&self, withdraw_no: &str) -> GatewayResult<Option<Withdrawal>> {
        let state = self.state.read().await;
        Ok(state
            .withdrawals
            .values()
            .find(|w| w.withdraw_no == withdraw_no)
            .cloned())
    }

    async fn list_withdrawals(
        &self,
        merchant_id: i64,
        limit: i64,
        offset: i64,
    ) -> GatewayResult<(Vec<Withdrawal>, i64)> {
        let state = self.state.read().await;
        let mut items: Vec<Withdrawal> = state
            .withdrawals
            .values()
            .filter(|w| w.merchant_id == merchant_id)
            .cloned()
            .collect();
        newest_first(&mut items, |w| w.id);
        let total = items.len() as i64;
        let page = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn approve_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reviewed_at: i64,
    ) -> GatewayResult<Withdrawal> {
        let mut state = self.state.write().await;

        let (merchant_id, amount) = {
            let w = state.withdrawal_mut(withdrawal_id)?;
            if w.status != WithdrawalStatus::Pending {
                return Err(GatewayError::InvalidState(format!(
                    "withdrawal {} is not pending",
                    w.withdraw_no
                )));
            }
            (w.merchant_id, w.amount)
        };

        let merchant = state
            .merchants
            .get_mut(&merchant_id)
            .ok_or_else(|| GatewayError::NotFound(format!("merchant {}", merchant_id)))?;
        if merchant.balance < amount {
            return Err(GatewayError::InsufficientBalance);
        }
        merchant.balance -= amount;

        let w = state.withdrawal_mut(withdrawal_id)?;
        w.status = WithdrawalStatus::Approved;
        w.reviewed_by = Some(reviewer.to_string());
        w.reviewed_at = Some(reviewed_at);
        Ok(w.clone())
    }

    async fn reject_pending_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reason: &str,
        reviewed_at: i64,
    ) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let w = state.withdrawal_mut(withdrawal_id)?;
        if w.status != WithdrawalStatus::Pending {
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not pending",
                w.withdraw_no
            )));
        }
        w.status = WithdrawalStatus::Rejected;
        w.reviewed_by = Some(reviewer.to_string());
        w.reject_reason = Some(reason.to_string());
        w.reviewed_at = Some(reviewed_at);
        Ok(())
    }

    async fn complete_withdrawal(&self, withdrawal_id: i64, tx_hash: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let w = state.withdrawal_mut(withdrawal_id)?;
        if w.status != WithdrawalStatus::Approved {
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not approved",
                w.withdraw_no
            )));
        }
        w.status = WithdrawalStatus::Completed;
        w.tx_hash = Some(tx_hash.to_string());
        Ok(())
    }

    async fn reject_approved_withdrawal(
        &self,
        withdrawal_id: i64,
        reason: &str,
    ) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        let (merchant_id, amount) = {
            let w = state.withdrawal_mut(withdrawal_id)?;
            if w.status != WithdrawalStatus::Approved {
                return Err(GatewayError::InvalidState(format!(
                    "withdrawal {} is not approved",
                    w.withdraw_no
                )));
            }
            w.status = WithdrawalStatus::Rejected;
            w.reject_reason = Some(reason.to_string());
            (w.merchant_id, w.amount)
        };
        if let Some(merchant) = state.merchants.get_mut(&merchant_id) {
            merchant.balance += amount;
        }
        Ok(())
    }
}

#[async_trait]
impl WalletRepository for MemoryStore {
    async fn list_enabled(&self, chain: &str) -> GatewayResult<Vec<PayoutWallet>> {
        let state = self.state.read().await;
        Ok(state
            .wallets
            .iter()
            .filter(|w| w.enabled && w.chain == chain)
            .cloned()
            .collect())
    }
}

//! 测试辅助模块
//! 内存存储 + 可编排的模拟链客户端 + 固定配置

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ktvpay::{
    app_state::{AppState, Repositories},
    config::{parse_key_map, Config, Secret},
    domain::{
        authorization::{
            Authorization, AuthorizationStatus, Deduction, DeductionStatus, NewAuthorization,
            NewDeduction, SealedPassword, SettlementOutcome,
        },
        chain_config::{ChainConfig, ChainRegistry},
        settlement::{Withdrawal, WithdrawalStatus},
    },
    error::{GatewayError, GatewayResult},
    infrastructure::{
        event_bus::{EventBus, GatewayEvent, InMemoryEventBus},
        key_store::SigningKeyMaterial,
    },
    repository::{AuthorizationRepository, LedgerRepository, MemoryStore},
    service::chain_client::ChainClient,
};
use rust_decimal::Decimal;

pub const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";
pub const KEY_THREE: &str = "0000000000000000000000000000000000000000000000000000000000000003";

/// 私钥 1 对应的 BSC 地址
pub const MERCHANT_BSC: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";
pub const CUSTOMER_BSC: &str = "0x2b5ad5c4795c026514f8317c7a215e218dccd6cf";
pub const COMPANY_BSC: &str = "0x6813eb9362372eef6200f3b1dbc3f819671cba69";
/// 未配置私钥的收款地址
pub const KEYLESS_BSC: &str = "0x1111111111111111111111111111111111111111";

/// 私钥 1 对应的 TRON 地址
pub const MERCHANT_TRON: &str = "TMVQGm1qAQYVdetCeGRRkTWYYrLXuHK2HC";
pub const CUSTOMER_TRON: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

pub const MASTER_KEY: &str = "1111111111111111111111111111111111111111111111111111111111111111";

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// 固定测试配置：汇率 6.5，24 小时有效期，EVM 公司钱包，主密钥已配置
pub fn test_config() -> Config {
    let mut config = Config::default();
    let gw = &mut config.gateway;
    gw.app_uri = "https://pay.test".into();
    gw.usdt_rate = dec("6.5");
    gw.forced_usdt_rate = None;
    gw.authorization_ttl_secs = 24 * 3600;
    gw.depletion_epsilon = dec("0.01");
    gw.token_amount_scale = 4;
    gw.company_wallet = Some(COMPANY_BSC.into());
    gw.company_tron_wallet = None;
    gw.company_private_key = Some(Secret::new(KEY_THREE));
    gw.merchant_private_keys =
        parse_key_map(&format!("{}={},{}={}", MERCHANT_BSC, KEY_ONE, MERCHANT_TRON, KEY_ONE));
    gw.merchant_private_key = None;
    gw.auth_master_key = Some(Secret::new(MASTER_KEY));
    gw.approval_monitor_enabled = false;
    gw.approval_monitor_interval_secs = 1;
    gw.expiry_sweep_enabled = true;
    gw.default_withdrawal_chain = "BSC".into();
    config
}

/// 链上转账调用记录
#[derive(Debug, Clone)]
pub struct TransferCall {
    pub chain: String,
    pub spender: Option<String>,
    pub from: Option<String>,
    pub to: String,
    pub amount: Decimal,
}

/// 可编排的链客户端：allowance 按 owner 设定，查询与转账可注入失败与延迟
#[derive(Default)]
pub struct MockChain {
    allowances: Mutex<HashMap<String, Decimal>>,
    fail_transfers: AtomicBool,
    fail_allowance: AtomicBool,
    failing_amounts: Mutex<Vec<Decimal>>,
    delay_ms: AtomicUsize,
    tx_counter: AtomicUsize,
    calls: Mutex<Vec<TransferCall>>,
}

impl MockChain {
    pub fn set_allowance(&self, owner: &str, amount: Decimal) {
        self.allowances
            .lock()
            .unwrap()
            .insert(owner.to_lowercase(), amount);
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// 指定金额的转账失败，其余正常
    pub fn fail_amount(&self, amount: Decimal) {
        self.failing_amounts.lock().unwrap().push(amount);
    }

    pub fn fail_allowance(&self, fail: bool) {
        self.fail_allowance.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, ms: usize) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn broadcast(&self, call: TransferCall) -> GatewayResult<String> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let amount_fails = self.failing_amounts.lock().unwrap().contains(&call.amount);
        if self.fail_transfers.load(Ordering::SeqCst) || amount_fails {
            return Err(GatewayError::ChainBroadcastFailed(
                "execution reverted: insufficient allowance".into(),
            ));
        }
        self.calls.lock().unwrap().push(call);
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("0x{:064x}", n))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn query_allowance(
        &self,
        _chain: &ChainConfig,
        owner: &str,
        _spender: &str,
    ) -> GatewayResult<Decimal> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_allowance.load(Ordering::SeqCst) {
            return Err(GatewayError::ChainQueryFailed("node timeout".into()));
        }
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&owner.to_lowercase())
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn transfer_from(
        &self,
        chain: &ChainConfig,
        spender: &str,
        _key: &SigningKeyMaterial,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        self.broadcast(TransferCall {
            chain: chain.name.clone(),
            spender: Some(spender.to_string()),
            from: Some(from.to_string()),
            to: to.to_string(),
            amount,
        })
        .await
    }

    async fn transfer(
        &self,
        chain: &ChainConfig,
        _key: &SigningKeyMaterial,
        to: &str,
        amount: Decimal,
    ) -> GatewayResult<String> {
        self.broadcast(TransferCall {
            chain: chain.name.clone(),
            spender: None,
            from: None,
            to: to.to_string(),
            amount,
        })
        .await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MockChain>,
    pub state: AppState,
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

/// 按配置装配，并登记 BSC / TRON 收款钱包与对应商户
pub async fn harness_with(config: Config) -> Harness {
    harness_wrapping(config, |store| store as Arc<dyn AuthorizationRepository>).await
}

/// 授权存储经 wrap 包装后装配，其余存储直接使用内存实现
pub async fn harness_wrapping<F>(config: Config, wrap: F) -> Harness
where
    F: FnOnce(Arc<MemoryStore>) -> Arc<dyn AuthorizationRepository>,
{
    ktvpay::infrastructure::logging::try_init_for_tests();

    let store = Arc::new(MemoryStore::new());
    store.add_payout_wallet("BSC", MERCHANT_BSC).await;
    store.add_payout_wallet("TRON", MERCHANT_TRON).await;
    store.add_merchant("bsc-merchant", MERCHANT_BSC, Decimal::ZERO).await;

    let chain = Arc::new(MockChain::default());
    let registry = ChainRegistry::from_config(&config.chains);
    let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

    let repositories = Repositories {
        authorizations: wrap(store.clone()),
        ..Repositories::memory(store.clone())
    };
    let state = AppState::from_parts(
        Arc::new(config),
        registry,
        repositories,
        chain.clone(),
        events,
    )
    .unwrap();

    Harness {
        store,
        chain,
        state,
    }
}

impl Harness {
    /// 创建 BSC 授权并通过 allowance 自动确认，返回 (auth_no, password)
    pub async fn active_authorization(&self, amount: &str) -> (String, String) {
        let ticket = self
            .state
            .authorizations
            .create_authorization(ktvpay::service::CreateAuthorizationRequest {
                amount_usdt: dec(amount),
                chain: "BSC".into(),
                table_no: "A08".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        self.chain.set_allowance(CUSTOMER_BSC, dec(amount));
        let status = self
            .state
            .authorizations
            .confirm_auto(&ticket.auth_no, CUSTOMER_BSC)
            .await
            .unwrap();
        assert_eq!(status.status.as_str(), "active");
        (ticket.auth_no, ticket.password)
    }

    pub async fn merchant_id(&self) -> i64 {
        self.store
            .find_merchant_by_wallet(MERCHANT_BSC)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    pub async fn merchant_balance(&self) -> Decimal {
        self.store
            .find_merchant_by_wallet(MERCHANT_BSC)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    /// 等待后台结算结束
    pub async fn settled_deduction(&self, deduct_no: &str) -> Deduction {
        for _ in 0..300 {
            let deduction = self
                .store
                .find_deduction(deduct_no)
                .await
                .unwrap()
                .unwrap();
            if deduction.status != DeductionStatus::Processing {
                return deduction;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deduction {} never settled", deduct_no);
    }

    /// 等待后台出款结束
    pub async fn finished_withdrawal(&self, withdraw_no: &str) -> Withdrawal {
        for _ in 0..300 {
            let withdrawal = self
                .store
                .find_withdrawal(withdraw_no)
                .await
                .unwrap()
                .unwrap();
            if withdrawal.status != WithdrawalStatus::Approved {
                return withdrawal;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("withdrawal {} never finished", withdraw_no);
    }

    pub async fn event_types(&self) -> Vec<&'static str> {
        self.state
            .events
            .recent_events(100)
            .await
            .into_iter()
            .rev()
            .map(|e| e.event.event_type())
            .collect()
    }

    /// 等待后台任务发布指定事件（事件在落库之后发布）
    pub async fn wait_for_event(&self, event_type: &str) -> Vec<&'static str> {
        for _ in 0..300 {
            let types = self.event_types().await;
            if types.iter().any(|t| *t == event_type) {
                return types;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {} never published", event_type);
    }

    pub async fn events(&self) -> Vec<GatewayEvent> {
        self.state
            .events
            .recent_events(100)
            .await
            .into_iter()
            .rev()
            .map(|e| e.event)
            .collect()
    }
}

/// 前 n 次预占扣款报告扣款编号冲突，其余调用转交内存存储
pub struct CollidingDeductionNumbers {
    inner: Arc<MemoryStore>,
    collisions: AtomicUsize,
    attempts: AtomicUsize,
    deduct_nos: Mutex<Vec<String>>,
}

impl CollidingDeductionNumbers {
    pub fn new(inner: Arc<MemoryStore>, collisions: usize) -> Self {
        Self {
            inner,
            collisions: AtomicUsize::new(collisions),
            attempts: AtomicUsize::new(0),
            deduct_nos: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 每次预占尝试使用的扣款编号
    pub fn deduct_nos(&self) -> Vec<String> {
        self.deduct_nos.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorizationRepository for CollidingDeductionNumbers {
    async fn create(&self, params: NewAuthorization) -> GatewayResult<Authorization> {
        self.inner.create(params).await
    }

    async fn find_by_auth_no(&self, auth_no: &str) -> GatewayResult<Option<Authorization>> {
        self.inner.find_by_auth_no(auth_no).await
    }

    async fn find_by_password(&self, password: &str) -> GatewayResult<Option<Authorization>> {
        self.inner.find_by_password(password).await
    }

    async fn list_by_status(
        &self,
        status: AuthorizationStatus,
        limit: i64,
    ) -> GatewayResult<Vec<Authorization>> {
        self.inner.list_by_status(status, limit).await
    }

    async fn bind_customer_wallet(&self, auth_id: i64, customer_wallet: &str) -> GatewayResult<()> {
        self.inner.bind_customer_wallet(auth_id, customer_wallet).await
    }

    async fn activate(
        &self,
        auth_id: i64,
        customer_wallet: &str,
        tx_hash: Option<&str>,
        authorize_time: i64,
        sealed: Option<&SealedPassword>,
    ) -> GatewayResult<bool> {
        self.inner
            .activate(auth_id, customer_wallet, tx_hash, authorize_time, sealed)
            .await
    }

    async fn update_status(
        &self,
        auth_id: i64,
        from: AuthorizationStatus,
        to: AuthorizationStatus,
    ) -> GatewayResult<bool> {
        self.inner.update_status(auth_id, from, to).await
    }

    async fn expire_overdue(&self, now: i64) -> GatewayResult<u64> {
        self.inner.expire_overdue(now).await
    }

    async fn list_unsealed(&self, limit: i64) -> GatewayResult<Vec<Authorization>> {
        self.inner.list_unsealed(limit).await
    }

    async fn set_sealed_password(
        &self,
        auth_id: i64,
        sealed: &SealedPassword,
    ) -> GatewayResult<()> {
        self.inner.set_sealed_password(auth_id, sealed).await
    }

    async fn reserve_deduction(&self, params: NewDeduction) -> GatewayResult<(Deduction, Decimal)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.deduct_nos.lock().unwrap().push(params.deduct_no.clone());
        let collide = self
            .collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if collide {
            return Err(GatewayError::InvalidInput("duplicate deduction number".into()));
        }
        self.inner.reserve_deduction(params).await
    }

    async fn complete_deduction(
        &self,
        deduction_id: i64,
        tx_hash: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        self.inner
            .complete_deduction(deduction_id, tx_hash, depletion_epsilon)
            .await
    }

    async fn fail_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        self.inner
            .fail_deduction(deduction_id, reason, depletion_epsilon)
            .await
    }

    async fn find_deduction(&self, deduct_no: &str) -> GatewayResult<Option<Deduction>> {
        self.inner.find_deduction(deduct_no).await
    }

    async fn list_deductions_by_password(
        &self,
        password: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Deduction>> {
        self.inner.list_deductions_by_password(password, limit).await
    }

    async fn list_deductions_by_auth(&self, auth_id: i64) -> GatewayResult<Vec<Deduction>> {
        self.inner.list_deductions_by_auth(auth_id).await
    }
}

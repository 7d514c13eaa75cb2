use std::sync::Arc;

use crate::{
    config::Config,
    domain::chain_config::ChainRegistry,
    infrastructure::{
        db::PgPool,
        encryption::CredentialVault,
        event_bus::{EventBus, InMemoryEventBus},
        key_store::{ConfigKeyResolver, KeyResolver},
    },
    repository::{
        AuthorizationRepository, LedgerRepository, MemoryStore, PgAuthorizationRepository,
        PgLedgerRepository, PgWalletRepository, WalletRepository,
    },
    service::{
        chain_client::{ChainClient, ChainGateway},
        evm_client::EvmClient,
        tron_client::TronClient,
        ApprovalMonitor, AuthorizationService, DeductionService, WithdrawalService,
    },
};

/// 存储层组合
#[derive(Clone)]
pub struct Repositories {
    pub authorizations: Arc<dyn AuthorizationRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            authorizations: Arc::new(PgAuthorizationRepository::new(pool.clone())),
            wallets: Arc::new(PgWalletRepository::new(pool.clone())),
            ledger: Arc::new(PgLedgerRepository::new(pool)),
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            authorizations: store.clone(),
            wallets: store.clone(),
            ledger: store,
        }
    }
}

/// 应用状态
/// 启动时构建一次，所有服务共享只读配置与同一组存储、链客户端
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ChainRegistry>,
    pub events: Arc<dyn EventBus>,
    pub authorizations: Arc<AuthorizationService>,
    pub deductions: Arc<DeductionService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub monitor: Arc<ApprovalMonitor>,
}

impl AppState {
    /// 生产环境：Postgres 存储 + 真实 TRON / EVM 节点
    pub fn new(pool: PgPool, config: Arc<Config>) -> anyhow::Result<Self> {
        let registry = ChainRegistry::from_config(&config.chains);
        let tron = Arc::new(TronClient::new(&config.chains)?);
        let evm = Arc::new(EvmClient::new(&registry, &config.chains));
        let chains: Arc<dyn ChainClient> = Arc::new(ChainGateway::new(tron, evm));

        Self::from_parts(
            config,
            registry,
            Repositories::postgres(pool),
            chains,
            Arc::new(InMemoryEventBus::new()),
        )
    }

    /// 按给定组件装配服务（测试中注入内存存储与模拟链客户端）
    pub fn from_parts(
        config: Arc<Config>,
        registry: ChainRegistry,
        repos: Repositories,
        chains: Arc<dyn ChainClient>,
        events: Arc<dyn EventBus>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(registry);
        let gateway_cfg = Arc::new(config.gateway.clone());
        let keys: Arc<dyn KeyResolver> = Arc::new(ConfigKeyResolver::from_config(&gateway_cfg));

        let vault = match &config.gateway.auth_master_key {
            Some(master) if !master.is_empty() => {
                Some(Arc::new(CredentialVault::from_hex(master.expose())?))
            }
            _ => {
                tracing::warn!("AUTH_MASTER_KEY not configured, access passwords are not sealed");
                None
            }
        };

        let authorizations = Arc::new(AuthorizationService::new(
            repos.authorizations.clone(),
            repos.wallets.clone(),
            chains.clone(),
            registry.clone(),
            keys.clone(),
            vault,
            events.clone(),
            gateway_cfg.clone(),
        ));
        let deductions = Arc::new(DeductionService::new(
            repos.authorizations.clone(),
            chains.clone(),
            registry.clone(),
            keys.clone(),
            events.clone(),
            gateway_cfg.clone(),
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            repos.ledger.clone(),
            chains,
            registry.clone(),
            keys,
            events.clone(),
            gateway_cfg.clone(),
        ));
        let monitor = Arc::new(ApprovalMonitor::new(
            authorizations.clone(),
            gateway_cfg.approval_monitor_interval_secs,
            gateway_cfg.expiry_sweep_enabled,
        ));

        Ok(Self {
            config,
            registry,
            events,
            authorizations,
            deductions,
            withdrawals,
            monitor,
        })
    }
}

// 授权确认轮询 - 后台任务
// 定期对已登记客户钱包的 Pending 授权重新检查链上 allowance，并落库过期授权

use std::{sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use tokio::time::interval;

use crate::{
    domain::authorization::{Authorization, AuthorizationStatus},
    error::GatewayResult,
    service::authorization_service::AuthorizationService,
};

/// 单轮内并发查询 allowance 的上限
const CHECK_CONCURRENCY: usize = 4;

pub struct ApprovalMonitor {
    authorizations: Arc<AuthorizationService>,
    interval_secs: u64,
    sweep_expired: bool,
}

/// 单轮处理统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorPass {
    pub checked: usize,
    pub activated: usize,
    pub expired: u64,
}

impl ApprovalMonitor {
    pub fn new(
        authorizations: Arc<AuthorizationService>,
        interval_secs: u64,
        sweep_expired: bool,
    ) -> Self {
        Self {
            authorizations,
            interval_secs: interval_secs.max(1),
            sweep_expired,
        }
    }

    /// 启动后台监控任务（持续运行）
    pub async fn start_background_monitor(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        tracing::info!(
            "Approval monitor started, interval={}s, expiry_sweep={}",
            self.interval_secs,
            self.sweep_expired
        );

        loop {
            ticker.tick().await;

            match self.run_once().await {
                Ok(pass) => {
                    if pass.activated > 0 || pass.expired > 0 {
                        tracing::info!(
                            checked = pass.checked,
                            activated = pass.activated,
                            expired = pass.expired,
                            "Approval monitor pass finished"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Approval monitor pass failed");
                }
            }
        }
    }

    /// 执行一轮检查，单笔授权的错误只记录不中断
    pub async fn run_once(&self) -> GatewayResult<MonitorPass> {
        let mut pass = MonitorPass::default();

        if self.sweep_expired {
            pass.expired = self.authorizations.expire_overdue().await?;
        }

        let pending: Vec<Authorization> = self
            .authorizations
            .list_pending()
            .await?
            .into_iter()
            .filter(|a| !a.customer_wallet.is_empty())
            .collect();
        pass.checked = pending.len();

        let results: Vec<bool> = stream::iter(pending)
            .map(|auth| self.recheck(auth))
            .buffer_unordered(CHECK_CONCURRENCY)
            .collect()
            .await;
        pass.activated = results.into_iter().filter(|activated| *activated).count();

        Ok(pass)
    }

    async fn recheck(&self, auth: Authorization) -> bool {
        match self
            .authorizations
            .confirm_auto(&auth.auth_no, &auth.customer_wallet)
            .await
        {
            Ok(status) => status.status == AuthorizationStatus::Active,
            Err(e) => {
                tracing::warn!(
                    auth_no = %auth.auth_no,
                    customer_wallet = %auth.customer_wallet,
                    error = %e,
                    "Failed to re-check authorization allowance"
                );
                false
            }
        }
    }
}

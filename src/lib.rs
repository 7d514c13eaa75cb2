//! KtvPay - USDT 授权扣款网关
//!
//! 客户对收款钱包做链上 approve，网关在授权额度内按需 transferFrom 扣款，
//! 扣款记入商户内部账本，商户再通过公司钱包提现。

pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod repository;
pub mod service;
pub mod utils;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode, GatewayError, GatewayResult};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        domain::{Authorization, AuthorizationStatus, ChainConfig, ChainRegistry},
        error::{GatewayError, GatewayResult},
        service::{AuthorizationService, DeductionService, WithdrawalService},
    };
}

//! Domain 模块
//!
//! 授权、扣款、提现的领域模型与状态机，以及多链配置

pub mod authorization;
pub mod chain_config;
pub mod settlement;

// 重新导出常用类型
pub use authorization::{Authorization, AuthorizationStatus, Deduction, DeductionStatus};
pub use chain_config::{ChainConfig, ChainFamily, ChainRegistry};
pub use settlement::{Merchant, Withdrawal, WithdrawalStatus};

pub mod approval_monitor;
pub mod authorization_service;
pub mod chain_client;
pub mod deduction_service;
pub mod evm_client;
pub mod gas_estimator;
pub mod tron_client;
pub mod withdrawal_service;

pub use approval_monitor::ApprovalMonitor;
pub use authorization_service::{AuthorizationService, CreateAuthorizationRequest};
pub use chain_client::{ChainClient, ChainGateway};
pub use deduction_service::DeductionService;
pub use withdrawal_service::WithdrawalService;

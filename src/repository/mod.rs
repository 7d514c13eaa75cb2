// Repository 抽象层
pub mod authorization_repository;
pub mod ledger_repository;
pub mod memory;
pub mod wallet_repository;

pub use authorization_repository::{AuthorizationRepository, PgAuthorizationRepository};
pub use ledger_repository::{LedgerRepository, PgLedgerRepository};
pub use memory::MemoryStore;
pub use wallet_repository::{PgWalletRepository, WalletRepository};

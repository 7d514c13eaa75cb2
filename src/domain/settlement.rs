//! 结算账本领域模型：商户余额、提现单、收款钱包
//!
//! 提现状态转换：
//! ```text
//! Pending  -> Approved   ✅ 审核通过，余额已扣减，链上转账进行中
//! Pending  -> Rejected   ✅ 审核拒绝
//! Approved -> Completed  ✅ 转账成功
//! Approved -> Rejected   ✅ 转账失败，余额退回
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{GatewayError, GatewayResult};

/// 提现状态（数据库存 1-4）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn code(&self) -> i16 {
        match self {
            WithdrawalStatus::Pending => 1,
            WithdrawalStatus::Approved => 2,
            WithdrawalStatus::Completed => 3,
            WithdrawalStatus::Rejected => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(WithdrawalStatus::Pending),
            2 => Some(WithdrawalStatus::Approved),
            3 => Some(WithdrawalStatus::Completed),
            4 => Some(WithdrawalStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }

    pub fn validate_transition(self, to: WithdrawalStatus) -> GatewayResult<()> {
        use WithdrawalStatus::*;

        let valid = match self {
            Pending => matches!(to, Approved | Rejected),
            Approved => matches!(to, Completed | Rejected),
            Completed | Rejected => false,
        };

        if valid {
            Ok(())
        } else {
            Err(GatewayError::InvalidState(format!(
                "withdrawal {} -> {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }
}

/// 商户（仅结算相关字段）
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Merchant {
    pub id: i64,
    pub merchant_name: String,
    /// 关联收款钱包
    pub wallet_token: String,
    /// 内部账本余额（USDT）
    pub balance: Decimal,
}

/// 商户提现单
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Withdrawal {
    pub id: i64,
    pub withdraw_no: String,
    pub merchant_id: i64,
    pub amount: Decimal,
    pub to_wallet: String,
    pub chain: String,
    pub status: WithdrawalStatus,
    pub tx_hash: Option<String>,
    pub reject_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub withdraw_no: String,
    pub merchant_id: i64,
    pub amount: Decimal,
    pub to_wallet: String,
    pub chain: String,
}

/// 收款钱包（可作为授权的 merchant_wallet）
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PayoutWallet {
    pub id: i64,
    pub chain: String,
    pub address: String,
    pub enabled: bool,
}

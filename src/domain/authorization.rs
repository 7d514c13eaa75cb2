//! 授权与扣款领域模型
//!
//! 授权状态转换：
//! ```text
//! Pending -> Active      ✅ 链上 allowance 确认（手动 / 自动）
//! Pending -> Revoked     ✅
//! Pending -> Expired     ✅
//! Active  -> Depleted    ✅ 剩余额度 ≈ 0
//! Active  -> Revoked     ✅
//! Active  -> Expired     ✅
//! ```
//! Revoked / Depleted / Expired 为终态。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{GatewayError, GatewayResult};

/// 授权状态（数据库存 1-5）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Active,
    Revoked,
    Depleted,
    Expired,
}

impl AuthorizationStatus {
    pub fn code(&self) -> i16 {
        match self {
            AuthorizationStatus::Pending => 1,
            AuthorizationStatus::Active => 2,
            AuthorizationStatus::Revoked => 3,
            AuthorizationStatus::Depleted => 4,
            AuthorizationStatus::Expired => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(AuthorizationStatus::Pending),
            2 => Some(AuthorizationStatus::Active),
            3 => Some(AuthorizationStatus::Revoked),
            4 => Some(AuthorizationStatus::Depleted),
            5 => Some(AuthorizationStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Active => "active",
            AuthorizationStatus::Revoked => "revoked",
            AuthorizationStatus::Depleted => "depleted",
            AuthorizationStatus::Expired => "expired",
        }
    }

    /// 判断是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Revoked
                | AuthorizationStatus::Depleted
                | AuthorizationStatus::Expired
        )
    }

    /// 验证状态转换是否合法，相同状态视为非法（调用方需自行处理幂等）
    pub fn validate_transition(self, to: AuthorizationStatus) -> GatewayResult<()> {
        use AuthorizationStatus::*;

        let valid = match self {
            Pending => matches!(to, Active | Revoked | Expired),
            Active => matches!(to, Depleted | Revoked | Expired),
            Revoked | Depleted | Expired => false,
        };

        if valid {
            Ok(())
        } else {
            Err(GatewayError::InvalidState(format!(
                "{} -> {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }
}

/// 扣款状态（数据库存 1-3）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeductionStatus {
    Processing,
    Success,
    Failed,
}

impl DeductionStatus {
    pub fn code(&self) -> i16 {
        match self {
            DeductionStatus::Processing => 1,
            DeductionStatus::Success => 2,
            DeductionStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(DeductionStatus::Processing),
            2 => Some(DeductionStatus::Success),
            3 => Some(DeductionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionStatus::Processing => "processing",
            DeductionStatus::Success => "success",
            DeductionStatus::Failed => "failed",
        }
    }
}

/// 加密保存的访问密码（Argon2id + AES-256-GCM，绑定客户钱包）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPassword {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub salt: Vec<u8>,
}

/// 客户授权
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Authorization {
    pub id: i64,
    pub auth_no: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip)]
    pub sealed_password: Option<SealedPassword>,
    /// 客户钱包，确认前可能为空
    pub customer_wallet: String,
    pub merchant_wallet: String,
    pub chain: String,
    pub authorized_usdt: Decimal,
    pub used_usdt: Decimal,
    pub remaining_usdt: Decimal,
    pub status: AuthorizationStatus,
    pub table_no: String,
    pub customer_name: String,
    pub remark: String,
    pub tx_hash: Option<String>,
    /// 授权生效时间（Unix 秒）
    pub authorize_time: Option<i64>,
    /// 过期时间（Unix 秒）
    pub expire_time: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Authorization {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_time > 0 && now > self.expire_time
    }

    /// authorized == used + remaining 且 remaining >= 0
    pub fn quota_consistent(&self) -> bool {
        self.remaining_usdt >= Decimal::ZERO
            && self.used_usdt >= Decimal::ZERO
            && self.used_usdt + self.remaining_usdt == self.authorized_usdt
    }
}

/// 创建授权参数
#[derive(Debug, Clone)]
pub struct NewAuthorization {
    pub auth_no: String,
    pub password: String,
    pub merchant_wallet: String,
    pub chain: String,
    pub authorized_usdt: Decimal,
    pub table_no: String,
    pub customer_name: String,
    pub remark: String,
    pub expire_time: i64,
}

/// 扣款记录
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Deduction {
    pub id: i64,
    pub deduct_no: String,
    pub auth_id: i64,
    pub auth_no: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// 扣款金额（USDT，创建时计算，之后不可变）
    pub amount_usdt: Decimal,
    /// 法币金额
    pub amount_cny: Decimal,
    pub tx_hash: Option<String>,
    pub status: DeductionStatus,
    pub fail_reason: Option<String>,
    pub product_info: String,
    pub operator_id: String,
    pub deduct_time: i64,
    pub created_at: DateTime<Utc>,
}

/// 创建扣款参数
#[derive(Debug, Clone)]
pub struct NewDeduction {
    pub deduct_no: String,
    pub auth_id: i64,
    pub auth_no: String,
    pub password: String,
    pub amount_usdt: Decimal,
    pub amount_cny: Decimal,
    pub product_info: String,
    pub operator_id: String,
    pub deduct_time: i64,
}

/// 扣款结算结果
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub remaining_usdt: Decimal,
    pub depleted: bool,
    /// 是否找到收款钱包对应的商户并入账
    pub merchant_credited: bool,
}

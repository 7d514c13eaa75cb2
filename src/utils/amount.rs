//! 金额换算
//!
//! 所有金额在服务内部使用 `rust_decimal::Decimal`，仅在链交互时换算为最小单位（U256）。

use ethers::types::U256;
use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal, RoundingStrategy,
};

use crate::error::{GatewayError, GatewayResult};

fn scale_factor(decimals: u32) -> GatewayResult<Decimal> {
    10u64
        .checked_pow(decimals)
        .map(Decimal::from)
        .ok_or_else(|| GatewayError::InvalidInput(format!("unsupported token decimals {}", decimals)))
}

/// USDT 金额 -> 链上最小单位（截断多余小数）
pub fn to_minor_units(amount: Decimal, decimals: u32) -> GatewayResult<U256> {
    if amount.is_sign_negative() {
        return Err(GatewayError::InvalidInput(format!("negative amount {}", amount)));
    }

    let scaled = amount
        .checked_mul(scale_factor(decimals)?)
        .ok_or_else(|| GatewayError::InvalidInput(format!("amount {} overflows", amount)))?
        .trunc();

    let minor = scaled
        .to_u128()
        .ok_or_else(|| GatewayError::InvalidInput(format!("amount {} overflows", amount)))?;
    Ok(U256::from(minor))
}

/// 链上最小单位 -> USDT 金额
///
/// 无限授权（如 2^256-1）超出 Decimal 表示范围，返回 `Decimal::MAX`。
pub fn from_minor_units(value: U256, decimals: u32) -> Decimal {
    if value > U256::from(u128::MAX) {
        return Decimal::MAX;
    }
    let raw = value.as_u128();

    if decimals <= 28 {
        if let Ok(v) = i128::try_from(raw) {
            if let Ok(d) = Decimal::try_from_i128_with_scale(v, decimals) {
                return d.normalize();
            }
        }
    }

    // 超出96位尾数时先做整数除法，精度损失可以接受
    let divisor = 10u128.checked_pow(decimals).unwrap_or(u128::MAX);
    Decimal::from_u128(raw / divisor).unwrap_or(Decimal::MAX)
}

/// 法币金额按汇率换算为 USDT，保留 `scale` 位小数（四舍五入）
pub fn fiat_to_token(fiat_amount: Decimal, rate: Decimal, scale: u32) -> GatewayResult<Decimal> {
    if fiat_amount <= Decimal::ZERO {
        return Err(GatewayError::InvalidInput("amount must be positive".into()));
    }
    if rate <= Decimal::ZERO {
        return Err(GatewayError::InvalidInput("exchange rate must be positive".into()));
    }

    let token = fiat_amount
        .checked_div(rate)
        .ok_or_else(|| GatewayError::InvalidInput("amount overflows".into()))?;
    Ok(token.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero))
}

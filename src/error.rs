//! 错误类型
//!
//! - `GatewayError`: 服务层错误分类（授权、扣款、链交互、凭证保险库）
//! - `AppError`: 对外响应错误（供HTTP层复用）

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// 网关业务错误
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no payout wallet with a signing key is available for chain {0}")]
    NoWalletAvailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("authorization {0} has expired")]
    Expired(String),

    #[error("access password is invalid or the authorization is not active")]
    InvalidCredential,

    #[error("insufficient quota: remaining {remaining} USDT, requested {requested} USDT")]
    InsufficientQuota {
        remaining: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },

    #[error("signing key does not control spender address {0}")]
    KeyMismatch(String),

    #[error("chain query failed: {0}")]
    ChainQueryFailed(String),

    #[error("chain broadcast failed: {0}")]
    ChainBroadcastFailed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient ledger balance")]
    InsufficientBalance,

    #[error("signing key not configured for {0}")]
    SigningKeyMissing(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// 业务编号唯一约束冲突（数据库唯一索引或内存存储的重复检查）
    pub fn is_duplicate(&self) -> bool {
        match self {
            GatewayError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            GatewayError::InvalidInput(msg) => msg.contains("duplicate"),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    BadRequest,
    NotFound,
    Internal,
    NoWalletAvailable,
    InvalidState,
    Expired,
    InvalidCredentials,
    InsufficientQuota,
    InsufficientBalance,
    KeyMismatch,
    RpcError,
    TransactionFailed,
    DecryptionFailed,
    ChainNotSupported,
    InvalidAddress,
    DatabaseError,
}

impl AppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorCode::BadRequest => "bad_request",
            AppErrorCode::NotFound => "not_found",
            AppErrorCode::Internal => "internal",
            AppErrorCode::NoWalletAvailable => "no_wallet_available",
            AppErrorCode::InvalidState => "invalid_state",
            AppErrorCode::Expired => "expired",
            AppErrorCode::InvalidCredentials => "invalid_credentials",
            AppErrorCode::InsufficientQuota => "insufficient_quota",
            AppErrorCode::InsufficientBalance => "insufficient_balance",
            AppErrorCode::KeyMismatch => "key_mismatch",
            AppErrorCode::RpcError => "rpc_error",
            AppErrorCode::TransactionFailed => "transaction_failed",
            AppErrorCode::DecryptionFailed => "decryption_failed",
            AppErrorCode::ChainNotSupported => "chain_not_supported",
            AppErrorCode::InvalidAddress => "invalid_address",
            AppErrorCode::DatabaseError => "database_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub status: StatusCode,
    pub trace_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    trace_id: Option<&'a str>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.as_str(),
            message: &self.message,
            trace_id: self.trace_id.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    fn new(code: AppErrorCode, status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            status,
            trace_id: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::BadRequest, StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::NotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            AppErrorCode::Internal,
            StatusCode::INTERNAL_SERVER_ERROR,
            msg,
        )
    }

    /// 设置追踪ID
    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        let (code, status) = match &err {
            GatewayError::NoWalletAvailable(_) => (
                AppErrorCode::NoWalletAvailable,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            GatewayError::InvalidState(_) => (AppErrorCode::InvalidState, StatusCode::CONFLICT),
            GatewayError::Expired(_) => (AppErrorCode::Expired, StatusCode::GONE),
            GatewayError::InvalidCredential => {
                (AppErrorCode::InvalidCredentials, StatusCode::UNAUTHORIZED)
            }
            GatewayError::InsufficientQuota { .. } => (
                AppErrorCode::InsufficientQuota,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            GatewayError::InsufficientBalance => (
                AppErrorCode::InsufficientBalance,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            GatewayError::KeyMismatch(_) | GatewayError::SigningKeyMissing(_) => {
                (AppErrorCode::KeyMismatch, StatusCode::INTERNAL_SERVER_ERROR)
            }
            GatewayError::ChainQueryFailed(_) => (AppErrorCode::RpcError, StatusCode::BAD_GATEWAY),
            GatewayError::ChainBroadcastFailed(_) => {
                (AppErrorCode::TransactionFailed, StatusCode::BAD_GATEWAY)
            }
            GatewayError::DecryptionFailed => {
                (AppErrorCode::DecryptionFailed, StatusCode::FORBIDDEN)
            }
            GatewayError::UnsupportedChain(_) => {
                (AppErrorCode::ChainNotSupported, StatusCode::BAD_REQUEST)
            }
            GatewayError::InvalidAddress(_) => {
                (AppErrorCode::InvalidAddress, StatusCode::BAD_REQUEST)
            }
            GatewayError::InvalidInput(_) => (AppErrorCode::BadRequest, StatusCode::BAD_REQUEST),
            GatewayError::NotFound(_) => (AppErrorCode::NotFound, StatusCode::NOT_FOUND),
            GatewayError::Database(_) => {
                (AppErrorCode::DatabaseError, StatusCode::INTERNAL_SERVER_ERROR)
            }
            GatewayError::Internal(_) => (AppErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        };

        // 存储与内部错误不向调用方暴露细节
        let message = match code {
            AppErrorCode::DatabaseError | AppErrorCode::Internal => {
                tracing::error!(error = %message, "internal gateway error");
                "系统暂时不可用，请稍后重试".to_string()
            }
            _ => message,
        };

        AppError::new(code, status, message)
    }
}

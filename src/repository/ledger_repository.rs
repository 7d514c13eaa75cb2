// 商户账本与提现 Repository

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::{
    domain::settlement::{Merchant, NewWithdrawal, Withdrawal, WithdrawalStatus},
    error::{GatewayError, GatewayResult},
};

// ============ Repository Trait ============

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn find_merchant(&self, merchant_id: i64) -> GatewayResult<Option<Merchant>>;

    /// 按关联收款钱包查找商户（不区分大小写）
    async fn find_merchant_by_wallet(&self, wallet: &str) -> GatewayResult<Option<Merchant>>;

    async fn create_withdrawal(&self, params: NewWithdrawal) -> GatewayResult<Withdrawal>;

    async fn find_withdrawal(&self, withdraw_no: &str) -> GatewayResult<Option<Withdrawal>>;

    /// 商户提现记录分页，返回 (记录, 总数)
    async fn list_withdrawals(
        &self,
        merchant_id: i64,
        limit: i64,
        offset: i64,
    ) -> GatewayResult<(Vec<Withdrawal>, i64)>;

    /// Pending -> Approved 并扣减余额（同一事务，余额不足整体回滚）
    async fn approve_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reviewed_at: i64,
    ) -> GatewayResult<Withdrawal>;

    /// Pending -> Rejected（未扣款，无需退回）
    async fn reject_pending_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reason: &str,
        reviewed_at: i64,
    ) -> GatewayResult<()>;

    /// Approved -> Completed
    async fn complete_withdrawal(&self, withdrawal_id: i64, tx_hash: &str) -> GatewayResult<()>;

    /// Approved -> Rejected 并退回余额（同一事务）
    async fn reject_approved_withdrawal(&self, withdrawal_id: i64, reason: &str)
        -> GatewayResult<()>;
}

// ============ 行映射 ============

const WITHDRAWAL_COLUMNS: &str = "id, withdraw_no, merchant_id, amount, to_wallet, chain, status, \
     tx_hash, reject_reason, reviewed_by, reviewed_at, created_at";

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: i64,
    withdraw_no: String,
    merchant_id: i64,
    amount: Decimal,
    to_wallet: String,
    chain: String,
    status: i16,
    tx_hash: Option<String>,
    reject_reason: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<i64>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = GatewayError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        let status = WithdrawalStatus::from_code(row.status).ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!(
                "withdrawal {} has unknown status {}",
                row.withdraw_no,
                row.status
            ))
        })?;
        Ok(Withdrawal {
            id: row.id,
            withdraw_no: row.withdraw_no,
            merchant_id: row.merchant_id,
            amount: row.amount,
            to_wallet: row.to_wallet,
            chain: row.chain,
            status,
            tx_hash: row.tx_hash,
            reject_reason: row.reject_reason,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            created_at: row.created_at,
        })
    }
}

type MerchantRow = (i64, String, String, Decimal);

fn merchant_from_row((id, merchant_name, wallet_token, balance): MerchantRow) -> Merchant {
    Merchant {
        id,
        merchant_name,
        wallet_token,
        balance,
    }
}

// ============ PostgreSQL 实现 ============

pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn find_merchant(&self, merchant_id: i64) -> GatewayResult<Option<Merchant>> {
        let row = sqlx::query_as::<_, MerchantRow>(
            "SELECT id, merchant_name, wallet_token, balance FROM merchants WHERE id = $1",
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(merchant_from_row))
    }

    async fn find_merchant_by_wallet(&self, wallet: &str) -> GatewayResult<Option<Merchant>> {
        let row = sqlx::query_as::<_, MerchantRow>(
            "SELECT id, merchant_name, wallet_token, balance FROM merchants
             WHERE LOWER(wallet_token) = LOWER($1) ORDER BY id LIMIT 1",
        )
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(merchant_from_row))
    }

    async fn create_withdrawal(&self, params: NewWithdrawal) -> GatewayResult<Withdrawal> {
        let sql = format!(
            "INSERT INTO merchant_withdrawals (withdraw_no, merchant_id, amount, to_wallet, chain, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(&params.withdraw_no)
            .bind(params.merchant_id)
            .bind(params.amount)
            .bind(&params.to_wallet)
            .bind(&params.chain)
            .bind(WithdrawalStatus::Pending.code())
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn find_withdrawal(&self, withdraw_no: &str) -> GatewayResult<Option<Withdrawal>> {
        let sql = format!(
            "SELECT {} FROM merchant_withdrawals WHERE withdraw_no = $1",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(withdraw_no)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Withdrawal::try_from).transpose()
    }

    async fn list_withdrawals(
        &self,
        merchant_id: i64,
        limit: i64,
        offset: i64,
    ) -> GatewayResult<(Vec<Withdrawal>, i64)> {
        let sql = format!(
            "SELECT {} FROM merchant_withdrawals WHERE merchant_id = $1
             ORDER BY id DESC LIMIT $2 OFFSET $3",
            WITHDRAWAL_COLUMNS
        );
        let rows = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(merchant_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM merchant_withdrawals WHERE merchant_id = $1")
                .bind(merchant_id)
                .fetch_one(&self.pool)
                .await?;

        let items = rows
            .into_iter()
            .map(Withdrawal::try_from)
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok((items, total))
    }

    async fn approve_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reviewed_at: i64,
    ) -> GatewayResult<Withdrawal> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE merchant_withdrawals
             SET status = $2, reviewed_by = $3, reviewed_at = $4
             WHERE id = $1 AND status = $5
             RETURNING {}",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(withdrawal_id)
            .bind(WithdrawalStatus::Approved.code())
            .bind(reviewer)
            .bind(reviewed_at)
            .bind(WithdrawalStatus::Pending.code())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not pending",
                withdrawal_id
            )));
        };
        let withdrawal: Withdrawal = row.try_into()?;

        let debited = sqlx::query(
            "UPDATE merchants SET balance = balance - $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND balance >= $2",
        )
        .bind(withdrawal.merchant_id)
        .bind(withdrawal.amount)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(GatewayError::InsufficientBalance);
        }

        tx.commit().await?;
        Ok(withdrawal)
    }

    async fn reject_pending_withdrawal(
        &self,
        withdrawal_id: i64,
        reviewer: &str,
        reason: &str,
        reviewed_at: i64,
    ) -> GatewayResult<()> {
        let result = sqlx::query(
            "UPDATE merchant_withdrawals
             SET status = $2, reviewed_by = $3, reject_reason = $4, reviewed_at = $5
             WHERE id = $1 AND status = $6",
        )
        .bind(withdrawal_id)
        .bind(WithdrawalStatus::Rejected.code())
        .bind(reviewer)
        .bind(reason)
        .bind(reviewed_at)
        .bind(WithdrawalStatus::Pending.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not pending",
                withdrawal_id
            )));
        }
        Ok(())
    }

    async fn complete_withdrawal(&self, withdrawal_id: i64, tx_hash: &str) -> GatewayResult<()> {
        let result = sqlx::query(
            "UPDATE merchant_withdrawals SET status = $2, tx_hash = $3
             WHERE id = $1 AND status = $4",
        )
        .bind(withdrawal_id)
        .bind(WithdrawalStatus::Completed.code())
        .bind(tx_hash)
        .bind(WithdrawalStatus::Approved.code())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not approved",
                withdrawal_id
            )));
        }
        Ok(())
    }

    async fn reject_approved_withdrawal(
        &self,
        withdrawal_id: i64,
        reason: &str,
    ) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;

        let rejected: Option<(i64, Decimal)> = sqlx::query_as(
            "UPDATE merchant_withdrawals SET status = $2, reject_reason = $3
             WHERE id = $1 AND status = $4
             RETURNING merchant_id, amount",
        )
        .bind(withdrawal_id)
        .bind(WithdrawalStatus::Rejected.code())
        .bind(reason)
        .bind(WithdrawalStatus::Approved.code())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((merchant_id, amount)) = rejected else {
            tx.rollback().await?;
            return Err(GatewayError::InvalidState(format!(
                "withdrawal {} is not approved",
                withdrawal_id
            )));
        };

        sqlx::query(
            "UPDATE merchants SET balance = balance + $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(merchant_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

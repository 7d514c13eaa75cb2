// 授权与扣款数据访问 Repository

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::{
    domain::authorization::{
        Authorization, AuthorizationStatus, Deduction, DeductionStatus, NewAuthorization,
        NewDeduction, SealedPassword, SettlementOutcome,
    },
    error::{GatewayError, GatewayResult},
};

// ============ Repository Trait ============

#[async_trait]
pub trait AuthorizationRepository: Send + Sync {
    /// 创建授权（状态 Pending，remaining = authorized）
    async fn create(&self, params: NewAuthorization) -> GatewayResult<Authorization>;

    async fn find_by_auth_no(&self, auth_no: &str) -> GatewayResult<Option<Authorization>>;

    async fn find_by_password(&self, password: &str) -> GatewayResult<Option<Authorization>>;

    /// 按状态列出授权（新到旧）
    async fn list_by_status(
        &self,
        status: AuthorizationStatus,
        limit: i64,
    ) -> GatewayResult<Vec<Authorization>>;

    /// 记录待确认授权的客户钱包，供后台轮询使用
    async fn bind_customer_wallet(&self, auth_id: i64, customer_wallet: &str) -> GatewayResult<()>;

    /// Pending -> Active，返回 false 表示状态已被其他请求改变
    async fn activate(
        &self,
        auth_id: i64,
        customer_wallet: &str,
        tx_hash: Option<&str>,
        authorize_time: i64,
        sealed: Option<&SealedPassword>,
    ) -> GatewayResult<bool>;

    /// 条件状态更新（仅当当前状态为 from）
    async fn update_status(
        &self,
        auth_id: i64,
        from: AuthorizationStatus,
        to: AuthorizationStatus,
    ) -> GatewayResult<bool>;

    /// 将已过期的 Pending / Active 授权标记为 Expired，返回受影响行数
    async fn expire_overdue(&self, now: i64) -> GatewayResult<u64>;

    /// 已绑定客户钱包但未加密保存密码的授权
    async fn list_unsealed(&self, limit: i64) -> GatewayResult<Vec<Authorization>>;

    async fn set_sealed_password(&self, auth_id: i64, sealed: &SealedPassword)
        -> GatewayResult<()>;

    /// 原子预占额度并写入 Processing 扣款记录，返回扣款记录与预占后剩余额度
    async fn reserve_deduction(&self, params: NewDeduction) -> GatewayResult<(Deduction, Decimal)>;

    /// Processing -> Success：记录交易哈希、商户入账、必要时标记 Depleted（同一事务）
    async fn complete_deduction(
        &self,
        deduction_id: i64,
        tx_hash: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome>;

    /// Processing -> Failed：记录原因并退回预占额度；
    /// 退回后仍不超过 epsilon、无在途扣款且已有成功扣款时标记 Depleted（同一事务）
    async fn fail_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome>;

    async fn find_deduction(&self, deduct_no: &str) -> GatewayResult<Option<Deduction>>;

    async fn list_deductions_by_password(
        &self,
        password: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Deduction>>;

    async fn list_deductions_by_auth(&self, auth_id: i64) -> GatewayResult<Vec<Deduction>>;
}

// ============ 行映射 ============

const AUTH_COLUMNS: &str = "id, auth_no, password, password_ciphertext, password_nonce, password_salt, \
     customer_wallet, merchant_wallet, chain, authorized_usdt, used_usdt, remaining_usdt, status, \
     table_no, customer_name, remark, tx_hash, authorize_time, expire_time, created_at, updated_at";

const DEDUCTION_COLUMNS: &str = "id, deduct_no, auth_id, auth_no, password, amount_usdt, amount_cny, \
     tx_hash, status, fail_reason, product_info, operator_id, deduct_time, created_at";

#[derive(sqlx::FromRow)]
struct AuthorizationRow {
    id: i64,
    auth_no: String,
    password: String,
    password_ciphertext: Option<Vec<u8>>,
    password_nonce: Option<Vec<u8>>,
    password_salt: Option<Vec<u8>>,
    customer_wallet: String,
    merchant_wallet: String,
    chain: String,
    authorized_usdt: Decimal,
    used_usdt: Decimal,
    remaining_usdt: Decimal,
    status: i16,
    table_no: String,
    customer_name: String,
    remark: String,
    tx_hash: Option<String>,
    authorize_time: Option<i64>,
    expire_time: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<AuthorizationRow> for Authorization {
    type Error = GatewayError;

    fn try_from(row: AuthorizationRow) -> Result<Self, Self::Error> {
        let status = AuthorizationStatus::from_code(row.status).ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!(
                "authorization {} has unknown status {}",
                row.auth_no,
                row.status
            ))
        })?;
        let sealed_password = match (row.password_ciphertext, row.password_nonce, row.password_salt)
        {
            (Some(ciphertext), Some(nonce), Some(salt)) => Some(SealedPassword {
                ciphertext,
                nonce,
                salt,
            }),
            _ => None,
        };

        Ok(Authorization {
            id: row.id,
            auth_no: row.auth_no,
            password: row.password,
            sealed_password,
            customer_wallet: row.customer_wallet,
            merchant_wallet: row.merchant_wallet,
            chain: row.chain,
            authorized_usdt: row.authorized_usdt,
            used_usdt: row.used_usdt,
            remaining_usdt: row.remaining_usdt,
            status,
            table_no: row.table_no,
            customer_name: row.customer_name,
            remark: row.remark,
            tx_hash: row.tx_hash,
            authorize_time: row.authorize_time,
            expire_time: row.expire_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeductionRow {
    id: i64,
    deduct_no: String,
    auth_id: i64,
    auth_no: String,
    password: String,
    amount_usdt: Decimal,
    amount_cny: Decimal,
    tx_hash: Option<String>,
    status: i16,
    fail_reason: Option<String>,
    product_info: String,
    operator_id: String,
    deduct_time: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<DeductionRow> for Deduction {
    type Error = GatewayError;

    fn try_from(row: DeductionRow) -> Result<Self, Self::Error> {
        let status = DeductionStatus::from_code(row.status).ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!(
                "deduction {} has unknown status {}",
                row.deduct_no,
                row.status
            ))
        })?;
        Ok(Deduction {
            id: row.id,
            deduct_no: row.deduct_no,
            auth_id: row.auth_id,
            auth_no: row.auth_no,
            password: row.password,
            amount_usdt: row.amount_usdt,
            amount_cny: row.amount_cny,
            tx_hash: row.tx_hash,
            status,
            fail_reason: row.fail_reason,
            product_info: row.product_info,
            operator_id: row.operator_id,
            deduct_time: row.deduct_time,
            created_at: row.created_at,
        })
    }
}

fn collect_auths(rows: Vec<AuthorizationRow>) -> GatewayResult<Vec<Authorization>> {
    rows.into_iter().map(Authorization::try_from).collect()
}

fn collect_deductions(rows: Vec<DeductionRow>) -> GatewayResult<Vec<Deduction>> {
    rows.into_iter().map(Deduction::try_from).collect()
}

// ============ PostgreSQL 实现 ============

pub struct PgAuthorizationRepository {
    pool: PgPool,
}

impl PgAuthorizationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &str, value: &str) -> GatewayResult<Option<Authorization>> {
        let sql = format!("SELECT {} FROM authorizations WHERE {} = $1", AUTH_COLUMNS, column);
        let row = sqlx::query_as::<_, AuthorizationRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Authorization::try_from).transpose()
    }
}

#[async_trait]
impl AuthorizationRepository for PgAuthorizationRepository {
    async fn create(&self, params: NewAuthorization) -> GatewayResult<Authorization> {
        let sql = format!(
            "INSERT INTO authorizations
                (auth_no, password, merchant_wallet, chain, authorized_usdt, used_usdt,
                 remaining_usdt, status, table_no, customer_name, remark, expire_time)
             VALUES ($1, $2, $3, $4, $5, 0, $5, $6, $7, $8, $9, $10)
             RETURNING {}",
            AUTH_COLUMNS
        );
        let row = sqlx::query_as::<_, AuthorizationRow>(&sql)
            .bind(&params.auth_no)
            .bind(&params.password)
            .bind(&params.merchant_wallet)
            .bind(&params.chain)
            .bind(params.authorized_usdt)
            .bind(AuthorizationStatus::Pending.code())
            .bind(&params.table_no)
            .bind(&params.customer_name)
            .bind(&params.remark)
            .bind(params.expire_time)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn find_by_auth_no(&self, auth_no: &str) -> GatewayResult<Option<Authorization>> {
        self.find_one("auth_no", auth_no).await
    }

    async fn find_by_password(&self, password: &str) -> GatewayResult<Option<Authorization>> {
        self.find_one("password", password).await
    }

    async fn list_by_status(
        &self,
        status: AuthorizationStatus,
        limit: i64,
    ) -> GatewayResult<Vec<Authorization>> {
        let sql = format!(
            "SELECT {} FROM authorizations WHERE status = $1 ORDER BY id DESC LIMIT $2",
            AUTH_COLUMNS
        );
        let rows = sqlx::query_as::<_, AuthorizationRow>(&sql)
            .bind(status.code())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect_auths(rows)
    }

    async fn bind_customer_wallet(&self, auth_id: i64, customer_wallet: &str) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE authorizations SET customer_wallet = $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND status = $3",
        )
        .bind(auth_id)
        .bind(customer_wallet)
        .bind(AuthorizationStatus::Pending.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate(
        &self,
        auth_id: i64,
        customer_wallet: &str,
        tx_hash: Option<&str>,
        authorize_time: i64,
        sealed: Option<&SealedPassword>,
    ) -> GatewayResult<bool> {
        let result = sqlx::query(
            "UPDATE authorizations
             SET status = $2, customer_wallet = $3, tx_hash = COALESCE($4, tx_hash),
                 authorize_time = $5,
                 password_ciphertext = COALESCE($6, password_ciphertext),
                 password_nonce = COALESCE($7, password_nonce),
                 password_salt = COALESCE($8, password_salt),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND status = $9",
        )
        .bind(auth_id)
        .bind(AuthorizationStatus::Active.code())
        .bind(customer_wallet)
        .bind(tx_hash)
        .bind(authorize_time)
        .bind(sealed.map(|s| s.ciphertext.clone()))
        .bind(sealed.map(|s| s.nonce.clone()))
        .bind(sealed.map(|s| s.salt.clone()))
        .bind(AuthorizationStatus::Pending.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_status(
        &self,
        auth_id: i64,
        from: AuthorizationStatus,
        to: AuthorizationStatus,
    ) -> GatewayResult<bool> {
        from.validate_transition(to)?;
        let result = sqlx::query(
            "UPDATE authorizations SET status = $3, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND status = $2",
        )
        .bind(auth_id)
        .bind(from.code())
        .bind(to.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_overdue(&self, now: i64) -> GatewayResult<u64> {
        let result = sqlx::query(
            "UPDATE authorizations SET status = $1, updated_at = CURRENT_TIMESTAMP
             WHERE status IN ($2, $3) AND expire_time > 0 AND expire_time < $4",
        )
        .bind(AuthorizationStatus::Expired.code())
        .bind(AuthorizationStatus::Pending.code())
        .bind(AuthorizationStatus::Active.code())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_unsealed(&self, limit: i64) -> GatewayResult<Vec<Authorization>> {
        let sql = format!(
            "SELECT {} FROM authorizations
             WHERE password_ciphertext IS NULL AND customer_wallet <> ''
             ORDER BY id LIMIT $1",
            AUTH_COLUMNS
        );
        let rows = sqlx::query_as::<_, AuthorizationRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect_auths(rows)
    }

    async fn set_sealed_password(
        &self,
        auth_id: i64,
        sealed: &SealedPassword,
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE authorizations
             SET password_ciphertext = $2, password_nonce = $3, password_salt = $4,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(auth_id)
        .bind(&sealed.ciphertext)
        .bind(&sealed.nonce)
        .bind(&sealed.salt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reserve_deduction(&self, params: NewDeduction) -> GatewayResult<(Deduction, Decimal)> {
        if params.amount_usdt <= Decimal::ZERO {
            return Err(GatewayError::InvalidInput(
                "deduction amount must be positive".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let reserved: Option<(Decimal,)> = sqlx::query_as(
            "UPDATE authorizations
             SET used_usdt = used_usdt + $2, remaining_usdt = remaining_usdt - $2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1 AND status = $3 AND remaining_usdt >= $2
             RETURNING remaining_usdt",
        )
        .bind(params.auth_id)
        .bind(params.amount_usdt)
        .bind(AuthorizationStatus::Active.code())
        .fetch_optional(&mut *tx)
        .await?;

        let remaining = match reserved {
            Some((remaining,)) => remaining,
            None => {
                let current: Option<(i16, Decimal)> = sqlx::query_as(
                    "SELECT status, remaining_usdt FROM authorizations WHERE id = $1",
                )
                .bind(params.auth_id)
                .fetch_optional(&mut *tx)
                .await?;
                tx.rollback().await?;

                return Err(match current {
                    None => GatewayError::InvalidCredential,
                    Some((status, _)) if status != AuthorizationStatus::Active.code() => {
                        GatewayError::InvalidState(format!(
                            "authorization {} is not active",
                            params.auth_no
                        ))
                    }
                    Some((_, remaining)) => GatewayError::InsufficientQuota {
                        remaining,
                        requested: params.amount_usdt,
                    },
                });
            }
        };

        let sql = format!(
            "INSERT INTO deductions
                (deduct_no, auth_id, auth_no, password, amount_usdt, amount_cny, status,
                 product_info, operator_id, deduct_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {}",
            DEDUCTION_COLUMNS
        );
        let row = sqlx::query_as::<_, DeductionRow>(&sql)
            .bind(&params.deduct_no)
            .bind(params.auth_id)
            .bind(&params.auth_no)
            .bind(&params.password)
            .bind(params.amount_usdt)
            .bind(params.amount_cny)
            .bind(DeductionStatus::Processing.code())
            .bind(&params.product_info)
            .bind(&params.operator_id)
            .bind(params.deduct_time)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((row.try_into()?, remaining))
    }

    async fn complete_deduction(
        &self,
        deduction_id: i64,
        tx_hash: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;

        let settled: Option<(i64, Decimal)> = sqlx::query_as(
            "UPDATE deductions SET status = $2, tx_hash = $3
             WHERE id = $1 AND status = $4
             RETURNING auth_id, amount_usdt",
        )
        .bind(deduction_id)
        .bind(DeductionStatus::Success.code())
        .bind(tx_hash)
        .bind(DeductionStatus::Processing.code())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((auth_id, amount)) = settled else {
            tx.rollback().await?;
            return Err(GatewayError::InvalidState(format!(
                "deduction {} is not processing",
                deduction_id
            )));
        };

        let (merchant_wallet, remaining, status): (String, Decimal, i16) = sqlx::query_as(
            "SELECT merchant_wallet, remaining_usdt, status FROM authorizations
             WHERE id = $1 FOR UPDATE",
        )
        .bind(auth_id)
        .fetch_one(&mut *tx)
        .await?;

        // 仍有在途扣款时不标记耗尽，失败退回后授权需保持可用
        let (in_flight,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deductions WHERE auth_id = $1 AND status = $2")
                .bind(auth_id)
                .bind(DeductionStatus::Processing.code())
                .fetch_one(&mut *tx)
                .await?;

        let mut depleted = false;
        if remaining <= depletion_epsilon
            && in_flight == 0
            && status == AuthorizationStatus::Active.code()
        {
            sqlx::query(
                "UPDATE authorizations SET status = $2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND status = $3",
            )
            .bind(auth_id)
            .bind(AuthorizationStatus::Depleted.code())
            .bind(AuthorizationStatus::Active.code())
            .execute(&mut *tx)
            .await?;
            depleted = true;
        }

        let credited = sqlx::query(
            "UPDATE merchants SET balance = balance + $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = (SELECT id FROM merchants WHERE LOWER(wallet_token) = LOWER($1)
                         ORDER BY id LIMIT 1)",
        )
        .bind(&merchant_wallet)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SettlementOutcome {
            remaining_usdt: remaining,
            depleted,
            merchant_credited: credited.rows_affected() == 1,
        })
    }

    async fn fail_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        depletion_epsilon: Decimal,
    ) -> GatewayResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;

        let failed: Option<(i64, Decimal)> = sqlx::query_as(
            "UPDATE deductions SET status = $2, fail_reason = $3
             WHERE id = $1 AND status = $4
             RETURNING auth_id, amount_usdt",
        )
        .bind(deduction_id)
        .bind(DeductionStatus::Failed.code())
        .bind(reason)
        .bind(DeductionStatus::Processing.code())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((auth_id, amount)) = failed else {
            tx.rollback().await?;
            return Err(GatewayError::InvalidState(format!(
                "deduction {} is not processing",
                deduction_id
            )));
        };

        let (remaining, status): (Decimal, i16) = sqlx::query_as(
            "UPDATE authorizations
             SET used_usdt = used_usdt - $2, remaining_usdt = remaining_usdt + $2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1
             RETURNING remaining_usdt, status",
        )
        .bind(auth_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        // 最后一笔在途扣款失败时，由这里补做耗尽判定
        let (in_flight, settled): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status = $2), COUNT(*) FILTER (WHERE status = $3)
             FROM deductions WHERE auth_id = $1",
        )
        .bind(auth_id)
        .bind(DeductionStatus::Processing.code())
        .bind(DeductionStatus::Success.code())
        .fetch_one(&mut *tx)
        .await?;

        let mut depleted = false;
        if remaining <= depletion_epsilon
            && in_flight == 0
            && settled > 0
            && status == AuthorizationStatus::Active.code()
        {
            sqlx::query(
                "UPDATE authorizations SET status = $2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1 AND status = $3",
            )
            .bind(auth_id)
            .bind(AuthorizationStatus::Depleted.code())
            .bind(AuthorizationStatus::Active.code())
            .execute(&mut *tx)
            .await?;
            depleted = true;
        }

        tx.commit().await?;

        Ok(SettlementOutcome {
            remaining_usdt: remaining,
            depleted,
            merchant_credited: false,
        })
    }

    async fn find_deduction(&self, deduct_no: &str) -> GatewayResult<Option<Deduction>> {
        let sql = format!(
            "SELECT {} FROM deductions WHERE deduct_no = $1",
            DEDUCTION_COLUMNS
        );
        let row = sqlx::query_as::<_, DeductionRow>(&sql)
            .bind(deduct_no)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Deduction::try_from).transpose()
    }

    async fn list_deductions_by_password(
        &self,
        password: &str,
        limit: i64,
    ) -> GatewayResult<Vec<Deduction>> {
        let sql = format!(
            "SELECT {} FROM deductions WHERE password = $1 ORDER BY id DESC LIMIT $2",
            DEDUCTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeductionRow>(&sql)
            .bind(password)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        collect_deductions(rows)
    }

    async fn list_deductions_by_auth(&self, auth_id: i64) -> GatewayResult<Vec<Deduction>> {
        let sql = format!(
            "SELECT {} FROM deductions WHERE auth_id = $1 ORDER BY id DESC",
            DEDUCTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeductionRow>(&sql)
            .bind(auth_id)
            .fetch_all(&self.pool)
            .await?;
        collect_deductions(rows)
    }
}

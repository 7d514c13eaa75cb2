//! SQLx Postgres 连接池初始化与健康检查
//!
//! 用法：
//! let pool = init_pool(&config.database).await?;

use std::time::Duration;

use crate::config::DatabaseConfig;

pub type PgPool = sqlx::Pool<sqlx::Postgres>;

/// 初始化连接池✅
pub async fn init_pool(cfg: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let max_conns = cfg.max_connections.clamp(1, 200);
    let min_conns = cfg.min_connections.min(max_conns);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_conns)
        .min_connections(min_conns)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
        .test_before_acquire(true)
        .connect(&cfg.url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;

    health_check(&pool).await?;
    Ok(pool)
}

/// 延迟连接（首次使用时才建立连接），便于无数据库环境启动工具
pub fn init_pool_lazy(cfg: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(cfg.max_connections.clamp(1, 200))
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .connect_lazy(&cfg.url)
}

pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    let _: (chrono::DateTime<chrono::Utc>,) = sqlx::query_as("SELECT CURRENT_TIMESTAMP")
        .fetch_one(pool)
        .await?;
    Ok(())
}

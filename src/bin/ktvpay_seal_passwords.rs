//! 为历史授权补写加密访问密码
//!
//! 处理已绑定客户钱包但尚未加密的授权，需要配置 AUTH_MASTER_KEY。
//! 用法：ktvpay_seal_passwords [batch_size]

use std::sync::Arc;

use anyhow::{Context, Result};
use ktvpay::{
    app_state::AppState,
    config::Config,
    infrastructure::{db::init_pool, logging::init_logging},
};

const DEFAULT_BATCH: i64 = 200;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env_and_file(std::env::var("CONFIG_PATH").ok().as_deref())?;
    config.validate()?;
    init_logging(&config.logging)?;

    let batch = std::env::args()
        .nth(1)
        .map(|s| s.parse::<i64>().context("batch size must be an integer"))
        .transpose()?
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BATCH);

    let pool = init_pool(&config.database).await?;
    let state = AppState::new(pool.clone(), Arc::new(config))?;

    let mut total = 0usize;
    loop {
        let sealed = state.authorizations.seal_password_backlog(batch).await?;
        total += sealed;
        tracing::info!(batch = sealed, total, "sealed access passwords");
        if (sealed as i64) < batch {
            break;
        }
    }

    tracing::info!(total, "password sealing finished");
    pool.close().await;
    Ok(())
}

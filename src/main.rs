//! KtvPay 网关守护进程
//! 加载配置 → 日志 → 数据库与迁移 → 装配服务 → 启动后台任务 → 等待退出信号

use std::sync::Arc;

use anyhow::{Context, Result};
use ktvpay::{
    app_state::AppState,
    config::Config,
    infrastructure::{db::init_pool, event_bus::TracingEventHandler, logging::init_logging},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量与配置文件
    dotenvy::dotenv().ok();
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate().context("invalid configuration")?;

    // 2. 初始化日志
    init_logging(&config.logging)?;
    tracing::info!("Starting KtvPay authorization gateway");

    // 3. 连接数据库
    let pool = init_pool(&config.database)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Database connected");

    // 4. 运行数据库迁移
    if std::env::var("SKIP_MIGRATIONS").is_err() {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("database migrations failed")?;
        tracing::info!("Database migrations completed");
    } else {
        tracing::info!("Database migrations skipped (SKIP_MIGRATIONS set)");
    }

    // 5. 装配服务
    let config = Arc::new(config);
    let state = AppState::new(pool.clone(), config.clone())?;
    state.events.subscribe(Arc::new(TracingEventHandler)).await;

    let chains: Vec<&str> = state.registry.all().map(|c| c.name.as_str()).collect();
    tracing::info!(chains = ?chains, rate = %config.gateway.effective_usdt_rate(), "Gateway ready");

    // 6. 后台任务
    if config.gateway.approval_monitor_enabled {
        let monitor = state.monitor.clone();
        tokio::spawn(async move {
            monitor.start_background_monitor().await;
        });
    } else {
        tracing::info!("Approval monitor disabled");
    }

    // 7. 等待退出信号
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, closing database pool");
    pool.close().await;

    Ok(())
}

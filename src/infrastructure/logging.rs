//! 日志系统配置模块
//! 支持结构化日志（json）与文本日志，级别可被 RUST_LOG 覆盖

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.format == "json" {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()
    };

    result.map_err(|e| anyhow::anyhow!("failed to init logging: {}", e))
}

/// 测试与工具程序使用：重复初始化时静默忽略
pub fn try_init_for_tests() {
    let _ = Registry::default()
        .with(EnvFilter::new("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

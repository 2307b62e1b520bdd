//! 日志系统配置模块
//! 支持结构化日志、日志级别配置和按天轮转的文件日志

use std::path::Path;

use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// 初始化日志系统
///
/// 开启文件日志时返回 WorkerGuard，调用方需持有到进程退出，否则缓冲的日志会丢失
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG 优先于配置
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let json = config.format == "json";

    let stdout_layer = if json {
        fmt::layer()
            .json()
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .boxed()
    };

    if !config.enable_file_logging {
        Registry::default()
            .with(filter)
            .with(stdout_layer)
            .try_init()?;
        return Ok(None);
    }

    let log_path = Path::new(
        config
            .log_file_path
            .as_deref()
            .unwrap_or("./logs/oxledger.log"),
    );
    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("./logs"));
    let file_name = log_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("oxledger.log");

    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let file_layer = if json {
        fmt::layer()
            .json()
            .with_writer(non_blocking_appender)
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking_appender)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .boxed()
    };

    Registry::default()
        .with(filter)
        .with(file_layer.and_then(stdout_layer))
        .try_init()?;

    Ok(Some(guard))
}

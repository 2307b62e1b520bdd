//! SQLx Postgres 连接池初始化与健康检查
//!
//! 用法：
//! let pool = init_pool(&config.database).await?;
//! health_check(&pool).await?;

use std::time::Duration;

use crate::config::DatabaseConfig;

pub type PgPool = sqlx::Pool<sqlx::Postgres>;

/// 按配置初始化连接池
///
/// - max_connections: 16(默认)，上限 200
/// - idle_timeout: 300秒，避免连接泄漏
/// - max_lifetime: 1800秒，定期刷新
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    connect(&config.url, config).await
}

/// 使用显式 URL 连接（测试用独立数据库）
pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let max_conns = config.max_connections.clamp(1, 200);
    let min_conns = config.min_connections.min(max_conns);

    let pool_opts = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_conns)
        .min_connections(min_conns)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true);

    let pool = pool_opts.connect(database_url).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to connect to Postgres");
        e
    })?;

    // 验证连接
    health_check(&pool).await?;

    Ok(pool)
}

/// 使用简单的 SELECT CURRENT_TIMESTAMP 验证连接和数据库响应
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    let _: (chrono::DateTime<chrono::Utc>,) = sqlx::query_as("SELECT CURRENT_TIMESTAMP")
        .fetch_one(pool)
        .await?;
    Ok(())
}

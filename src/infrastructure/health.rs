//! 健康检查模块
//! 就绪探针检查数据库和 Redis（未配置的组件标记为 skipped）

use serde::Serialize;

use crate::infrastructure::{db::PgPool, distributed_lock::DistributedLock};

/// 健康检查结果
#[derive(Debug, Serialize)]
pub struct HealthCheckResult {
    pub status: String, // "healthy" | "unhealthy"
    pub components: ComponentHealth,
    pub timestamp: String,
}

/// 组件健康状态
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub database: ComponentStatus,
    pub redis: ComponentStatus,
}

/// 组件状态
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub status: String, // "ok" | "error" | "skipped"
    pub message: String,
    pub latency_ms: Option<u64>,
}

impl ComponentStatus {
    fn skipped(message: &str) -> Self {
        Self {
            status: "skipped".to_string(),
            message: message.to_string(),
            latency_ms: None,
        }
    }

    fn is_error(&self) -> bool {
        self.status == "error"
    }
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// 执行就绪检查
pub async fn check_health(
    pool: Option<&PgPool>,
    redis: Option<&DistributedLock>,
) -> HealthCheckResult {
    let (db_status, redis_status) = tokio::join!(check_database(pool), check_redis(redis));

    let status = if db_status.is_error() || redis_status.is_error() {
        "unhealthy"
    } else {
        "healthy"
    };

    HealthCheckResult {
        status: status.to_string(),
        components: ComponentHealth {
            database: db_status,
            redis: redis_status,
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// 检查数据库健康状态
async fn check_database(pool: Option<&PgPool>) -> ComponentStatus {
    let Some(pool) = pool else {
        return ComponentStatus::skipped("In-memory storage");
    };

    let start = std::time::Instant::now();
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => ComponentStatus {
            status: "ok".to_string(),
            message: "Database connection healthy".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => ComponentStatus {
            status: "error".to_string(),
            message: format!("Database error: {}", e),
            latency_ms: None,
        },
    }
}

/// 检查Redis健康状态
async fn check_redis(redis: Option<&DistributedLock>) -> ComponentStatus {
    let Some(redis) = redis else {
        return ComponentStatus::skipped("Redis not configured");
    };

    let start = std::time::Instant::now();
    match redis.ping().await {
        Ok(_) => ComponentStatus {
            status: "ok".to_string(),
            message: "Redis connection healthy".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => ComponentStatus {
            status: "error".to_string(),
            message: format!("Redis error: {}", e),
            latency_ms: None,
        },
    }
}

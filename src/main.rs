//! oxledger 主入口

use std::sync::Arc;

use anyhow::{Context, Result};
use oxledger::{
    api,
    app_state::AppState,
    config::{Config, StorageBackend},
    infrastructure::{db, distributed_lock::DistributedLock, logging::init_logging},
    repository::{MemoryStore, PgStore, SettlementStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量与配置文件
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate()?;

    // 2. 初始化日志（文件日志的 guard 需持有到进程退出）
    let _log_guard = init_logging(&config.logging).map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.wallet.network,
        storage = ?config.storage.backend,
        "Starting oxledger settlement engine"
    );

    // 3. 主种子（真实货币功能开启时缺失即退出）
    let derivation = config.load_key_derivation()?;
    if derivation.is_none() {
        tracing::warn!("No master seed configured, real-money features disabled");
    }

    // 4. 存储
    let (store, pool): (Arc<dyn SettlementStore>, _) = match config.storage.backend {
        StorageBackend::Postgres => {
            let pool = db::init_pool(&config.database)
                .await
                .context("Failed to connect to database")?;
            let store = PgStore::new(pool.clone(), config.ledger.lock_timeout_ms);

            if std::env::var("SKIP_MIGRATIONS").is_err() {
                store.migrate().await.context("Database migrations failed")?;
                tracing::info!("Database migrations completed");
            } else {
                tracing::info!("Database migrations skipped (SKIP_MIGRATIONS=1)");
            }
            (Arc::new(store), Some(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, balances are lost on restart");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    // 5. Redis（可选，多实例时协调后台任务）
    let distributed_lock = match &config.redis.url {
        Some(url) => {
            let lock = DistributedLock::new(url, config.redis.namespace.clone())
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Redis distributed lock initialized");
            Some(Arc::new(lock))
        }
        None => None,
    };

    // 6. 组装服务
    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        pool,
        distributed_lock,
        derivation,
    )?);

    // 7. 后台任务
    if let Some(real_money) = &state.real_money {
        if config.deposit_watcher.enabled {
            let watcher = real_money.deposit_watcher.clone();
            tokio::spawn(async move {
                watcher.start_background_scanner().await;
            });
        }

        if config.reconciliation.enabled {
            let withdrawals = real_money.withdrawals.clone();
            tokio::spawn(async move {
                withdrawals.start_background_reconciler().await;
            });
        }

        match real_money.withdrawals.hot_wallet_status().await {
            Ok(status) => tracing::info!(
                address = %status.address,
                confirmed_balance_sats = status.confirmed_balance_sats,
                "Hot wallet status"
            ),
            Err(e) => tracing::warn!(error = %e, "Hot wallet status unavailable"),
        }
    }

    // 8. 健康检查服务
    let app = api::routes(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    tracing::info!(bind_addr = %config.server.bind_addr, "Health endpoints listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

//! 配置管理模块
//! 支持从环境变量和配置文件加载配置
//!
//! 主种子（WALLET_SEED）只从环境变量读取，不出现在配置文件中

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{KeyDerivation, WalletSeed},
    error::EngineError,
};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 应用配置结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub wallet: WalletConfig,
    pub chain: ChainConfig,
    pub ledger: LedgerConfig,
    pub deposit_watcher: DepositWatcherConfig,
    pub reconciliation: ReconciliationConfig,
    pub rates: RatesConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

/// Redis配置（可选，未配置时按单实例运行）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub namespace: String,
}

/// 服务器配置（仅健康检查）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_file_logging: bool,
    pub log_file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    /// 进程内存储，仅用于开发和测试
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

/// 托管钱包配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// bitcoin | testnet | signet | regtest
    pub network: String,
    /// 热钱包（出款地址）的派生索引
    pub hot_wallet_index: u32,
    /// BIP84 account 层级
    pub derivation_account: u32,
    /// 关闭时不要求主种子，真实货币充值/提现不可用
    pub real_money_enabled: bool,
}

/// 链数据服务配置（Esplora 兼容 API）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub esplora_url: String,
    pub request_timeout_secs: u64,
    pub broadcast_timeout_secs: u64,
    /// 费率目标确认块数（/fee-estimates 的 key）
    pub fee_target_blocks: u16,
    pub fallback_fee_rate: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// 账本配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// 平台手续费（基点，500 = 5%）
    pub platform_fee_bps: u32,
    pub play_money_grant: i64,
    pub daily_bonus: i64,
    pub daily_bonus_interval_secs: u64,
    pub lock_timeout_ms: u64,
    pub conflict_retries: u32,
    /// 最低提现金额（法币最小单位）
    pub min_withdrawal: i64,
    pub dust_threshold_sats: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositWatcherConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// 单次扫描中并行查询的地址数
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// 广播后多久才开始对账
    pub min_age_secs: u64,
    pub batch_size: i64,
}

/// 汇率配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
    pub provider_url: String,
    /// 法币代码（小写，如 eur）
    pub fiat_currency: String,
    /// 固定汇率（1 BTC 的法币价格），设置后不访问外部服务
    pub fixed_btc_price: Option<String>,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://postgres@localhost:5432/oxledger".into()),
            max_connections: env_or("DB_MAX_CONNS", 16),
            min_connections: env_or("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_or("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            namespace: std::env::var("REDIS_NAMESPACE").unwrap_or_else(|_| "oxledger".into()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            enable_file_logging: env_flag("LOG_FILE_ENABLED", false),
            log_file_path: std::env::var("LOG_FILE_PATH").ok(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let backend = match std::env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            _ => StorageBackend::Postgres,
        };
        Self { backend }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: std::env::var("BITCOIN_NETWORK").unwrap_or_else(|_| "bitcoin".into()),
            hot_wallet_index: env_or("HOT_WALLET_INDEX", 0),
            derivation_account: env_or("DERIVATION_ACCOUNT", 0),
            real_money_enabled: env_flag("REAL_MONEY_ENABLED", true),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            esplora_url: std::env::var("BITCOIN_API_URL")
                .unwrap_or_else(|_| "https://blockstream.info/api".into()),
            request_timeout_secs: env_or("CHAIN_REQUEST_TIMEOUT_SECS", 10),
            broadcast_timeout_secs: env_or("CHAIN_BROADCAST_TIMEOUT_SECS", 20),
            fee_target_blocks: env_or("FEE_TARGET_BLOCKS", 3),
            fallback_fee_rate: env_or("FALLBACK_FEE_RATE", 10),
            max_retries: env_or("CHAIN_MAX_RETRIES", 3),
            retry_delay_ms: env_or("CHAIN_RETRY_DELAY_MS", 1000),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: env_or("PLATFORM_FEE_BPS", 500),
            play_money_grant: env_or("PLAY_MONEY_GRANT", 100),
            daily_bonus: env_or("DAILY_BONUS", 50),
            daily_bonus_interval_secs: env_or("DAILY_BONUS_INTERVAL_SECS", 86_400),
            lock_timeout_ms: env_or("LEDGER_LOCK_TIMEOUT_MS", 5_000),
            conflict_retries: env_or("LEDGER_CONFLICT_RETRIES", 3),
            min_withdrawal: env_or("MIN_WITHDRAWAL", 1_000),
            dust_threshold_sats: env_or("DUST_THRESHOLD_SATS", 546),
        }
    }
}

impl Default for DepositWatcherConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("DEPOSIT_WATCHER_ENABLED", true),
            interval_secs: env_or("DEPOSIT_SCAN_INTERVAL_SECS", 60),
            concurrency: env_or("DEPOSIT_SCAN_CONCURRENCY", 4),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("RECONCILIATION_ENABLED", true),
            interval_secs: env_or("RECONCILIATION_INTERVAL_SECS", 120),
            min_age_secs: env_or("RECONCILIATION_MIN_AGE_SECS", 60),
            batch_size: env_or("RECONCILIATION_BATCH_SIZE", 50),
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            provider_url: std::env::var("RATES_API_URL")
                .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".into()),
            fiat_currency: std::env::var("FIAT_CURRENCY").unwrap_or_else(|_| "eur".into()),
            fixed_btc_price: std::env::var("FIXED_BTC_PRICE").ok(),
            cache_ttl_secs: env_or("RATES_CACHE_TTL_SECS", 300),
            request_timeout_secs: env_or("RATES_REQUEST_TIMEOUT_SECS", 10),
        }
    }
}

impl WalletConfig {
    pub fn network(&self) -> Result<Network, EngineError> {
        Network::from_str(&self.network).map_err(|_| {
            EngineError::ConfigurationFatal(format!("unknown bitcoin network: {}", self.network))
        })
    }
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self::default()
    }

    /// 从配置文件加载配置（缺省字段回落到环境变量默认值）
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) if path.as_ref().exists() => Self::from_file(path),
            _ => Ok(Self::from_env()),
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), EngineError> {
        let fatal = |msg: &str| Err(EngineError::ConfigurationFatal(msg.to_string()));

        if self.storage.backend == StorageBackend::Postgres
            && !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            return fatal("DATABASE_URL must start with postgres:// or postgresql://");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return fatal("LOG_LEVEL must be one of: trace, debug, info, warn, error");
        }

        if self.logging.format != "json" && self.logging.format != "text" {
            return fatal("LOG_FORMAT must be 'json' or 'text'");
        }

        if self.ledger.platform_fee_bps > 10_000 {
            return fatal("platform_fee_bps must not exceed 10000");
        }

        if self.ledger.play_money_grant < 0 || self.ledger.daily_bonus < 0 {
            return fatal("play money grant and daily bonus must be non-negative");
        }

        if self.ledger.min_withdrawal <= 0 {
            return fatal("min_withdrawal must be positive");
        }

        if self.chain.fallback_fee_rate == 0 {
            return fatal("fallback_fee_rate must be at least 1 sat/vB");
        }

        if self.deposit_watcher.concurrency == 0 {
            return fatal("deposit_watcher.concurrency must be at least 1");
        }

        self.wallet.network()?;
        Ok(())
    }

    /// 读取并校验主种子
    ///
    /// 开启真实货币功能时缺少或无效的种子都是致命错误
    pub fn load_key_derivation(&self) -> Result<Option<KeyDerivation>, EngineError> {
        let network = self.wallet.network()?;

        match WalletSeed::from_env() {
            Some(seed) => {
                let derivation =
                    KeyDerivation::from_seed(&seed, network, self.wallet.derivation_account)?;
                Ok(Some(derivation))
            }
            None if self.wallet.real_money_enabled => Err(EngineError::ConfigurationFatal(
                "WALLET_SEED is required when real-money features are enabled".to_string(),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_env();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.dust_threshold_sats, 546);
        assert_eq!(config.ledger.platform_fee_bps, 500);
    }

    #[test]
    fn test_config_from_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_addr = "0.0.0.0:9090"

[storage]
backend = "memory"

[wallet]
network = "testnet"
hot_wallet_index = 0
derivation_account = 0
real_money_enabled = false

[ledger]
platform_fee_bps = 250
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:9090");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.wallet.network().unwrap(), Network::Testnet);
        assert_eq!(config.ledger.platform_fee_bps, 250);
        // 未写出的字段保持默认
        assert_eq!(config.ledger.dust_threshold_sats, 546);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_network_is_fatal() {
        let mut config = Config::from_env();
        config.wallet.network = "dogecoin".into();
        assert!(matches!(
            config.validate(),
            Err(EngineError::ConfigurationFatal(_))
        ));
    }

    #[test]
    fn test_fee_above_hundred_percent_rejected() {
        let mut config = Config::from_env();
        config.ledger.platform_fee_bps = 10_001;
        assert!(config.validate().is_err());
    }
}

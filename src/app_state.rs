use std::{str::FromStr, sync::Arc};

use rust_decimal::Decimal;

use crate::{
    config::Config,
    domain::KeyDerivation,
    error::EngineError,
    infrastructure::{db::PgPool, distributed_lock::DistributedLock},
    repository::SettlementStore,
    service::{
        ChainGateway, CoinGeckoRateSource, DepositAddressService, DepositWatcher, EsploraGateway,
        FixedRateSource, LedgerService, LedgerSettings, RateSource, TransactionBuilder,
        WithdrawalOrchestrator, WithdrawalSettings,
    },
};

/// 真实货币相关服务（需要主种子）
#[derive(Clone)]
pub struct RealMoneyServices {
    pub gateway: Arc<dyn ChainGateway>,
    pub deposit_addresses: Arc<DepositAddressService>,
    pub deposit_watcher: Arc<DepositWatcher>,
    pub withdrawals: Arc<WithdrawalOrchestrator>,
}

/// 应用状态
/// 包含所有共享资源
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn SettlementStore>,
    /// 内存存储时为 None
    pub pool: Option<PgPool>,
    pub distributed_lock: Option<Arc<DistributedLock>>,
    pub ledger: Arc<LedgerService>,
    /// 未配置主种子且关闭真实货币功能时为 None
    pub real_money: Option<RealMoneyServices>,
}

impl AppState {
    /// 按配置创建链网关和汇率源并组装全部服务
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SettlementStore>,
        pool: Option<PgPool>,
        distributed_lock: Option<Arc<DistributedLock>>,
        derivation: Option<KeyDerivation>,
    ) -> Result<Self, EngineError> {
        let gateway: Arc<dyn ChainGateway> = Arc::new(EsploraGateway::new(&config.chain));
        let rates = rate_source_from_config(&config)?;
        Ok(Self::assemble(
            config,
            store,
            pool,
            distributed_lock,
            derivation,
            gateway,
            rates,
        ))
    }

    /// 用给定的链网关和汇率源组装服务
    pub fn assemble(
        config: Arc<Config>,
        store: Arc<dyn SettlementStore>,
        pool: Option<PgPool>,
        distributed_lock: Option<Arc<DistributedLock>>,
        derivation: Option<KeyDerivation>,
        gateway: Arc<dyn ChainGateway>,
        rates: Arc<dyn RateSource>,
    ) -> Self {
        let settings = LedgerSettings::from(&config.ledger);
        let lock_timeout = settings.lock_timeout;
        let ledger = Arc::new(LedgerService::new(store.clone(), settings));

        let real_money = derivation.map(|derivation| {
            let derivation = Arc::new(derivation);

            let deposit_addresses = Arc::new(DepositAddressService::new(
                store.clone(),
                derivation.clone(),
                config.wallet.hot_wallet_index,
                lock_timeout,
            ));

            let deposit_watcher = Arc::new(DepositWatcher::new(
                ledger.clone(),
                gateway.clone(),
                rates.clone(),
                distributed_lock.clone(),
                config.deposit_watcher.clone(),
            ));

            let builder = Arc::new(TransactionBuilder::new(
                derivation,
                gateway.clone(),
                config.ledger.dust_threshold_sats,
            ));

            let withdrawals = Arc::new(WithdrawalOrchestrator::new(
                ledger.clone(),
                builder,
                gateway.clone(),
                rates,
                WithdrawalSettings::from(&*config),
                distributed_lock.clone(),
            ));

            RealMoneyServices {
                gateway,
                deposit_addresses,
                deposit_watcher,
                withdrawals,
            }
        });

        Self {
            config,
            store,
            pool,
            distributed_lock,
            ledger,
            real_money,
        }
    }

    pub fn real_money(&self) -> Result<&RealMoneyServices, EngineError> {
        self.real_money.as_ref().ok_or_else(|| {
            EngineError::ConfigurationFatal("real-money features are disabled".to_string())
        })
    }
}

fn rate_source_from_config(config: &Config) -> Result<Arc<dyn RateSource>, EngineError> {
    match &config.rates.fixed_btc_price {
        Some(raw) => {
            let price = Decimal::from_str(raw).map_err(|e| {
                EngineError::ConfigurationFatal(format!("invalid fixed_btc_price {}: {}", raw, e))
            })?;
            tracing::warn!(price = %price, "Using fixed BTC price");
            Ok(Arc::new(FixedRateSource::new(price)))
        }
        None => Ok(Arc::new(CoinGeckoRateSource::new(&config.rates))),
    }
}

//! 充值监听
//!
//! 周期性轮询所有已分配充值地址：链上已确认余额减去账本中已入账的充值总额即为新充值。
//! 已入账总额只从流水推导，不维护单独的“上次看到”字段。
//!
//! 每笔入账都带内容指纹幂等键，检查、入账、记录在同一个原子批次里完成。
//! 批次还携带扫描时读到的已入账总额，存储层在事务内复核，总额已变则整批拒绝；
//! 因此多实例扫描重叠、各自的逐笔列表不一致时也不会重复入账。
//! 单个地址失败只记日志，不影响其他地址，下个周期重试。

use std::{sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use tokio::time::interval;

use super::{
    chain_gateway::{ChainGateway, Inflow},
    ledger_service::LedgerService,
    rate_source::{sats_to_minor_units, RateSource},
};
use crate::{
    config::DepositWatcherConfig,
    domain::{
        deposit_idempotency_key, BalanceType, DepositFingerprint, LedgerKind, NewLedgerEntry,
    },
    error::EngineError,
    infrastructure::{distributed_lock::DistributedLock, keyed_lock::KeyedLocks},
    repository::{DepositGuard, DepositTarget, LedgerBatch, StoreError},
};

const SCAN_LOCK_KEY: &str = "deposit-scan";

/// 单次扫描统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub addresses_scanned: usize,
    pub deposits_credited: usize,
    pub sats_credited: u64,
    pub duplicates_skipped: usize,
    pub failures: usize,
}

#[derive(Debug, Default)]
struct AddressOutcome {
    credited: usize,
    sats: u64,
    duplicates: usize,
}

/// 待入账的一笔充值
struct PendingCredit {
    amount_sats: u64,
    chain_reference: Option<String>,
    idempotency_key: String,
}

pub struct DepositWatcher {
    ledger: Arc<LedgerService>,
    gateway: Arc<dyn ChainGateway>,
    rates: Arc<dyn RateSource>,
    address_locks: KeyedLocks<String>,
    distributed_lock: Option<Arc<DistributedLock>>,
    config: DepositWatcherConfig,
}

impl DepositWatcher {
    pub fn new(
        ledger: Arc<LedgerService>,
        gateway: Arc<dyn ChainGateway>,
        rates: Arc<dyn RateSource>,
        distributed_lock: Option<Arc<DistributedLock>>,
        config: DepositWatcherConfig,
    ) -> Self {
        let address_locks = KeyedLocks::new(ledger.settings().lock_timeout);
        Self {
            ledger,
            gateway,
            rates,
            address_locks,
            distributed_lock,
            config,
        }
    }

    /// 扫描所有充值地址一遍
    pub async fn scan_once(&self) -> Result<ScanReport, EngineError> {
        let targets = self.ledger.store().list_deposit_targets().await?;
        let concurrency = self.config.concurrency.max(1);

        let results: Vec<(DepositTarget, Result<AddressOutcome, EngineError>)> =
            stream::iter(targets)
                .map(|target| async move {
                    let result = self.scan_address(&target).await;
                    (target, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut report = ScanReport {
            addresses_scanned: results.len(),
            ..Default::default()
        };

        for (target, result) in results {
            match result {
                Ok(outcome) => {
                    report.deposits_credited += outcome.credited;
                    report.sats_credited += outcome.sats;
                    report.duplicates_skipped += outcome.duplicates;
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        account_id = %target.account_id,
                        address = %target.address,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Deposit scan failed for address"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn scan_address(&self, target: &DepositTarget) -> Result<AddressOutcome, EngineError> {
        let _guard = self
            .address_locks
            .lock(&target.address)
            .await
            .map_err(|e| EngineError::ConcurrencyConflict(e.to_string()))?;

        let store = self.ledger.store();
        let balance = self.gateway.get_confirmed_balance(&target.address).await?;
        let credited = store.credited_deposit_total(&target.address).await?;

        if balance <= credited {
            return Ok(AddressOutcome::default());
        }
        let delta = balance - credited;

        tracing::debug!(
            address = %target.address,
            balance,
            credited,
            delta,
            "New deposit value detected"
        );

        let pending = self.pending_credits(&target.address, credited, delta).await?;
        let price = self.rates.btc_price().await?;

        let mut outcome = AddressOutcome::default();
        let mut credited_before = credited;
        for credit in pending {
            let minor_units = sats_to_minor_units(credit.amount_sats, price)?;
            let entry = NewLedgerEntry::new(
                target.account_id,
                LedgerKind::Deposit,
                BalanceType::RealMoney,
                minor_units,
            )
            .with_deposit(
                &target.address,
                credit.amount_sats,
                credit.chain_reference.clone(),
                credit.idempotency_key.clone(),
            );

            let batch = LedgerBatch {
                postings: vec![entry],
                deposit_guard: Some(DepositGuard {
                    address: target.address.clone(),
                    credited_before,
                }),
                ..Default::default()
            };

            match self.ledger.commit(batch).await {
                Ok(_) => {
                    credited_before += credit.amount_sats;
                    outcome.credited += 1;
                    outcome.sats += credit.amount_sats;
                    tracing::info!(
                        account_id = %target.account_id,
                        address = %target.address,
                        amount_sats = credit.amount_sats,
                        amount = minor_units,
                        chain_reference = ?credit.chain_reference,
                        "Deposit credited"
                    );
                }
                // 其他扫描已入账，本地址剩余部分留给下个周期重新计算
                Err(StoreError::DuplicateIdempotencyKey(key)) => {
                    outcome.duplicates += 1;
                    tracing::debug!(idempotency_key = %key, "Deposit already credited");
                    break;
                }
                Err(StoreError::StaleDepositTotal {
                    expected, actual, ..
                }) => {
                    outcome.duplicates += 1;
                    tracing::debug!(
                        address = %target.address,
                        expected,
                        actual,
                        "Credited total moved during scan, deferring"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(outcome)
    }

    /// 逐笔入账优先；逐笔合计与差额对不上时按差额整体入账
    async fn pending_credits(
        &self,
        address: &str,
        credited: u64,
        delta: u64,
    ) -> Result<Vec<PendingCredit>, EngineError> {
        if let Some(inflows) = self.gateway.list_confirmed_inflows(address).await? {
            let mut uncredited = Vec::new();
            for Inflow { txid, value_sats } in inflows {
                let key = deposit_idempotency_key(
                    address,
                    DepositFingerprint::Inflow {
                        txid: &txid,
                        amount_sats: value_sats,
                    },
                );
                if self
                    .ledger
                    .store()
                    .find_by_idempotency_key(&key)
                    .await?
                    .is_none()
                {
                    uncredited.push(PendingCredit {
                        amount_sats: value_sats,
                        chain_reference: Some(txid),
                        idempotency_key: key,
                    });
                }
            }

            let total: u64 = uncredited.iter().map(|c| c.amount_sats).sum();
            if total == delta && !uncredited.is_empty() {
                return Ok(uncredited);
            }

            tracing::debug!(
                address = %address,
                listed = total,
                delta,
                "Inflow listing disagrees with balance delta, crediting aggregate"
            );
        }

        Ok(vec![PendingCredit {
            amount_sats: delta,
            chain_reference: None,
            idempotency_key: deposit_idempotency_key(
                address,
                DepositFingerprint::BalanceDelta {
                    credited_before: credited,
                    delta_sats: delta,
                },
            ),
        }])
    }

    /// 启动后台扫描任务（持续运行）
    pub async fn start_background_scanner(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = interval(period);

        tracing::info!(
            interval_secs = period.as_secs(),
            concurrency = self.config.concurrency,
            "Deposit watcher started"
        );

        loop {
            ticker.tick().await;

            // 多实例时每个周期只有一个实例扫描
            let _cycle_guard = match &self.distributed_lock {
                Some(lock) => match lock.try_acquire(SCAN_LOCK_KEY, period.as_secs()).await {
                    Ok(Some(guard)) => Some(guard),
                    Ok(None) => {
                        tracing::debug!("Deposit scan held by another instance, skipping cycle");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "Scan lock unavailable, scanning anyway");
                        None
                    }
                },
                None => None,
            };

            match self.scan_once().await {
                Ok(report) => {
                    if report.deposits_credited > 0 || report.failures > 0 {
                        tracing::info!(
                            addresses = report.addresses_scanned,
                            credited = report.deposits_credited,
                            sats = report.sats_credited,
                            failures = report.failures,
                            "Deposit scan finished"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Deposit scan failed");
                }
            }
        }
    }
}

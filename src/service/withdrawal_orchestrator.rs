//! 提现编排
//!
//! 扣款 → building → 构建签名 → broadcast → 广播 → confirmed，每一步都是独立的失败边界：
//! - 扣款失败：直接返回，不产生任何状态
//! - 构建失败：退款并标记 failed-refunded
//! - 广播被拒：退款并标记 failed-refunded
//! - 广播超时/瞬时错误：结果未知，保持 broadcast，由对账任务按 txid 查询后决定
//! - 状态写入失败：立即尝试退款；仍失败时请求停在 requested/building，
//!   对账任务超过最小间隔后退款（这两个状态下签名交易从未发出）
//!
//! 退款流水带固定幂等键，同一笔提现最多退款一次。

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::Mutex, time::interval};
use uuid::Uuid;

use super::{
    chain_gateway::{ChainError, ChainGateway},
    ledger_service::LedgerService,
    rate_source::{minor_units_to_sats, RateSource},
    transaction_builder::{parse_destination, TransactionBuilder},
};
use crate::{
    config::Config,
    domain::{
        BalanceType, EntryStatus, LedgerKind, NewLedgerEntry, NewWithdrawal, PageRequest,
        Paginated, WithdrawalPatch, WithdrawalRequest, WithdrawalStatus,
    },
    error::EngineError,
    infrastructure::distributed_lock::DistributedLock,
    repository::{EntryUpdate, LedgerBatch, WithdrawalChange},
};

const RECONCILE_LOCK_KEY: &str = "withdrawal-reconcile";
const STALLED_REASON: &str = "withdrawal stalled before broadcast";

#[derive(Debug, Clone)]
pub struct WithdrawalSettings {
    pub hot_wallet_index: u32,
    /// 最低提现金额（法币最小单位）
    pub min_withdrawal: i64,
    pub broadcast_timeout: Duration,
    pub reconcile_interval: Duration,
    /// 广播后至少经过多久才对账
    pub reconcile_min_age: chrono::Duration,
    pub reconcile_batch_size: i64,
}

impl From<&Config> for WithdrawalSettings {
    fn from(config: &Config) -> Self {
        Self {
            hot_wallet_index: config.wallet.hot_wallet_index,
            min_withdrawal: config.ledger.min_withdrawal,
            broadcast_timeout: config.chain.broadcast_timeout(),
            reconcile_interval: Duration::from_secs(config.reconciliation.interval_secs.max(1)),
            reconcile_min_age: chrono::Duration::seconds(
                config.reconciliation.min_age_secs as i64,
            ),
            reconcile_batch_size: config.reconciliation.batch_size.max(1),
        }
    }
}

impl Default for WithdrawalSettings {
    fn default() -> Self {
        Self {
            hot_wallet_index: 0,
            min_withdrawal: 1_000,
            broadcast_timeout: Duration::from_secs(20),
            reconcile_interval: Duration::from_secs(120),
            reconcile_min_age: chrono::Duration::seconds(60),
            reconcile_batch_size: 50,
        }
    }
}

/// 热钱包状态（运维用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotWalletStatus {
    pub address: String,
    pub confirmed_balance_sats: u64,
}

/// 单次对账统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub refunded: usize,
    pub still_pending: usize,
}

enum ReconcileOutcome {
    Confirmed,
    Refunded,
    Pending,
}

pub struct WithdrawalOrchestrator {
    ledger: Arc<LedgerService>,
    builder: Arc<TransactionBuilder>,
    gateway: Arc<dyn ChainGateway>,
    rates: Arc<dyn RateSource>,
    settings: WithdrawalSettings,
    /// 热钱包选币到广播期间互斥，避免两笔提现花同一个 UTXO
    hot_wallet: Mutex<()>,
    distributed_lock: Option<Arc<DistributedLock>>,
}

impl WithdrawalOrchestrator {
    pub fn new(
        ledger: Arc<LedgerService>,
        builder: Arc<TransactionBuilder>,
        gateway: Arc<dyn ChainGateway>,
        rates: Arc<dyn RateSource>,
        settings: WithdrawalSettings,
        distributed_lock: Option<Arc<DistributedLock>>,
    ) -> Self {
        Self {
            ledger,
            builder,
            gateway,
            rates,
            settings,
            hot_wallet: Mutex::new(()),
            distributed_lock,
        }
    }

    /// 发起提现
    ///
    /// 返回的请求状态为 `confirmed`（已广播）或 `broadcast`（结果未知，等待对账）；
    /// 构建失败或广播被拒时先完成退款再返回错误。
    pub async fn request_withdrawal(
        &self,
        account_id: Uuid,
        amount: i64,
        destination: &str,
    ) -> Result<WithdrawalRequest, EngineError> {
        if amount < self.settings.min_withdrawal {
            return Err(EngineError::InvalidAmount(format!(
                "withdrawal amount {} is below the minimum of {}",
                amount, self.settings.min_withdrawal
            )));
        }
        parse_destination(destination, self.builder.network())?;

        let price = self.rates.btc_price().await?;
        let amount_sats = minor_units_to_sats(amount, price)?;
        if amount_sats < self.builder.dust_threshold() {
            return Err(EngineError::InvalidAmount(format!(
                "withdrawal converts to {} sats, below the dust threshold of {}",
                amount_sats,
                self.builder.dust_threshold()
            )));
        }

        // 1. 扣款并登记请求（同一批次）
        let withdrawal_id = Uuid::new_v4();
        let mut debit = NewLedgerEntry::new(
            account_id,
            LedgerKind::Withdrawal,
            BalanceType::RealMoney,
            -amount,
        )
        .with_status(EntryStatus::Pending)
        .with_withdrawal(withdrawal_id);
        debit.idempotency_key = Some(format!("wd_{}", withdrawal_id));
        debit.chain_amount_sats = Some(amount_sats as i64);

        let request = NewWithdrawal {
            id: withdrawal_id,
            account_id,
            amount,
            amount_sats: amount_sats as i64,
            destination: destination.to_string(),
            source_index: self.settings.hot_wallet_index,
            debit_entry_id: debit.id,
        };

        self.ledger
            .commit(LedgerBatch {
                postings: vec![debit],
                withdrawal: Some(WithdrawalChange::Open(request)),
                ..Default::default()
            })
            .await?;

        tracing::info!(
            withdrawal_id = %withdrawal_id,
            account_id = %account_id,
            amount,
            amount_sats,
            destination = %destination,
            "Withdrawal requested, balance debited"
        );

        let _hot_wallet = self.hot_wallet.lock().await;

        // 2. building
        if let Err(e) = self
            .transition(
                withdrawal_id,
                WithdrawalStatus::Requested,
                WithdrawalStatus::Building,
                WithdrawalPatch::default(),
            )
            .await
        {
            return Err(self.abandon(withdrawal_id, WithdrawalStatus::Requested, e).await);
        }

        // 3. 构建并签名
        let signed = match self
            .builder
            .build(self.settings.hot_wallet_index, destination, amount_sats)
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                let err = EngineError::from(e);
                tracing::error!(
                    withdrawal_id = %withdrawal_id,
                    error = %err,
                    "Withdrawal build failed, refunding"
                );
                let current = self.load(withdrawal_id).await?;
                self.refund(&current, WithdrawalStatus::Building, &err.to_string())
                    .await?;
                return Err(err);
            }
        };

        // 先落库已签名交易，广播结果未知时对账可按 txid 查询或原样重播
        if let Err(e) = self
            .transition(
                withdrawal_id,
                WithdrawalStatus::Building,
                WithdrawalStatus::Broadcast,
                WithdrawalPatch {
                    tx_ref: Some(signed.txid.clone()),
                    raw_tx: Some(signed.raw_hex()),
                    network_fee_sats: Some(signed.fee_sats as i64),
                    failure_reason: None,
                },
            )
            .await
        {
            return Err(self.abandon(withdrawal_id, WithdrawalStatus::Building, e).await);
        }

        // 4. 广播
        let current = self.load(withdrawal_id).await?;
        match self.broadcast_with_timeout(&signed.raw).await {
            Ok(txid) => {
                self.confirm(&current, &txid).await?;
                tracing::info!(
                    withdrawal_id = %withdrawal_id,
                    txid = %txid,
                    fee_sats = signed.fee_sats,
                    inputs = signed.inputs.len(),
                    "Withdrawal broadcast"
                );
                self.load(withdrawal_id).await
            }
            Err(ChainError::Rejected(reason)) => {
                tracing::error!(
                    withdrawal_id = %withdrawal_id,
                    txid = %signed.txid,
                    reason = %reason,
                    "Withdrawal rejected by chain provider, refunding"
                );
                self.refund(&current, WithdrawalStatus::Broadcast, &reason)
                    .await?;
                Err(EngineError::ChainRejected(reason))
            }
            Err(e) => {
                // 交易可能已经到达节点，不能退款
                tracing::warn!(
                    withdrawal_id = %withdrawal_id,
                    txid = %signed.txid,
                    error = %e,
                    "Withdrawal broadcast outcome unknown, leaving for reconciliation"
                );
                Ok(current)
            }
        }
    }

    /// 对账：退款未广播的滞留请求，处理停留在 broadcast 的请求
    pub async fn reconcile_broadcasts(&self) -> Result<ReconcileReport, EngineError> {
        let cutoff = Utc::now() - self.settings.reconcile_min_age;
        let mut report = ReconcileReport::default();

        self.sweep_unbroadcast(cutoff, &mut report).await?;

        let stuck = self
            .ledger
            .store()
            .list_withdrawals_by_status(
                WithdrawalStatus::Broadcast,
                cutoff,
                self.settings.reconcile_batch_size,
            )
            .await?;
        report.examined += stuck.len();

        for request in stuck {
            match self.reconcile_one(&request).await {
                Ok(ReconcileOutcome::Confirmed) => report.confirmed += 1,
                Ok(ReconcileOutcome::Refunded) => report.refunded += 1,
                Ok(ReconcileOutcome::Pending) => report.still_pending += 1,
                Err(e) => {
                    report.still_pending += 1;
                    tracing::warn!(
                        withdrawal_id = %request.id,
                        error = %e,
                        "Withdrawal reconciliation failed, will retry"
                    );
                }
            }
        }

        Ok(report)
    }

    /// requested/building 的请求没有发出过交易，直接退款
    async fn sweep_unbroadcast(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        // 本进程内进行中的提现持有该锁，不会被误退
        let _hot_wallet = self.hot_wallet.lock().await;

        for status in [WithdrawalStatus::Requested, WithdrawalStatus::Building] {
            let stale = self
                .ledger
                .store()
                .list_withdrawals_by_status(status, cutoff, self.settings.reconcile_batch_size)
                .await?;
            report.examined += stale.len();

            for request in stale {
                tracing::warn!(
                    withdrawal_id = %request.id,
                    status = %status,
                    "Withdrawal stalled before broadcast, refunding"
                );
                match self.refund(&request, status, STALLED_REASON).await {
                    Ok(()) => report.refunded += 1,
                    Err(e) => {
                        report.still_pending += 1;
                        tracing::warn!(
                            withdrawal_id = %request.id,
                            error = %e,
                            "Stalled withdrawal refund failed, will retry"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn reconcile_one(
        &self,
        request: &WithdrawalRequest,
    ) -> Result<ReconcileOutcome, EngineError> {
        let (Some(tx_ref), Some(raw_tx)) = (&request.tx_ref, &request.raw_tx) else {
            return Err(EngineError::Internal(format!(
                "withdrawal {} in broadcast without a signed transaction",
                request.id
            )));
        };

        if self.gateway.transaction_status(tx_ref).await?.is_some() {
            self.confirm(request, tx_ref).await?;
            tracing::info!(
                withdrawal_id = %request.id,
                txid = %tx_ref,
                "Withdrawal found on chain, confirmed"
            );
            return Ok(ReconcileOutcome::Confirmed);
        }

        let raw = hex::decode(raw_tx).map_err(|e| {
            EngineError::Internal(format!("stored raw tx for {} is not hex: {}", request.id, e))
        })?;

        match self.broadcast_with_timeout(&raw).await {
            Ok(txid) => {
                self.confirm(request, &txid).await?;
                tracing::info!(
                    withdrawal_id = %request.id,
                    txid = %txid,
                    "Withdrawal rebroadcast, confirmed"
                );
                Ok(ReconcileOutcome::Confirmed)
            }
            Err(ChainError::Rejected(reason)) => {
                tracing::error!(
                    withdrawal_id = %request.id,
                    txid = %tx_ref,
                    reason = %reason,
                    "Rebroadcast rejected, refunding"
                );
                self.refund(request, WithdrawalStatus::Broadcast, &reason)
                    .await?;
                Ok(ReconcileOutcome::Refunded)
            }
            Err(e) => {
                tracing::debug!(
                    withdrawal_id = %request.id,
                    error = %e,
                    "Rebroadcast outcome still unknown"
                );
                Ok(ReconcileOutcome::Pending)
            }
        }
    }

    pub async fn hot_wallet_status(&self) -> Result<HotWalletStatus, EngineError> {
        let address = self
            .builder
            .source_address(self.settings.hot_wallet_index)?
            .to_string();
        let confirmed_balance_sats = self.gateway.get_confirmed_balance(&address).await?;
        Ok(HotWalletStatus {
            address,
            confirmed_balance_sats,
        })
    }

    pub async fn withdrawal(&self, id: Uuid) -> Result<WithdrawalRequest, EngineError> {
        self.load(id).await
    }

    pub async fn withdrawals_for_account(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<Paginated<WithdrawalRequest>, EngineError> {
        let (data, total) = self
            .ledger
            .store()
            .list_withdrawals_for_account(account_id, page)
            .await?;
        Ok(Paginated::new(data, page, total))
    }

    /// 启动后台对账任务（持续运行）
    pub async fn start_background_reconciler(self: Arc<Self>) {
        let period = self.settings.reconcile_interval;
        let mut ticker = interval(period);

        tracing::info!(
            interval_secs = period.as_secs(),
            "Withdrawal reconciler started"
        );

        loop {
            ticker.tick().await;

            let _cycle_guard = match &self.distributed_lock {
                Some(lock) => match lock.try_acquire(RECONCILE_LOCK_KEY, period.as_secs()).await {
                    Ok(Some(guard)) => Some(guard),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = ?e, "Reconcile lock unavailable, running anyway");
                        None
                    }
                },
                None => None,
            };

            match self.reconcile_broadcasts().await {
                Ok(report) if report.examined > 0 => {
                    tracing::info!(
                        examined = report.examined,
                        confirmed = report.confirmed,
                        refunded = report.refunded,
                        pending = report.still_pending,
                        "Withdrawal reconciliation finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Withdrawal reconciliation failed");
                }
            }
        }
    }

    // ============ 内部 ============

    async fn load(&self, id: Uuid) -> Result<WithdrawalRequest, EngineError> {
        self.ledger
            .store()
            .find_withdrawal(id)
            .await?
            .ok_or(EngineError::WithdrawalNotFound(id))
    }

    /// 状态写入失败后尽力退款，失败则留给对账任务；返回原始错误
    async fn abandon(&self, id: Uuid, from: WithdrawalStatus, err: EngineError) -> EngineError {
        tracing::error!(
            withdrawal_id = %id,
            status = %from,
            error = %err,
            "Withdrawal state write failed, refunding"
        );

        let refunded = match self.load(id).await {
            Ok(current) => self.refund(&current, from, &err.to_string()).await,
            Err(e) => Err(e),
        };
        if let Err(refund_err) = refunded {
            tracing::error!(
                withdrawal_id = %id,
                error = %refund_err,
                "Immediate refund failed, deferring to reconciliation"
            );
        }
        err
    }

    async fn broadcast_with_timeout(&self, raw: &[u8]) -> Result<String, ChainError> {
        let timeout = self.settings.broadcast_timeout;
        match tokio::time::timeout(timeout, self.gateway.broadcast(raw)).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(timeout)),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
        patch: WithdrawalPatch,
    ) -> Result<(), EngineError> {
        self.ledger
            .commit(LedgerBatch {
                withdrawal: Some(WithdrawalChange::Transition {
                    id,
                    from,
                    to,
                    patch,
                }),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn confirm(&self, request: &WithdrawalRequest, txid: &str) -> Result<(), EngineError> {
        self.ledger
            .commit(LedgerBatch {
                entry_updates: vec![EntryUpdate {
                    entry_id: request.debit_entry_id,
                    status: EntryStatus::Confirmed,
                    chain_reference: Some(txid.to_string()),
                }],
                withdrawal: Some(WithdrawalChange::Transition {
                    id: request.id,
                    from: WithdrawalStatus::Broadcast,
                    to: WithdrawalStatus::Confirmed,
                    patch: WithdrawalPatch {
                        tx_ref: Some(txid.to_string()),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// 退款、扣款流水置为 failed、请求置为 failed-refunded，同一批次提交
    async fn refund(
        &self,
        request: &WithdrawalRequest,
        from: WithdrawalStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut refund = NewLedgerEntry::new(
            request.account_id,
            LedgerKind::WithdrawalRefund,
            BalanceType::RealMoney,
            request.amount,
        )
        .with_withdrawal(request.id)
        .with_note(reason);
        refund.idempotency_key = Some(format!("wd_{}_refund", request.id));

        self.ledger
            .commit(LedgerBatch {
                postings: vec![refund],
                entry_updates: vec![EntryUpdate {
                    entry_id: request.debit_entry_id,
                    status: EntryStatus::Failed,
                    chain_reference: None,
                }],
                withdrawal: Some(WithdrawalChange::Transition {
                    id: request.id,
                    from,
                    to: WithdrawalStatus::FailedRefunded,
                    patch: WithdrawalPatch {
                        failure_reason: Some(reason.to_string()),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            })
            .await?;

        tracing::warn!(
            withdrawal_id = %request.id,
            account_id = %request.account_id,
            amount = request.amount,
            reason = %reason,
            "Withdrawal refunded"
        );
        Ok(())
    }
}

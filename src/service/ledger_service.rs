//! 账本服务
//!
//! 余额与对局托管的状态机。所有改动余额的操作都组装成一个 [`LedgerBatch`]，
//! 在进程内按账户升序加锁后交给存储层原子提交；存储层自身再以条件更新兜底，
//! 余额永远不会为负。

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    config::LedgerConfig,
    domain::{
        plan_settlement, Account, BalanceType, Balances, EscrowState, LedgerKind,
        LedgerTransaction, MatchEscrow, MatchOutcome, NewAccount, NewLedgerEntry, NewMatchEscrow,
        PageRequest, Paginated,
    },
    error::EngineError,
    infrastructure::keyed_lock::KeyedLocks,
    repository::{BonusClaim, EscrowChange, LedgerBatch, SettlementStore, StoreError},
};

/// 冲突重试的基础退避
const CONFLICT_BACKOFF_MS: u64 = 25;

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub platform_fee_bps: u32,
    pub play_money_grant: i64,
    pub daily_bonus: i64,
    pub daily_bonus_interval: chrono::Duration,
    pub lock_timeout: Duration,
    pub conflict_retries: u32,
}

impl From<&LedgerConfig> for LedgerSettings {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            platform_fee_bps: config.platform_fee_bps,
            play_money_grant: config.play_money_grant,
            daily_bonus: config.daily_bonus,
            daily_bonus_interval: chrono::Duration::seconds(
                config.daily_bonus_interval_secs as i64,
            ),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            conflict_retries: config.conflict_retries,
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

/// 对局开始时的托管请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowRequest {
    pub match_id: Uuid,
    pub account_a: Uuid,
    pub account_b: Uuid,
    pub balance_type: BalanceType,
    pub stake: i64,
}

/// 结算结果
#[derive(Debug, Clone)]
pub struct Settlement {
    pub escrow: MatchEscrow,
    pub entries: Vec<LedgerTransaction>,
    pub platform_fee: i64,
}

pub struct LedgerService {
    store: Arc<dyn SettlementStore>,
    locks: KeyedLocks<Uuid>,
    settings: LedgerSettings,
}

impl LedgerService {
    pub fn new(store: Arc<dyn SettlementStore>, settings: LedgerSettings) -> Self {
        let locks = KeyedLocks::new(settings.lock_timeout);
        Self {
            store,
            locks,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// 串行化提交批次，冲突时有限次重试
    pub(crate) async fn commit(
        &self,
        batch: LedgerBatch,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let _guard = self
            .locks
            .lock_many(&batch.touched_accounts())
            .await
            .map_err(|e| StoreError::Conflict(e.to_string()))?;

        let mut attempt = 0;
        loop {
            match self.store.apply(batch.clone()).await {
                Err(StoreError::Conflict(msg)) if attempt < self.settings.conflict_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %msg,
                        "Ledger batch conflicted, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        CONFLICT_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                other => return other,
            }
        }
    }

    fn single(mut entries: Vec<LedgerTransaction>) -> Result<LedgerTransaction, EngineError> {
        entries
            .pop()
            .ok_or_else(|| EngineError::Internal("batch committed without entries".into()))
    }

    // ============ 账户 ============

    /// 开户；同一外部标识重复调用返回已有账户
    pub async fn open_account(&self, external_ref: &str) -> Result<Account, EngineError> {
        let external_ref = external_ref.trim();
        if external_ref.is_empty() {
            return Err(EngineError::InvalidRequest(
                "external_ref must not be empty".into(),
            ));
        }

        let account = self
            .store
            .create_account(NewAccount {
                external_ref: external_ref.to_string(),
                play_money_grant: self.settings.play_money_grant,
            })
            .await?;

        tracing::info!(
            account_id = %account.id,
            external_ref = %account.external_ref,
            "Account opened"
        );
        Ok(account)
    }

    pub async fn account(&self, account_id: Uuid) -> Result<Account, EngineError> {
        self.store
            .find_account(account_id)
            .await?
            .ok_or(EngineError::AccountNotFound(account_id))
    }

    pub async fn balances(&self, account_id: Uuid) -> Result<Balances, EngineError> {
        Ok(self.account(account_id).await?.balances)
    }

    // ============ 余额操作 ============

    /// 入账：账户存在即成功
    pub async fn credit(
        &self,
        account_id: Uuid,
        balance_type: BalanceType,
        amount: i64,
        reason: LedgerKind,
    ) -> Result<LedgerTransaction, EngineError> {
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }

        let entry = NewLedgerEntry::new(account_id, reason, balance_type, amount);
        let record = Self::single(self.commit(LedgerBatch::posting(entry)).await?)?;

        tracing::info!(
            account_id = %account_id,
            balance_type = %balance_type,
            amount,
            kind = %reason,
            "Balance credited"
        );
        Ok(record)
    }

    /// 扣款：余额不足时整体失败，不做部分扣减
    pub async fn debit(
        &self,
        account_id: Uuid,
        balance_type: BalanceType,
        amount: i64,
        reason: LedgerKind,
    ) -> Result<LedgerTransaction, EngineError> {
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "debit amount must be positive, got {}",
                amount
            )));
        }

        let entry = NewLedgerEntry::new(account_id, reason, balance_type, -amount);
        let record = Self::single(self.commit(LedgerBatch::posting(entry)).await?)?;

        tracing::info!(
            account_id = %account_id,
            balance_type = %balance_type,
            amount,
            kind = %reason,
            "Balance debited"
        );
        Ok(record)
    }

    /// 人工调整；负向调整不得使余额为负
    pub async fn adjust_balance(
        &self,
        account_id: Uuid,
        balance_type: BalanceType,
        delta: i64,
        reason: &str,
    ) -> Result<LedgerTransaction, EngineError> {
        if delta == 0 {
            return Err(EngineError::InvalidAmount("adjustment delta must be non-zero".into()));
        }

        let entry = NewLedgerEntry::new(account_id, LedgerKind::AdminAdjustment, balance_type, delta)
            .with_note(reason);
        let record = Self::single(self.commit(LedgerBatch::posting(entry)).await?)?;

        tracing::warn!(
            account_id = %account_id,
            balance_type = %balance_type,
            delta,
            reason = %reason,
            "Admin balance adjustment applied"
        );
        Ok(record)
    }

    /// 每日游戏币奖励，冷却期内领取失败
    pub async fn claim_daily_bonus(&self, account_id: Uuid) -> Result<LedgerTransaction, EngineError> {
        let now = Utc::now();
        let batch = LedgerBatch {
            postings: vec![NewLedgerEntry::new(
                account_id,
                LedgerKind::DailyBonus,
                BalanceType::PlayMoney,
                self.settings.daily_bonus,
            )],
            bonus: Some(BonusClaim {
                account_id,
                claimed_at: now,
                cooldown: self.settings.daily_bonus_interval,
            }),
            ..Default::default()
        };

        let record = Self::single(self.commit(batch).await?)?;
        tracing::info!(account_id = %account_id, amount = record.delta, "Daily bonus claimed");
        Ok(record)
    }

    // ============ 对局托管 ============

    /// 双方同时扣除押注，任一方余额不足则双方都不扣
    pub async fn escrow_stake(&self, request: EscrowRequest) -> Result<MatchEscrow, EngineError> {
        if request.stake <= 0 {
            return Err(EngineError::InvalidAmount(format!(
                "stake must be positive, got {}",
                request.stake
            )));
        }
        // 奖池为双倍押注，必须可表示
        if request.stake.checked_mul(2).is_none() {
            return Err(EngineError::InvalidAmount(format!(
                "stake {} is too large",
                request.stake
            )));
        }
        if request.account_a == request.account_b {
            return Err(EngineError::InvalidRequest(
                "a match needs two distinct accounts".into(),
            ));
        }

        let postings = [request.account_a, request.account_b]
            .into_iter()
            .map(|account_id| {
                NewLedgerEntry::new(
                    account_id,
                    LedgerKind::StakeEscrow,
                    request.balance_type,
                    -request.stake,
                )
                .with_match(request.match_id)
            })
            .collect();

        let batch = LedgerBatch {
            postings,
            escrow: Some(EscrowChange::Open(NewMatchEscrow {
                match_id: request.match_id,
                account_a: request.account_a,
                account_b: request.account_b,
                balance_type: request.balance_type,
                stake: request.stake,
            })),
            ..Default::default()
        };

        self.commit(batch).await?;

        tracing::info!(
            match_id = %request.match_id,
            account_a = %request.account_a,
            account_b = %request.account_b,
            balance_type = %request.balance_type,
            stake = request.stake,
            "Stakes escrowed"
        );

        self.store
            .find_escrow(request.match_id)
            .await?
            .ok_or(EngineError::EscrowNotFound(request.match_id))
    }

    /// 按对局结果派奖或退还；只入账，不会再次扣款
    pub async fn settle_match(
        &self,
        match_id: Uuid,
        outcome: MatchOutcome,
    ) -> Result<Settlement, EngineError> {
        let escrow = self
            .store
            .find_escrow(match_id)
            .await?
            .ok_or(EngineError::EscrowNotFound(match_id))?;

        if escrow.state == EscrowState::Settled {
            return Err(EngineError::EscrowAlreadySettled(match_id));
        }

        let plan = plan_settlement(&escrow, outcome, self.settings.platform_fee_bps)
            .ok_or_else(|| {
                EngineError::InvalidAmount(format!(
                    "pot for match {} overflows, stake {}",
                    match_id, escrow.stake
                ))
            })?;
        let postings = plan
            .payouts
            .iter()
            .map(|payout| {
                NewLedgerEntry::new(
                    payout.account_id,
                    payout.kind,
                    escrow.balance_type,
                    payout.amount,
                )
                .with_match(match_id)
            })
            .collect();

        // 托管状态的条件更新保证只结算一次
        let batch = LedgerBatch {
            postings,
            escrow: Some(EscrowChange::Settle {
                match_id,
                outcome,
                platform_fee: plan.fee,
            }),
            ..Default::default()
        };

        let entries = self.commit(batch).await?;

        tracing::info!(
            match_id = %match_id,
            outcome = %outcome,
            platform_fee = plan.fee,
            "Match settled"
        );

        let escrow = self
            .store
            .find_escrow(match_id)
            .await?
            .ok_or(EngineError::EscrowNotFound(match_id))?;

        Ok(Settlement {
            escrow,
            entries,
            platform_fee: plan.fee,
        })
    }

    // ============ 查询 ============

    /// 倒序分页
    pub async fn list_transactions(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<Paginated<LedgerTransaction>, EngineError> {
        self.account(account_id).await?;
        let (data, total) = self.store.list_transactions(account_id, page).await?;
        Ok(Paginated::new(data, page, total))
    }
}

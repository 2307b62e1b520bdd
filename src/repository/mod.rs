// 结算数据访问层
//
// 所有影响余额的写入都通过 LedgerRepository::apply 以一个批次原子提交：
// 流水、余额、托管状态、提现状态要么全部生效，要么全部不生效。

pub mod memory;
pub mod pg_accounts;
pub mod pg_ledger;
pub mod pg_store;
pub mod pg_withdrawals;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Account, BalanceType, EntryStatus, LedgerTransaction, MatchEscrow, MatchOutcome, NewAccount,
    NewLedgerEntry, NewMatchEscrow, NewWithdrawal, PageRequest, WithdrawalPatch,
    WithdrawalRequest, WithdrawalStatus,
};

pub use memory::MemoryStore;
pub use pg_store::PgStore;

// ============ 错误 ============

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("insufficient {balance_type} balance on account {account_id}")]
    InsufficientFunds {
        account_id: Uuid,
        balance_type: BalanceType,
    },

    #[error("idempotency key already recorded: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("escrow already exists for match {0}")]
    EscrowExists(Uuid),

    #[error("escrow not found for match {0}")]
    EscrowNotFound(Uuid),

    #[error("escrow for match {0} already settled")]
    EscrowSettled(Uuid),

    #[error("withdrawal not found: {0}")]
    WithdrawalNotFound(Uuid),

    #[error("withdrawal {id} is not in status {expected}")]
    WithdrawalStateMismatch {
        id: Uuid,
        expected: WithdrawalStatus,
    },

    #[error("withdrawal {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
    },

    #[error("ledger entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("daily bonus on cooldown until {next_claim_at}")]
    BonusCooldown { next_claim_at: DateTime<Utc> },

    #[error("{balance_type} balance of account {account_id} would overflow")]
    AmountOverflow {
        account_id: Uuid,
        balance_type: BalanceType,
    },

    /// 扫描时读到的已入账总额已过期（另一次扫描先入账了）
    #[error("credited total of {address} moved from {expected} to {actual} sats")]
    StaleDepositTotal {
        address: String,
        expected: u64,
        actual: u64,
    },

    #[error("deposit address already assigned: {0}")]
    AddressTaken(String),

    #[error("derivation counter exhausted")]
    CounterExhausted,

    /// 序列化失败 / 死锁 / 锁等待超时，调用方可重试
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 40001 serialization_failure, 40P01 deadlock_detected, 55P03 lock_not_available
            if let Some(code) = db_err.code() {
                if matches!(code.as_ref(), "40001" | "40P01" | "55P03") {
                    return StoreError::Conflict(db_err.message().to_string());
                }
            }
        }
        StoreError::Database(err.to_string())
    }
}

// ============ 批次 ============

/// 已有流水的状态更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    pub entry_id: Uuid,
    pub status: EntryStatus,
    pub chain_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowChange {
    Open(NewMatchEscrow),
    /// 仅当当前状态为 escrowed 时生效
    Settle {
        match_id: Uuid,
        outcome: MatchOutcome,
        platform_fee: i64,
    },
}

#[derive(Debug, Clone)]
pub enum WithdrawalChange {
    Open(NewWithdrawal),
    /// 仅当当前状态等于 from 时生效
    Transition {
        id: Uuid,
        from: WithdrawalStatus,
        to: WithdrawalStatus,
        patch: WithdrawalPatch,
    },
}

/// 每日奖励领取：仅当距上次领取已满 cooldown 时生效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BonusClaim {
    pub account_id: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub cooldown: chrono::Duration,
}

impl BonusClaim {
    /// 上次领取时间不得晚于此刻
    pub fn latest_allowed_previous(&self) -> DateTime<Utc> {
        self.claimed_at - self.cooldown
    }
}

/// 充值入账前置条件：地址已入账总额仍等于扫描时读到的值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositGuard {
    pub address: String,
    pub credited_before: u64,
}

/// 原子写入批次
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    pub postings: Vec<NewLedgerEntry>,
    pub entry_updates: Vec<EntryUpdate>,
    pub escrow: Option<EscrowChange>,
    pub withdrawal: Option<WithdrawalChange>,
    pub bonus: Option<BonusClaim>,
    pub deposit_guard: Option<DepositGuard>,
}

impl LedgerBatch {
    pub fn posting(entry: NewLedgerEntry) -> Self {
        Self {
            postings: vec![entry],
            ..Default::default()
        }
    }

    /// 批次涉及的账户（升序去重，作为加锁顺序）
    pub fn touched_accounts(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .postings
            .iter()
            .map(|p| p.account_id)
            .chain(self.bonus.map(|b| b.account_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// 每个 (账户, 余额类型) 的净变动
    pub(crate) fn net_deltas(&self) -> Result<Vec<((Uuid, BalanceType), i64)>, StoreError> {
        let mut deltas: Vec<((Uuid, BalanceType), i64)> = Vec::new();
        for posting in &self.postings {
            let key = (posting.account_id, posting.balance_type);
            match deltas.iter_mut().find(|(k, _)| *k == key) {
                Some((_, total)) => {
                    *total = total.checked_add(posting.delta).ok_or(
                        StoreError::AmountOverflow {
                            account_id: key.0,
                            balance_type: key.1,
                        },
                    )?;
                }
                None => deltas.push((key, posting.delta)),
            }
        }
        deltas.sort_by_key(|((id, bt), _)| (*id, *bt));
        Ok(deltas)
    }
}

/// 有充值地址的账户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositTarget {
    pub account_id: Uuid,
    pub address: String,
}

// ============ Repository Trait ============

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// 开户并记录注册赠送流水；external_ref 已存在时返回已有账户
    async fn create_account(&self, new: NewAccount) -> Result<Account, StoreError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn find_account_by_ref(&self, external_ref: &str)
        -> Result<Option<Account>, StoreError>;

    /// 仅在账户尚无地址时写入；已有地址时原样返回
    async fn assign_deposit_address(
        &self,
        id: Uuid,
        index: u32,
        address: &str,
    ) -> Result<Account, StoreError>;

    async fn list_deposit_targets(&self) -> Result<Vec<DepositTarget>, StoreError>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// 原子提交一个批次，返回新写入的流水
    async fn apply(&self, batch: LedgerBatch) -> Result<Vec<LedgerTransaction>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError>;

    /// 该地址已入账的充值总额（聪）
    async fn credited_deposit_total(&self, address: &str) -> Result<u64, StoreError>;

    /// 倒序分页，返回 (当前页, 总数)
    async fn list_transactions(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64), StoreError>;
}

#[async_trait]
pub trait MatchEscrowRepository: Send + Sync {
    async fn find_escrow(&self, match_id: Uuid) -> Result<Option<MatchEscrow>, StoreError>;
}

#[async_trait]
pub trait WithdrawalRepository: Send + Sync {
    async fn find_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError>;

    /// 按状态查询最后更新早于 updated_before 的请求（最旧优先）
    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WithdrawalRequest>, StoreError>;

    async fn list_withdrawals_for_account(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<WithdrawalRequest>, u64), StoreError>;
}

#[async_trait]
pub trait DerivationCounter: Send + Sync {
    /// 原子递增并返回下一个派生索引（从 1 开始，永不复用）
    async fn next_index(&self) -> Result<u32, StoreError>;
}

/// 结算引擎所需的全部持久化能力
pub trait SettlementStore:
    AccountRepository + LedgerRepository + MatchEscrowRepository + WithdrawalRepository + DerivationCounter
{
}

impl<T> SettlementStore for T where
    T: AccountRepository
        + LedgerRepository
        + MatchEscrowRepository
        + WithdrawalRepository
        + DerivationCounter
{
}

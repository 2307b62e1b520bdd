//! PostgreSQL 存储
//!
//! 所有多行写入都在一个事务内完成：按 id 升序 `FOR UPDATE` 锁定账户，
//! 余额使用条件更新 `WHERE balance + delta >= 0`。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    pg_accounts, pg_ledger, pg_withdrawals, AccountRepository, DepositTarget, DerivationCounter,
    LedgerBatch, LedgerRepository, MatchEscrowRepository, StoreError, WithdrawalRepository,
};
use crate::{
    domain::{
        Account, LedgerTransaction, MatchEscrow, NewAccount, PageRequest, WithdrawalRequest,
        WithdrawalStatus,
    },
    infrastructure::db::PgPool,
};

const DEPOSIT_COUNTER: &str = "deposit_index";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行内置迁移
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        pg_accounts::create_account(&self.pool, new).await
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        pg_accounts::find_account(&self.pool, id).await
    }

    async fn find_account_by_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Account>, StoreError> {
        pg_accounts::find_account_by_ref(&self.pool, external_ref).await
    }

    async fn assign_deposit_address(
        &self,
        id: Uuid,
        index: u32,
        address: &str,
    ) -> Result<Account, StoreError> {
        pg_accounts::assign_deposit_address(&self.pool, id, index, address).await
    }

    async fn list_deposit_targets(&self) -> Result<Vec<DepositTarget>, StoreError> {
        pg_accounts::list_deposit_targets(&self.pool).await
    }
}

#[async_trait]
impl LedgerRepository for PgStore {
    async fn apply(&self, batch: LedgerBatch) -> Result<Vec<LedgerTransaction>, StoreError> {
        pg_ledger::apply(&self.pool, self.lock_timeout_ms, batch).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        pg_ledger::find_by_idempotency_key(&self.pool, key).await
    }

    async fn credited_deposit_total(&self, address: &str) -> Result<u64, StoreError> {
        pg_ledger::credited_deposit_total(&self.pool, address).await
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64), StoreError> {
        pg_ledger::list_transactions(&self.pool, account_id, page).await
    }
}

#[async_trait]
impl MatchEscrowRepository for PgStore {
    async fn find_escrow(&self, match_id: Uuid) -> Result<Option<MatchEscrow>, StoreError> {
        pg_ledger::find_escrow(&self.pool, match_id).await
    }
}

#[async_trait]
impl WithdrawalRepository for PgStore {
    async fn find_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError> {
        pg_withdrawals::find_withdrawal(&self.pool, id).await
    }

    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        pg_withdrawals::list_by_status(&self.pool, status, updated_before, limit).await
    }

    async fn list_withdrawals_for_account(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<WithdrawalRequest>, u64), StoreError> {
        pg_withdrawals::list_for_account(&self.pool, account_id, page).await
    }
}

#[async_trait]
impl DerivationCounter for PgStore {
    async fn next_index(&self) -> Result<u32, StoreError> {
        // 单条 upsert 保证原子递增，重启后继续
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO derivation_counters (name, value) VALUES ($1, 1)
             ON CONFLICT (name) DO UPDATE SET value = derivation_counters.value + 1
             RETURNING value",
        )
        .bind(DEPOSIT_COUNTER)
        .fetch_one(&self.pool)
        .await?;

        u32::try_from(value)
            .ok()
            .filter(|v| *v < (1 << 31))
            .ok_or(StoreError::CounterExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BalanceType, LedgerKind, NewLedgerEntry};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost:5432/oxledger_test".into());
        let pool = crate::infrastructure::db::connect(&url, &Default::default())
            .await
            .unwrap();
        let store = PgStore::new(pool, 2_000);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore] // 需要PostgreSQL实例
    async fn test_conditional_debit_never_goes_negative() {
        let store = store().await;
        let account = store
            .create_account(NewAccount {
                external_ref: format!("pg-test-{}", Uuid::new_v4()),
                play_money_grant: 100,
            })
            .await
            .unwrap();

        let overdraw = LedgerBatch::posting(NewLedgerEntry::new(
            account.id,
            LedgerKind::AdminAdjustment,
            BalanceType::PlayMoney,
            -101,
        ));
        assert!(matches!(
            store.apply(overdraw).await,
            Err(StoreError::InsufficientFunds { .. })
        ));

        let fetched = store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.balances.play_money, 100);
    }

    #[tokio::test]
    #[ignore]
    async fn test_counter_is_monotonic() {
        let store = store().await;
        let a = store.next_index().await.unwrap();
        let b = store.next_index().await.unwrap();
        assert!(b > a);
    }
}

//! 进程内存储
//!
//! 与 PgStore 语义一致：批次先整体校验、再整体提交，任何一步失败都不留下部分写入。
//! 用于测试和 `storage.backend = "memory"` 的本地运行，进程退出即丢失。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccountRepository, DepositTarget, DerivationCounter, EscrowChange, LedgerBatch,
    LedgerRepository, MatchEscrowRepository, StoreError, WithdrawalChange, WithdrawalRepository,
};
use crate::domain::{
    Account, Balances, BalanceType, EntryStatus, EscrowState, LedgerKind, LedgerTransaction,
    MatchEscrow, NewAccount, NewLedgerEntry, PageRequest, WithdrawalRequest, WithdrawalStatus,
};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    accounts_by_ref: HashMap<String, Uuid>,
    addresses: HashMap<String, Uuid>,
    entries: Vec<LedgerTransaction>,
    entry_index: HashMap<Uuid, usize>,
    idempotency_keys: HashMap<String, usize>,
    escrows: HashMap<Uuid, MatchEscrow>,
    withdrawals: HashMap<Uuid, WithdrawalRequest>,
    derivation_counter: u32,
    next_seq: i64,
}

impl State {
    fn push_entry(&mut self, entry: NewLedgerEntry, now: DateTime<Utc>) -> LedgerTransaction {
        self.next_seq += 1;
        let record = entry.into_record(self.next_seq, now);
        let position = self.entries.len();

        self.entry_index.insert(record.id, position);
        if let Some(key) = &record.idempotency_key {
            self.idempotency_keys.insert(key.clone(), position);
        }
        self.entries.push(record.clone());
        record
    }

    fn credited_total(&self, address: &str) -> u64 {
        let total: i64 = self
            .entries
            .iter()
            .filter(|e| {
                e.kind == LedgerKind::Deposit
                    && e.status == EntryStatus::Confirmed
                    && e.deposit_address.as_deref() == Some(address)
            })
            .filter_map(|e| e.chain_amount_sats)
            .sum();
        total.max(0) as u64
    }

    /// 只读校验，返回各余额的新值；通过后 commit 不会失败
    fn validate(&self, batch: &LedgerBatch) -> Result<Vec<((Uuid, BalanceType), i64)>, StoreError> {
        for account_id in batch.touched_accounts() {
            if !self.accounts.contains_key(&account_id) {
                return Err(StoreError::AccountNotFound(account_id));
            }
        }

        if let Some(guard) = &batch.deposit_guard {
            let actual = self.credited_total(&guard.address);
            if actual != guard.credited_before {
                return Err(StoreError::StaleDepositTotal {
                    address: guard.address.clone(),
                    expected: guard.credited_before,
                    actual,
                });
            }
        }

        let mut balances = Vec::new();
        for ((account_id, balance_type), delta) in batch.net_deltas()? {
            let current = self.accounts[&account_id].balances.get(balance_type);
            let updated = current
                .checked_add(delta)
                .ok_or(StoreError::AmountOverflow {
                    account_id,
                    balance_type,
                })?;
            if updated < 0 {
                return Err(StoreError::InsufficientFunds {
                    account_id,
                    balance_type,
                });
            }
            balances.push(((account_id, balance_type), updated));
        }

        let mut seen_keys = Vec::new();
        for posting in &batch.postings {
            if let Some(key) = &posting.idempotency_key {
                if self.idempotency_keys.contains_key(key) || seen_keys.contains(&key) {
                    return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
                }
                seen_keys.push(key);
            }
        }

        for update in &batch.entry_updates {
            if !self.entry_index.contains_key(&update.entry_id) {
                return Err(StoreError::EntryNotFound(update.entry_id));
            }
        }

        match &batch.escrow {
            Some(EscrowChange::Open(new)) if self.escrows.contains_key(&new.match_id) => {
                return Err(StoreError::EscrowExists(new.match_id));
            }
            Some(EscrowChange::Settle { match_id, .. }) => match self.escrows.get(match_id) {
                None => return Err(StoreError::EscrowNotFound(*match_id)),
                Some(e) if e.state == EscrowState::Settled => {
                    return Err(StoreError::EscrowSettled(*match_id));
                }
                Some(_) => {}
            },
            _ => {}
        }

        if let Some(WithdrawalChange::Transition { id, from, to, .. }) = &batch.withdrawal {
            if !from.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    id: *id,
                    from: *from,
                    to: *to,
                });
            }
            match self.withdrawals.get(id) {
                None => return Err(StoreError::WithdrawalNotFound(*id)),
                Some(w) if w.status != *from => {
                    return Err(StoreError::WithdrawalStateMismatch {
                        id: *id,
                        expected: *from,
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(claim) = &batch.bonus {
            if let Some(last) = self.accounts[&claim.account_id].last_bonus_at {
                if last > claim.latest_allowed_previous() {
                    return Err(StoreError::BonusCooldown {
                        next_claim_at: last + claim.cooldown,
                    });
                }
            }
        }

        Ok(balances)
    }

    fn commit(
        &mut self,
        batch: LedgerBatch,
        balances: Vec<((Uuid, BalanceType), i64)>,
        now: DateTime<Utc>,
    ) -> Vec<LedgerTransaction> {
        for ((account_id, balance_type), updated) in balances {
            if let Some(account) = self.accounts.get_mut(&account_id) {
                *account.balances.get_mut(balance_type) = updated;
                account.updated_at = now;
            }
        }

        let inserted = batch
            .postings
            .into_iter()
            .map(|posting| self.push_entry(posting, now))
            .collect();

        for update in batch.entry_updates {
            if let Some(&position) = self.entry_index.get(&update.entry_id) {
                let entry = &mut self.entries[position];
                entry.status = update.status;
                if update.chain_reference.is_some() {
                    entry.chain_reference = update.chain_reference;
                }
                entry.updated_at = now;
            }
        }

        match batch.escrow {
            Some(EscrowChange::Open(new)) => {
                self.escrows.insert(new.match_id, new.into_record(now));
            }
            Some(EscrowChange::Settle {
                match_id,
                outcome,
                platform_fee,
            }) => {
                if let Some(escrow) = self.escrows.get_mut(&match_id) {
                    escrow.state = EscrowState::Settled;
                    escrow.outcome = Some(outcome);
                    escrow.platform_fee = Some(platform_fee);
                    escrow.settled_at = Some(now);
                }
            }
            None => {}
        }

        match batch.withdrawal {
            Some(WithdrawalChange::Open(new)) => {
                self.withdrawals.insert(new.id, new.into_record(now));
            }
            Some(WithdrawalChange::Transition { id, to, patch, .. }) => {
                if let Some(request) = self.withdrawals.get_mut(&id) {
                    request.status = to;
                    patch.apply_to(request);
                    request.updated_at = now;
                }
            }
            None => {}
        }

        if let Some(claim) = batch.bonus {
            if let Some(account) = self.accounts.get_mut(&claim.account_id) {
                account.last_bonus_at = Some(claim.claimed_at);
            }
        }

        inserted
    }
}

/// 进程内存储
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.accounts_by_ref.get(&new.external_ref) {
            return Ok(state.accounts[id].clone());
        }

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            external_ref: new.external_ref.clone(),
            balances: Balances {
                play_money: new.play_money_grant,
                real_money: 0,
            },
            deposit_address: None,
            derivation_index: None,
            last_bonus_at: None,
            created_at: now,
            updated_at: now,
        };

        state.accounts.insert(account.id, account.clone());
        state
            .accounts_by_ref
            .insert(new.external_ref.clone(), account.id);

        if new.play_money_grant > 0 {
            let grant = NewLedgerEntry::new(
                account.id,
                LedgerKind::SignupGrant,
                BalanceType::PlayMoney,
                new.play_money_grant,
            );
            state.push_entry(grant, now);
        }

        Ok(account)
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Account>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts_by_ref
            .get(external_ref)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn assign_deposit_address(
        &self,
        id: Uuid,
        index: u32,
        address: &str,
    ) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;

        let account = state
            .accounts
            .get(&id)
            .ok_or(StoreError::AccountNotFound(id))?;
        if account.deposit_address.is_some() {
            return Ok(account.clone());
        }
        if state.addresses.contains_key(address) {
            return Err(StoreError::AddressTaken(address.to_string()));
        }

        state.addresses.insert(address.to_string(), id);
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::AccountNotFound(id))?;
        account.deposit_address = Some(address.to_string());
        account.derivation_index = Some(index);
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn list_deposit_targets(&self) -> Result<Vec<DepositTarget>, StoreError> {
        let state = self.state.lock().await;
        let mut targets: Vec<DepositTarget> = state
            .accounts
            .values()
            .filter_map(|a| {
                a.deposit_address.as_ref().map(|address| DepositTarget {
                    account_id: a.id,
                    address: address.clone(),
                })
            })
            .collect();
        targets.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(targets)
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn apply(&self, batch: LedgerBatch) -> Result<Vec<LedgerTransaction>, StoreError> {
        let mut state = self.state.lock().await;
        let balances = state.validate(&batch)?;
        Ok(state.commit(batch, balances, Utc::now()))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency_keys
            .get(key)
            .map(|&position| state.entries[position].clone()))
    }

    async fn credited_deposit_total(&self, address: &str) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.credited_total(address))
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64), StoreError> {
        let state = self.state.lock().await;
        let matching: Vec<&LedgerTransaction> = state
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .collect();

        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();
        Ok((data, total))
    }
}

#[async_trait]
impl MatchEscrowRepository for MemoryStore {
    async fn find_escrow(&self, match_id: Uuid) -> Result<Option<MatchEscrow>, StoreError> {
        Ok(self.state.lock().await.escrows.get(&match_id).cloned())
    }
}

#[async_trait]
impl WithdrawalRepository for MemoryStore {
    async fn find_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| w.status == status && w.updated_at <= updated_before)
            .cloned()
            .collect();
        found.sort_by_key(|w| w.updated_at);
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn list_withdrawals_for_account(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<WithdrawalRequest>, u64), StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| w.account_id == account_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = found.len() as u64;
        let data = found
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok((data, total))
    }
}

#[async_trait]
impl DerivationCounter for MemoryStore {
    async fn next_index(&self) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        // 派生索引只允许非硬化范围
        if state.derivation_counter >= (1 << 31) - 1 {
            return Err(StoreError::CounterExhausted);
        }
        state.derivation_counter += 1;
        Ok(state.derivation_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MatchOutcome, NewMatchEscrow},
        repository::DepositGuard,
    };

    async fn store_with_account(real: i64) -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let account = store
            .create_account(NewAccount {
                external_ref: "user-1".into(),
                play_money_grant: 100,
            })
            .await
            .unwrap();
        if real > 0 {
            store
                .apply(LedgerBatch::posting(NewLedgerEntry::new(
                    account.id,
                    LedgerKind::AdminAdjustment,
                    BalanceType::RealMoney,
                    real,
                )))
                .await
                .unwrap();
        }
        (store, account.id)
    }

    #[tokio::test]
    async fn test_create_account_is_idempotent_on_ref() {
        let (store, id) = store_with_account(0).await;
        let again = store
            .create_account(NewAccount {
                external_ref: "user-1".into(),
                play_money_grant: 100,
            })
            .await
            .unwrap();

        assert_eq!(again.id, id);
        let (entries, total) = store
            .list_transactions(id, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries[0].kind, LedgerKind::SignupGrant);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let (store, a) = store_with_account(10).await;
        let b = store
            .create_account(NewAccount {
                external_ref: "user-2".into(),
                play_money_grant: 0,
            })
            .await
            .unwrap()
            .id;

        let match_id = Uuid::new_v4();
        let batch = LedgerBatch {
            postings: vec![
                NewLedgerEntry::new(a, LedgerKind::StakeEscrow, BalanceType::RealMoney, -10),
                NewLedgerEntry::new(b, LedgerKind::StakeEscrow, BalanceType::RealMoney, -10),
            ],
            escrow: Some(EscrowChange::Open(NewMatchEscrow {
                match_id,
                account_a: a,
                account_b: b,
                balance_type: BalanceType::RealMoney,
                stake: 10,
            })),
            ..Default::default()
        };

        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds { account_id, .. } if account_id == b));
        assert_eq!(
            store.find_account(a).await.unwrap().unwrap().balances.real_money,
            10
        );
        assert!(store.find_escrow(match_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settle_twice_rejected() {
        let (store, a) = store_with_account(0).await;
        let match_id = Uuid::new_v4();
        store
            .apply(LedgerBatch {
                escrow: Some(EscrowChange::Open(NewMatchEscrow {
                    match_id,
                    account_a: a,
                    account_b: a,
                    balance_type: BalanceType::PlayMoney,
                    stake: 0,
                })),
                ..Default::default()
            })
            .await
            .unwrap();

        let settle = || LedgerBatch {
            escrow: Some(EscrowChange::Settle {
                match_id,
                outcome: MatchOutcome::Draw,
                platform_fee: 0,
            }),
            ..Default::default()
        };
        store.apply(settle()).await.unwrap();
        assert!(matches!(
            store.apply(settle()).await,
            Err(StoreError::EscrowSettled(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_overflow_rejected() {
        let (store, a) = store_with_account(10).await;
        let err = store
            .apply(LedgerBatch::posting(NewLedgerEntry::new(
                a,
                LedgerKind::AdminAdjustment,
                BalanceType::RealMoney,
                i64::MAX,
            )))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::AmountOverflow { .. }));
        assert_eq!(
            store.find_account(a).await.unwrap().unwrap().balances.real_money,
            10
        );
    }

    #[tokio::test]
    async fn test_deposit_guard_rejects_stale_total() {
        let (store, a) = store_with_account(0).await;
        let deposit = |sats: u64, key: &str| LedgerBatch {
            postings: vec![NewLedgerEntry::new(
                a,
                LedgerKind::Deposit,
                BalanceType::RealMoney,
                sats as i64 / 20,
            )
            .with_deposit("bc1qa", sats, None, key.to_string())],
            deposit_guard: Some(DepositGuard {
                address: "bc1qa".into(),
                credited_before: 0,
            }),
            ..Default::default()
        };

        store.apply(deposit(100_000, "first")).await.unwrap();
        // 同一差额换了幂等键，仍因已入账总额变化被拒
        let err = store.apply(deposit(100_000, "second")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleDepositTotal { expected: 0, actual: 100_000, .. }
        ));
        assert_eq!(store.credited_deposit_total("bc1qa").await.unwrap(), 100_000);
        assert_eq!(
            store.find_account(a).await.unwrap().unwrap().balances.real_money,
            5_000
        );
    }

    #[tokio::test]
    async fn test_counter_starts_at_one_and_increments() {
        let store = MemoryStore::new();
        assert_eq!(store.next_index().await.unwrap(), 1);
        assert_eq!(store.next_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_address_uniqueness() {
        let (store, a) = store_with_account(0).await;
        let b = store
            .create_account(NewAccount {
                external_ref: "user-2".into(),
                play_money_grant: 0,
            })
            .await
            .unwrap()
            .id;

        store.assign_deposit_address(a, 1, "bc1qa").await.unwrap();
        // 已分配地址不可变
        let unchanged = store.assign_deposit_address(a, 2, "bc1qz").await.unwrap();
        assert_eq!(unchanged.deposit_address.as_deref(), Some("bc1qa"));
        assert!(matches!(
            store.assign_deposit_address(b, 3, "bc1qa").await,
            Err(StoreError::AddressTaken(_))
        ));
    }
}

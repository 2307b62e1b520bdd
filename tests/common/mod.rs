//! 测试辅助模块
//! 提供脚本化链网关、内存存储和组装好的服务

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{consensus::encode::deserialize, Network, Transaction};
use chrono::{DateTime, Utc};
use oxledger::{
    app_state::{AppState, RealMoneyServices},
    config::Config,
    domain::{
        Account, BalanceType, KeyDerivation, LedgerTransaction, MatchEscrow, NewAccount,
        PageRequest, WalletSeed, WithdrawalRequest, WithdrawalStatus,
    },
    repository::{
        AccountRepository, DepositTarget, DerivationCounter, LedgerBatch, LedgerRepository,
        MatchEscrowRepository, MemoryStore, SettlementStore, StoreError, WithdrawalChange,
        WithdrawalRepository,
    },
    service::{
        chain_gateway::{ChainError, ChainGateway, Inflow, SpendableOutput, TxStatus},
        FixedRateSource, LedgerService,
    },
};
use rust_decimal::Decimal;
use tokio::sync::Barrier;
use uuid::Uuid;

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
/// 主网 P2WPKH 目标地址
pub const DESTINATION: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
/// 测试汇率：1 BTC = 50 000，1 分 = 20 聪
pub const BTC_PRICE: i64 = 50_000;

pub fn derivation() -> KeyDerivation {
    KeyDerivation::from_seed(&WalletSeed::new(TEST_MNEMONIC), Network::Bitcoin, 0)
        .expect("test mnemonic must derive")
}

/// 脚本化链网关
#[derive(Default)]
pub struct MockChain {
    balances: Mutex<HashMap<String, u64>>,
    inflows: Mutex<HashMap<String, Vec<Inflow>>>,
    /// 关闭后 list_confirmed_inflows 返回 None
    hide_inflows: Mutex<bool>,
    utxos: Mutex<HashMap<String, Vec<SpendableOutput>>>,
    failing: Mutex<HashSet<String>>,
    broadcast_script: Mutex<VecDeque<Result<String, ChainError>>>,
    broadcast_delay: Mutex<Option<Duration>>,
    known_txs: Mutex<HashSet<String>>,
    /// 下一次 list_confirmed_inflows 先在此等待
    inflow_gate: Mutex<Option<Arc<Barrier>>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    next_txid: Mutex<u64>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 向地址充值一笔已确认交易，返回 txid
    pub fn deposit(&self, address: &str, sats: u64) -> String {
        let txid = {
            let mut next = self.next_txid.lock().unwrap();
            *next += 1;
            format!("{:064x}", *next)
        };
        *self
            .balances
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default() += sats;
        self.inflows
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(Inflow {
                txid: txid.clone(),
                value_sats: sats,
            });
        txid
    }

    pub fn hide_inflows(&self) {
        *self.hide_inflows.lock().unwrap() = true;
    }

    /// 让下一次逐笔查询与其他参与方会合后再返回
    pub fn gate_inflows(&self, barrier: Arc<Barrier>) {
        *self.inflow_gate.lock().unwrap() = Some(barrier);
    }

    /// 给地址一个可花费输出（不计入充值流水）
    pub fn fund_utxo(&self, address: &str, sats: u64) {
        let mut utxos = self.utxos.lock().unwrap();
        let list = utxos.entry(address.to_string()).or_default();
        list.push(SpendableOutput {
            txid: format!("{:064x}", 0xfeed_0000u64 + list.len() as u64),
            vout: 0,
            value_sats: sats,
            script_pubkey: String::new(),
        });
    }

    pub fn fail_address(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn script_broadcast(&self, outcome: Result<String, ChainError>) {
        self.broadcast_script.lock().unwrap().push_back(outcome);
    }

    pub fn delay_broadcast(&self, delay: Duration) {
        *self.broadcast_delay.lock().unwrap() = Some(delay);
    }

    pub fn mark_known(&self, txid: &str) {
        self.known_txs.lock().unwrap().insert(txid.to_string());
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    fn check(&self, address: &str) -> Result<(), ChainError> {
        if self.failing.lock().unwrap().contains(address) {
            return Err(ChainError::Transient(format!("{} unreachable", address)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    async fn get_confirmed_balance(&self, address: &str) -> Result<u64, ChainError> {
        self.check(address)?;
        let from_deposits = self.balances.lock().unwrap().get(address).copied().unwrap_or(0);
        let from_utxos: u64 = self
            .utxos
            .lock()
            .unwrap()
            .get(address)
            .map(|list| list.iter().map(|u| u.value_sats).sum())
            .unwrap_or(0);
        Ok(from_deposits + from_utxos)
    }

    async fn list_spendable_outputs(
        &self,
        address: &str,
    ) -> Result<Vec<SpendableOutput>, ChainError> {
        self.check(address)?;
        Ok(self.utxos.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn estimate_fee_rate(&self) -> Result<u64, ChainError> {
        Ok(2)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ChainError> {
        let delay = *self.broadcast_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.broadcasts.lock().unwrap().push(raw_tx.to_vec());
        let scripted = self.broadcast_script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => {
                let tx: Transaction = deserialize(raw_tx)
                    .map_err(|e| ChainError::Rejected(format!("decode failed: {}", e)))?;
                Ok(tx.txid().to_string())
            }
        }
    }

    async fn transaction_status(&self, txid: &str) -> Result<Option<TxStatus>, ChainError> {
        Ok(self.known_txs.lock().unwrap().contains(txid).then_some(TxStatus {
            confirmed: false,
            block_height: None,
        }))
    }

    async fn list_confirmed_inflows(
        &self,
        address: &str,
    ) -> Result<Option<Vec<Inflow>>, ChainError> {
        self.check(address)?;
        let gate = self.inflow_gate.lock().unwrap().take();
        if let Some(barrier) = gate {
            barrier.wait().await;
        }
        if *self.hide_inflows.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(
            self.inflows.lock().unwrap().get(address).cloned().unwrap_or_default(),
        ))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MockChain>,
    pub state: AppState,
}

impl Harness {
    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.state.ledger
    }

    pub fn real_money(&self) -> &RealMoneyServices {
        self.state.real_money.as_ref().expect("seed configured")
    }

    pub async fn open(&self, name: &str) -> Uuid {
        self.ledger().open_account(name).await.unwrap().id
    }

    pub async fn real_balance(&self, account_id: Uuid) -> i64 {
        self.ledger()
            .balances(account_id)
            .await
            .unwrap()
            .get(BalanceType::RealMoney)
    }

    pub fn hot_address(&self) -> String {
        derivation().address_for(0).unwrap().to_string()
    }

    /// 共享同一存储、各自使用独立链网关的另一个引擎实例
    pub fn peer(&self) -> Harness {
        let chain = MockChain::new();
        let state = assemble(
            self.state.config.as_ref().clone(),
            self.store.clone(),
            chain.clone(),
        );
        Harness {
            store: self.store.clone(),
            chain,
            state,
        }
    }
}

/// 按目标状态注入写入失败的存储
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures: Mutex<Vec<WithdrawalStatus>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: Mutex::new(Vec::new()),
        })
    }

    /// 下一次迁移到 `to` 的批次失败一次
    pub fn fail_transition(&self, to: WithdrawalStatus) {
        self.failures.lock().unwrap().push(to);
    }

    fn should_fail(&self, batch: &LedgerBatch) -> bool {
        let Some(WithdrawalChange::Transition { to, .. }) = &batch.withdrawal else {
            return false;
        };
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|status| status == to) {
            Some(i) => {
                failures.remove(i);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AccountRepository for FlakyStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account, StoreError> {
        self.inner.create_account(new).await
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        self.inner.find_account(id).await
    }

    async fn find_account_by_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Account>, StoreError> {
        self.inner.find_account_by_ref(external_ref).await
    }

    async fn assign_deposit_address(
        &self,
        id: Uuid,
        index: u32,
        address: &str,
    ) -> Result<Account, StoreError> {
        self.inner.assign_deposit_address(id, index, address).await
    }

    async fn list_deposit_targets(&self) -> Result<Vec<DepositTarget>, StoreError> {
        self.inner.list_deposit_targets().await
    }
}

#[async_trait]
impl LedgerRepository for FlakyStore {
    async fn apply(&self, batch: LedgerBatch) -> Result<Vec<LedgerTransaction>, StoreError> {
        if self.should_fail(&batch) {
            return Err(StoreError::Database("connection reset".into()));
        }
        self.inner.apply(batch).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn credited_deposit_total(&self, address: &str) -> Result<u64, StoreError> {
        self.inner.credited_deposit_total(address).await
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64), StoreError> {
        self.inner.list_transactions(account_id, page).await
    }
}

#[async_trait]
impl MatchEscrowRepository for FlakyStore {
    async fn find_escrow(&self, match_id: Uuid) -> Result<Option<MatchEscrow>, StoreError> {
        self.inner.find_escrow(match_id).await
    }
}

#[async_trait]
impl WithdrawalRepository for FlakyStore {
    async fn find_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>, StoreError> {
        self.inner.find_withdrawal(id).await
    }

    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        self.inner
            .list_withdrawals_by_status(status, updated_before, limit)
            .await
    }

    async fn list_withdrawals_for_account(
        &self,
        account_id: Uuid,
        page: PageRequest,
    ) -> Result<(Vec<WithdrawalRequest>, u64), StoreError> {
        self.inner.list_withdrawals_for_account(account_id, page).await
    }
}

#[async_trait]
impl DerivationCounter for FlakyStore {
    async fn next_index(&self) -> Result<u32, StoreError> {
        self.inner.next_index().await
    }
}

pub fn test_config() -> Config {
    let mut config = Config::from_env();
    config.chain.broadcast_timeout_secs = 1;
    config.reconciliation.min_age_secs = 0;
    config.ledger.lock_timeout_ms = 2_000;
    config.deposit_watcher.concurrency = 4;
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

fn assemble(config: Config, store: Arc<dyn SettlementStore>, chain: Arc<MockChain>) -> AppState {
    AppState::assemble(
        Arc::new(config),
        store,
        None,
        None,
        Some(derivation()),
        chain,
        Arc::new(FixedRateSource::new(Decimal::from(BTC_PRICE))),
    )
}

pub fn harness_with(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let state = assemble(config, store.clone(), chain.clone());
    Harness {
        store,
        chain,
        state,
    }
}

/// 服务跑在 FlakyStore 上；Harness.store 仍指向底层内存存储
pub fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = FlakyStore::new(store.clone());
    let chain = MockChain::new();
    let state = assemble(test_config(), flaky.clone(), chain.clone());
    (
        Harness {
            store,
            chain,
            state,
        },
        flaky,
    )
}

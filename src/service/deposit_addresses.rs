//! 充值地址分配
//!
//! 首次请求时从全局计数器取下一个索引派生地址并写入账户；
//! 地址一经分配不再改变，索引永不复用（分配失败时跳过的索引同样作废）。

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    domain::KeyDerivation,
    error::EngineError,
    infrastructure::keyed_lock::KeyedLocks,
    repository::{AccountRepository, DerivationCounter, SettlementStore},
};

pub struct DepositAddressService {
    store: Arc<dyn SettlementStore>,
    derivation: Arc<KeyDerivation>,
    hot_wallet_index: u32,
    locks: KeyedLocks<Uuid>,
}

impl DepositAddressService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        derivation: Arc<KeyDerivation>,
        hot_wallet_index: u32,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            derivation,
            hot_wallet_index,
            locks: KeyedLocks::new(lock_timeout),
        }
    }

    /// 返回账户的充值地址，没有则分配
    pub async fn get_deposit_address(&self, account_id: Uuid) -> Result<String, EngineError> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(EngineError::AccountNotFound(account_id))?;
        if let Some(address) = account.deposit_address {
            return Ok(address);
        }

        let _guard = self
            .locks
            .lock(&account_id)
            .await
            .map_err(|e| EngineError::ConcurrencyConflict(e.to_string()))?;

        // 等锁期间可能已被并发请求分配
        if let Some(address) = self
            .store
            .find_account(account_id)
            .await?
            .and_then(|a| a.deposit_address)
        {
            return Ok(address);
        }

        let index = loop {
            let index = self.store.next_index().await?;
            if index != self.hot_wallet_index {
                break index;
            }
        };

        let address = self.derivation.address_for(index)?.to_string();
        let account = self
            .store
            .assign_deposit_address(account_id, index, &address)
            .await?;

        let assigned = account.deposit_address.ok_or_else(|| {
            EngineError::Internal(format!("deposit address not persisted for {}", account_id))
        })?;

        if assigned == address {
            tracing::info!(
                account_id = %account_id,
                derivation_index = index,
                address = %assigned,
                "Deposit address assigned"
            );
        } else {
            // 另一个实例先完成了分配，本次索引作废
            tracing::warn!(
                account_id = %account_id,
                wasted_index = index,
                "Deposit address assigned concurrently"
            );
        }

        Ok(assigned)
    }
}

//! 进程内按键互斥
//!
//! 同一账户（或同一地址、同一热钱包）的操作串行执行，不同键之间互不阻塞。
//! 多键加锁一律按升序进行，避免交叉等待。

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for lock on {key}")]
pub struct LockTimeout {
    pub key: String,
    pub waited: Duration,
}

/// 持有期间该键被独占
pub struct KeyedGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Ord + Clone + Debug,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // 顺带清理无人持有的槽位
        slots.retain(|k, slot| k == key || Arc::strong_count(slot) > 1);
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn acquire(&self, key: &K) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let slot = self.slot(key);
        tokio::time::timeout(self.timeout, slot.lock_owned())
            .await
            .map_err(|_| LockTimeout {
                key: format!("{:?}", key),
                waited: self.timeout,
            })
    }

    pub async fn lock(&self, key: &K) -> Result<KeyedGuard, LockTimeout> {
        let guard = self.acquire(key).await?;
        Ok(KeyedGuard {
            _guards: vec![guard],
        })
    }

    /// 按升序依次加锁（自动去重）
    pub async fn lock_many(&self, keys: &[K]) -> Result<KeyedGuard, LockTimeout> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in &ordered {
            guards.push(self.acquire(key).await?);
        }
        Ok(KeyedGuard { _guards: guards })
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new(Duration::from_millis(50));
        let _held = locks.lock(&1u32).await.unwrap();

        let err = locks.lock(&1u32).await.err().unwrap();
        assert_eq!(err.key, "1");

        // 其他键不受影响
        assert!(locks.lock(&2u32).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_dedups_keys() {
        let locks = KeyedLocks::new(Duration::from_millis(50));
        let guard = locks.lock_many(&[3u32, 1, 3]).await.unwrap();
        drop(guard);
        assert!(locks.lock_many(&[1u32, 3]).await.is_ok());
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let locks = KeyedLocks::new(Duration::from_millis(50));
        for key in 0u32..10 {
            let _g = locks.lock(&key).await.unwrap();
        }
        let _g = locks.lock(&100u32).await.unwrap();
        assert_eq!(locks.slot_count(), 1);
    }
}

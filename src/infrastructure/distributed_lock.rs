//! 分布式锁
//!
//! 多个引擎实例共享同一数据库时，用 Redis 选出每个周期唯一的充值扫描/提现对账执行者。
//! 账本本身的正确性不依赖这把锁（幂等键 + 行锁已经保证），它只用来避免重复劳动。

use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, Client};
use uuid::Uuid;

/// Redis 分布式锁
#[derive(Clone)]
pub struct DistributedLock {
    redis_client: ConnectionManager,
    namespace: String,
}

/// 锁守卫（离开作用域后异步释放）
pub struct LockGuard {
    lock: DistributedLock,
    lock_key: String,
    lock_value: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.lock_key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.lock_key);
        let value = std::mem::take(&mut self.lock_value);

        // 运行时已关闭时交给 TTL 过期
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = lock.release_internal(&key, &value).await {
                    tracing::warn!(
                        error = ?e,
                        lock_key = %key,
                        "Failed to release lock in Drop"
                    );
                }
            });
        }
    }
}

impl DistributedLock {
    /// 连接 Redis
    ///
    /// `redis_url` 格式：redis://host:port
    pub async fn new(redis_url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self {
            redis_client: conn,
            namespace: namespace.into(),
        })
    }

    fn full_key(&self, lock_key: &str) -> String {
        format!("{}:lock:{}", self.namespace, lock_key)
    }

    /// 尝试获取锁（非阻塞）
    ///
    /// - `Ok(Some(LockGuard))`: 获取成功
    /// - `Ok(None)`: 锁被其他实例持有
    pub async fn try_acquire(&self, lock_key: &str, ttl_secs: u64) -> Result<Option<LockGuard>> {
        let key = self.full_key(lock_key);
        let lock_value = Uuid::new_v4().to_string();
        let mut conn = self.redis_client.clone();

        // SET key value NX EX ttl
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&lock_value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await
            .context("Failed to execute SET NX EX")?;

        if result.is_none() {
            tracing::debug!(lock_key = %key, "Distributed lock held elsewhere");
            return Ok(None);
        }

        tracing::debug!(lock_key = %key, ttl_secs, "Acquired distributed lock");
        Ok(Some(LockGuard {
            lock: self.clone(),
            lock_key: key,
            lock_value,
        }))
    }

    /// 释放锁：只有持有者能删除（Lua 脚本保证原子性）
    async fn release_internal(&self, lock_key: &str, lock_value: &str) -> Result<()> {
        let mut conn = self.redis_client.clone();

        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(lock_key)
            .arg(lock_value)
            .invoke_async(&mut conn)
            .await
            .context("Failed to release lock")?;

        if result == 1 {
            tracing::debug!(lock_key = %lock_key, "Released distributed lock");
        } else {
            tracing::warn!(
                lock_key = %lock_key,
                "Lock not owned by current instance (may have expired)"
            );
        }

        Ok(())
    }

    /// 连通性探测（用于 /readyz）
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.redis_client.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;

        anyhow::ensure!(pong == "PONG", "unexpected PING reply: {}", pong);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // 需要Redis实例
    async fn test_single_holder_per_key() {
        let lock1 = DistributedLock::new("redis://127.0.0.1:6379", "oxledger-test")
            .await
            .unwrap();
        let lock2 = lock1.clone();

        let guard1 = lock1.try_acquire("deposit-scan", 10).await.unwrap();
        assert!(guard1.is_some());

        // 第二个实例拿不到
        assert!(lock2.try_acquire("deposit-scan", 10).await.unwrap().is_none());

        drop(guard1);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(lock2.try_acquire("deposit-scan", 10).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_ping() {
        let lock = DistributedLock::new("redis://127.0.0.1:6379", "oxledger-test")
            .await
            .unwrap();
        lock.ping().await.unwrap();
    }
}

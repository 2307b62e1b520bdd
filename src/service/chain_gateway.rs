//! 链数据网关
//!
//! 对外部区块链数据提供方的窄接口：余额、UTXO、费率、广播、交易状态。
//! 所有操作都可能以可重试的网络错误（Transient / Timeout）或不可重试的
//! 提供方错误（Rejected）失败。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// 网络抖动、5xx、限流
    #[error("transient chain provider error: {0}")]
    Transient(String),

    /// 提供方明确拒绝（如交易格式错误、策略拒绝）
    #[error("chain provider rejected request: {0}")]
    Rejected(String),

    /// 超时：结果未知
    #[error("chain provider timed out after {0:?}")]
    Timeout(Duration),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChainError::Rejected(_))
    }
}

/// 可花费输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutput {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    /// scriptPubKey（十六进制）
    pub script_pubkey: String,
}

/// 已确认的入账
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inflow {
    pub txid: String,
    pub value_sats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// 地址已确认余额（聪）
    async fn get_confirmed_balance(&self, address: &str) -> Result<u64, ChainError>;

    async fn list_spendable_outputs(&self, address: &str)
        -> Result<Vec<SpendableOutput>, ChainError>;

    /// 费率（sat/vB，至少为 1）
    async fn estimate_fee_rate(&self) -> Result<u64, ChainError>;

    /// 广播已签名交易，返回 txid
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ChainError>;

    /// 提供方不认识该交易时返回 None
    async fn transaction_status(&self, txid: &str) -> Result<Option<TxStatus>, ChainError>;

    /// 逐笔列出地址的已确认入账；不支持时返回 None
    async fn list_confirmed_inflows(&self, address: &str)
        -> Result<Option<Vec<Inflow>>, ChainError>;
}

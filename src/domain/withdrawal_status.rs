//! 提现请求状态机
//!
//! requested → building → broadcast → confirmed
//! building / broadcast → failed_refunded

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// 已扣款，尚未开始构建交易
    Requested,

    /// 正在选币、签名
    Building,

    /// 已签名并提交广播（结果可能未知，等待对账）
    Broadcast,

    /// 广播成功，资金已离开托管
    Confirmed,

    /// 已失败并退款
    FailedRefunded,
}

impl WithdrawalStatus {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Requested => "提现已受理",
            Self::Building => "交易构建中",
            Self::Broadcast => "交易已广播",
            Self::Confirmed => "提现已完成",
            Self::FailedRefunded => "提现失败已退款",
        }
    }

    /// 是否为最终状态
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Confirmed | Self::FailedRefunded)
    }

    /// 验证状态转换合法性
    pub fn can_transition_to(&self, target: &Self) -> bool {
        use WithdrawalStatus::*;

        matches!(
            (self, target),
            (Requested, Building)
                | (Requested, FailedRefunded)
                | (Building, Broadcast)
                | (Building, FailedRefunded)
                | (Broadcast, Confirmed)
                | (Broadcast, FailedRefunded)
        )
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Building => "building",
            Self::Broadcast => "broadcast",
            Self::Confirmed => "confirmed",
            Self::FailedRefunded => "failed_refunded",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "building" => Some(Self::Building),
            "broadcast" => Some(Self::Broadcast),
            "confirmed" => Some(Self::Confirmed),
            "failed_refunded" | "failed-refunded" => Some(Self::FailedRefunded),
            _ => None,
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// 提现请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub account_id: Uuid,
    /// 扣减的真实货币（法币最小单位）
    pub amount: i64,
    /// 按请求时汇率折算的链上金额
    pub amount_sats: i64,
    pub destination: String,
    pub status: WithdrawalStatus,
    /// 出款热钱包的派生索引
    pub source_index: u32,
    /// 对应的扣款流水
    pub debit_entry_id: Uuid,
    pub tx_ref: Option<String>,
    /// 已签名交易（十六进制），用于对账时重新广播
    pub raw_tx: Option<String>,
    pub network_fee_sats: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub amount_sats: i64,
    pub destination: String,
    pub source_index: u32,
    pub debit_entry_id: Uuid,
}

impl NewWithdrawal {
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> WithdrawalRequest {
        WithdrawalRequest {
            id: self.id,
            account_id: self.account_id,
            amount: self.amount,
            amount_sats: self.amount_sats,
            destination: self.destination,
            status: WithdrawalStatus::Requested,
            source_index: self.source_index,
            debit_entry_id: self.debit_entry_id,
            tx_ref: None,
            raw_tx: None,
            network_fee_sats: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 状态转换时一并写入的字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawalPatch {
    pub tx_ref: Option<String>,
    pub raw_tx: Option<String>,
    pub network_fee_sats: Option<i64>,
    pub failure_reason: Option<String>,
}

impl WithdrawalPatch {
    pub(crate) fn apply_to(&self, request: &mut WithdrawalRequest) {
        if let Some(tx_ref) = &self.tx_ref {
            request.tx_ref = Some(tx_ref.clone());
        }
        if let Some(raw_tx) = &self.raw_tx {
            request.raw_tx = Some(raw_tx.clone());
        }
        if let Some(fee) = self.network_fee_sats {
            request.network_fee_sats = Some(fee);
        }
        if let Some(reason) = &self.failure_reason {
            request.failure_reason = Some(reason.clone());
        }
    }
}

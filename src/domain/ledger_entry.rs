//! 账本流水
//!
//! 所有影响余额的事件都追加一条 LedgerTransaction，只追加不删除。
//! 充值流水的幂等键是内容指纹（地址 + 金额 + 链上引用），同一笔链上入账最多记账一次。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::balance::BalanceType;

/// 流水类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    WithdrawalRefund,
    StakeEscrow,
    StakePayout,
    StakeRefund,
    AdminAdjustment,
    SignupGrant,
    DailyBonus,
}

impl LedgerKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::WithdrawalRefund => "withdrawal-refund",
            Self::StakeEscrow => "stake-escrow",
            Self::StakePayout => "stake-payout",
            Self::StakeRefund => "stake-refund",
            Self::AdminAdjustment => "admin-adjustment",
            Self::SignupGrant => "signup-grant",
            Self::DailyBonus => "daily-bonus",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "withdrawal-refund" => Some(Self::WithdrawalRefund),
            "stake-escrow" => Some(Self::StakeEscrow),
            "stake-payout" => Some(Self::StakePayout),
            "stake-refund" => Some(Self::StakeRefund),
            "admin-adjustment" => Some(Self::AdminAdjustment),
            "signup-grant" => Some(Self::SignupGrant),
            "daily-bonus" => Some(Self::DailyBonus),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// 流水状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// 等待链上结果（提现已扣款、尚未广播成功）
    Pending,
    Confirmed,
    /// 已失败（对应金额已通过退款流水返还）
    Failed,
}

impl EntryStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 账本流水记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    /// 全局单调序号，用于倒序分页
    pub seq: i64,
    pub account_id: Uuid,
    pub kind: LedgerKind,
    pub balance_type: BalanceType,
    /// 带符号的余额变动（正数入账，负数出账）
    pub delta: i64,
    pub status: EntryStatus,
    pub idempotency_key: Option<String>,
    pub match_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub deposit_address: Option<String>,
    pub chain_amount_sats: Option<i64>,
    pub chain_reference: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn amount(&self) -> i64 {
        self.delta.abs()
    }
}

/// 待写入的流水（同时描述一次余额变动）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    /// 客户端生成，便于在同一批次中引用
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: LedgerKind,
    pub balance_type: BalanceType,
    pub delta: i64,
    pub status: EntryStatus,
    pub idempotency_key: Option<String>,
    pub match_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub deposit_address: Option<String>,
    pub chain_amount_sats: Option<i64>,
    pub chain_reference: Option<String>,
    pub note: Option<String>,
}

impl NewLedgerEntry {
    pub fn new(account_id: Uuid, kind: LedgerKind, balance_type: BalanceType, delta: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            balance_type,
            delta,
            status: EntryStatus::Confirmed,
            idempotency_key: None,
            match_id: None,
            withdrawal_id: None,
            deposit_address: None,
            chain_amount_sats: None,
            chain_reference: None,
            note: None,
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_match(mut self, match_id: Uuid) -> Self {
        self.match_id = Some(match_id);
        self
    }

    pub fn with_withdrawal(mut self, withdrawal_id: Uuid) -> Self {
        self.withdrawal_id = Some(withdrawal_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// 充值入账：记录链上金额与幂等键
    pub fn with_deposit(
        mut self,
        address: &str,
        amount_sats: u64,
        chain_reference: Option<String>,
        idempotency_key: String,
    ) -> Self {
        self.deposit_address = Some(address.to_string());
        self.chain_amount_sats = Some(amount_sats as i64);
        self.chain_reference = chain_reference;
        self.idempotency_key = Some(idempotency_key);
        self
    }

    /// 物化为已落库的流水
    pub(crate) fn into_record(self, seq: i64, now: DateTime<Utc>) -> LedgerTransaction {
        LedgerTransaction {
            id: self.id,
            seq,
            account_id: self.account_id,
            kind: self.kind,
            balance_type: self.balance_type,
            delta: self.delta,
            status: self.status,
            idempotency_key: self.idempotency_key,
            match_id: self.match_id,
            withdrawal_id: self.withdrawal_id,
            deposit_address: self.deposit_address,
            chain_amount_sats: self.chain_amount_sats,
            chain_reference: self.chain_reference,
            note: self.note,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 充值幂等指纹的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositFingerprint<'a> {
    /// 服务商给出了来源交易：(地址, txid, 金额)
    Inflow { txid: &'a str, amount_sats: u64 },
    /// 仅能看到余额差额：(地址, 已入账总额, 差额)
    BalanceDelta { credited_before: u64, delta_sats: u64 },
}

/// 生成充值幂等键（内容指纹）
pub fn deposit_idempotency_key(address: &str, fingerprint: DepositFingerprint<'_>) -> String {
    let material = match fingerprint {
        DepositFingerprint::Inflow { txid, amount_sats } => {
            format!("deposit|inflow|{}|{}|{}", address, txid, amount_sats)
        }
        DepositFingerprint::BalanceDelta {
            credited_before,
            delta_sats,
        } => format!(
            "deposit|delta|{}|{}|{}",
            address, credited_before, delta_sats
        ),
    };

    format!("dep_{}", hex::encode(Sha256::digest(material.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_db_roundtrip_is_closed() {
        for kind in [
            LedgerKind::Deposit,
            LedgerKind::Withdrawal,
            LedgerKind::WithdrawalRefund,
            LedgerKind::StakeEscrow,
            LedgerKind::StakePayout,
            LedgerKind::StakeRefund,
            LedgerKind::AdminAdjustment,
            LedgerKind::SignupGrant,
            LedgerKind::DailyBonus,
        ] {
            assert_eq!(LedgerKind::from_db(kind.to_db_string()), Some(kind));
        }
        assert_eq!(LedgerKind::from_db("bet"), None);
    }

    #[test]
    fn test_deposit_key_is_deterministic() {
        let a = deposit_idempotency_key(
            "bc1qexample",
            DepositFingerprint::Inflow {
                txid: "ab",
                amount_sats: 1000,
            },
        );
        let b = deposit_idempotency_key(
            "bc1qexample",
            DepositFingerprint::Inflow {
                txid: "ab",
                amount_sats: 1000,
            },
        );
        assert_eq!(a, b);
        assert!(a.starts_with("dep_"));
    }

    #[test]
    fn test_equal_deltas_at_different_points_get_distinct_keys() {
        // 同一地址先后两笔相同金额的充值必须被区分
        let first = deposit_idempotency_key(
            "bc1qexample",
            DepositFingerprint::BalanceDelta {
                credited_before: 0,
                delta_sats: 5000,
            },
        );
        let second = deposit_idempotency_key(
            "bc1qexample",
            DepositFingerprint::BalanceDelta {
                credited_before: 5000,
                delta_sats: 5000,
            },
        );
        assert_ne!(first, second);
    }

    #[test]
    fn test_inflow_and_delta_keys_never_collide() {
        let inflow = deposit_idempotency_key(
            "addr",
            DepositFingerprint::Inflow {
                txid: "0",
                amount_sats: 10,
            },
        );
        let delta = deposit_idempotency_key(
            "addr",
            DepositFingerprint::BalanceDelta {
                credited_before: 0,
                delta_sats: 10,
            },
        );
        assert_ne!(inflow, delta);
    }
}

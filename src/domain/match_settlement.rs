//! 对局押注的资金生命周期
//!
//! uncommitted（无记录）→ escrowed → settled。
//! 胜方获得 2×押注 减去平台手续费（向下取整），平局双方各退回押注，
//! 弃权视为对方获胜（同样收取手续费）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{balance::BalanceType, ledger_entry::LedgerKind};

/// 默认平台手续费：5%（以基点表示）
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    AWins,
    BWins,
    Draw,
    ForfeitByA,
    ForfeitByB,
}

impl MatchOutcome {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::AWins => "a_wins",
            Self::BWins => "b_wins",
            Self::Draw => "draw",
            Self::ForfeitByA => "forfeit_by_a",
            Self::ForfeitByB => "forfeit_by_b",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "a_wins" => Some(Self::AWins),
            "b_wins" => Some(Self::BWins),
            "draw" => Some(Self::Draw),
            "forfeit_by_a" => Some(Self::ForfeitByA),
            "forfeit_by_b" => Some(Self::ForfeitByB),
            _ => None,
        }
    }

    /// 获胜方（平局为 None）
    pub fn winner(&self) -> Option<Side> {
        match self {
            Self::AWins | Self::ForfeitByB => Some(Side::A),
            Self::BWins | Self::ForfeitByA => Some(Side::B),
            Self::Draw => None,
        }
    }
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Escrowed,
    Settled,
}

impl EscrowState {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Escrowed => "escrowed",
            Self::Settled => "settled",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "escrowed" => Some(Self::Escrowed),
            "settled" => Some(Self::Settled),
            _ => None,
        }
    }
}

/// 对局托管记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEscrow {
    pub match_id: Uuid,
    pub account_a: Uuid,
    pub account_b: Uuid,
    pub balance_type: BalanceType,
    pub stake: i64,
    pub state: EscrowState,
    pub outcome: Option<MatchOutcome>,
    pub platform_fee: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl MatchEscrow {
    pub fn account(&self, side: Side) -> Uuid {
        match side {
            Side::A => self.account_a,
            Side::B => self.account_b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMatchEscrow {
    pub match_id: Uuid,
    pub account_a: Uuid,
    pub account_b: Uuid,
    pub balance_type: BalanceType,
    pub stake: i64,
}

impl NewMatchEscrow {
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> MatchEscrow {
        MatchEscrow {
            match_id: self.match_id,
            account_a: self.account_a,
            account_b: self.account_b,
            balance_type: self.balance_type,
            stake: self.stake,
            state: EscrowState::Escrowed,
            outcome: None,
            platform_fee: None,
            created_at: now,
            settled_at: None,
        }
    }
}

/// 平台手续费：pot × bps / 10000，向下取整
pub fn platform_fee(pot: i64, fee_bps: u32) -> i64 {
    ((pot as i128 * fee_bps as i128) / 10_000) as i64
}

/// 单笔结算入账
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub account_id: Uuid,
    pub kind: LedgerKind,
    pub amount: i64,
}

/// 结算方案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub payouts: Vec<Payout>,
    pub fee: i64,
}

/// 根据对局结果计算入账；不涉及任何扣款
///
/// 奖池超出 i64 范围时返回 None。
pub fn plan_settlement(
    escrow: &MatchEscrow,
    outcome: MatchOutcome,
    fee_bps: u32,
) -> Option<SettlementPlan> {
    let plan = match outcome.winner() {
        Some(side) => {
            let pot = escrow.stake.checked_mul(2)?;
            let fee = platform_fee(pot, fee_bps);
            SettlementPlan {
                payouts: vec![Payout {
                    account_id: escrow.account(side),
                    kind: LedgerKind::StakePayout,
                    amount: pot - fee,
                }],
                fee,
            }
        }
        None => SettlementPlan {
            payouts: [Side::A, Side::B]
                .into_iter()
                .map(|side| Payout {
                    account_id: escrow.account(side),
                    kind: LedgerKind::StakeRefund,
                    amount: escrow.stake,
                })
                .collect(),
            fee: 0,
        },
    };
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn escrow(stake: i64) -> MatchEscrow {
        NewMatchEscrow {
            match_id: Uuid::new_v4(),
            account_a: Uuid::new_v4(),
            account_b: Uuid::new_v4(),
            balance_type: BalanceType::RealMoney,
            stake,
        }
        .into_record(Utc::now())
    }

    #[test]
    fn test_fee_rounds_down() {
        assert_eq!(platform_fee(20, 500), 1);
        assert_eq!(platform_fee(19, 500), 0);
        assert_eq!(platform_fee(1_000, 500), 50);
        assert_eq!(platform_fee(10, 0), 0);
    }

    #[test]
    fn test_win_pays_pot_minus_fee() {
        let e = escrow(10);
        let plan = plan_settlement(&e, MatchOutcome::AWins, DEFAULT_PLATFORM_FEE_BPS).unwrap();

        assert_eq!(plan.fee, 1);
        assert_eq!(
            plan.payouts,
            vec![Payout {
                account_id: e.account_a,
                kind: LedgerKind::StakePayout,
                amount: 19,
            }]
        );
    }

    #[test]
    fn test_forfeit_is_win_for_other_side() {
        let e = escrow(100);
        let plan = plan_settlement(&e, MatchOutcome::ForfeitByA, DEFAULT_PLATFORM_FEE_BPS).unwrap();

        assert_eq!(plan.payouts.len(), 1);
        assert_eq!(plan.payouts[0].account_id, e.account_b);
        assert_eq!(plan.payouts[0].amount, 190);
        assert_eq!(plan.fee, 10);
    }

    #[test]
    fn test_draw_refunds_both_without_fee() {
        let e = escrow(25);
        let plan = plan_settlement(&e, MatchOutcome::Draw, DEFAULT_PLATFORM_FEE_BPS).unwrap();

        assert_eq!(plan.fee, 0);
        assert_eq!(plan.payouts.len(), 2);
        assert!(plan
            .payouts
            .iter()
            .all(|p| p.amount == 25 && p.kind == LedgerKind::StakeRefund));
    }

    #[test]
    fn test_win_conserves_value() {
        // 双方余额变化 + 手续费 = 0
        for stake in [1_i64, 7, 10, 333, 1_000_000] {
            let e = escrow(stake);
            let plan = plan_settlement(&e, MatchOutcome::BWins, DEFAULT_PLATFORM_FEE_BPS).unwrap();
            let paid: i64 = plan.payouts.iter().map(|p| p.amount).sum();
            assert_eq!(-2 * stake + paid + plan.fee, 0);
        }
    }

    #[test]
    fn test_oversized_pot_has_no_plan() {
        let e = escrow(i64::MAX / 2 + 1);
        assert!(plan_settlement(&e, MatchOutcome::AWins, DEFAULT_PLATFORM_FEE_BPS).is_none());
        // 平局只退还押注，不需要奖池
        assert!(plan_settlement(&e, MatchOutcome::Draw, DEFAULT_PLATFORM_FEE_BPS).is_some());
    }
}

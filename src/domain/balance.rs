//! 余额类型与账户模型
//!
//! 两种余额（娱乐币 / 真实货币）使用封闭枚举表示，杜绝第三种取值

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 余额类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    /// 娱乐币（无现金价值）
    PlayMoney,
    /// 真实货币（由比特币充值支撑，单位：法币最小单位）
    RealMoney,
}

impl BalanceType {
    /// 转换为数据库字符串
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::PlayMoney => "play_money",
            Self::RealMoney => "real_money",
        }
    }

    /// 对应的 accounts 表余额列
    pub(crate) fn balance_column(&self) -> &'static str {
        match self {
            Self::PlayMoney => "play_balance",
            Self::RealMoney => "real_balance",
        }
    }
}

impl FromStr for BalanceType {
    type Err = String;

    /// 兼容旧数据中的 fun / real 标记
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "play_money" | "fun" | "play" => Ok(Self::PlayMoney),
            "real_money" | "real" | "cash" => Ok(Self::RealMoney),
            other => Err(format!("unknown balance type: {}", other)),
        }
    }
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// 账户余额快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub play_money: i64,
    pub real_money: i64,
}

impl Balances {
    pub fn get(&self, balance_type: BalanceType) -> i64 {
        match balance_type {
            BalanceType::PlayMoney => self.play_money,
            BalanceType::RealMoney => self.real_money,
        }
    }

    pub(crate) fn get_mut(&mut self, balance_type: BalanceType) -> &mut i64 {
        match balance_type {
            BalanceType::PlayMoney => &mut self.play_money,
            BalanceType::RealMoney => &mut self.real_money,
        }
    }
}

/// 账户（每个注册用户一个）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// 路由/会话层提供的稳定用户标识
    pub external_ref: String,
    pub balances: Balances,
    /// 充值地址，首次请求时分配，分配后不可变
    pub deposit_address: Option<String>,
    /// 产生充值地址的派生索引
    pub derivation_index: Option<u32>,
    pub last_bonus_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 开户参数
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub external_ref: String,
    /// 注册赠送的娱乐币
    pub play_money_grant: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_type_parsing() {
        assert_eq!("fun".parse::<BalanceType>().unwrap(), BalanceType::PlayMoney);
        assert_eq!("real".parse::<BalanceType>().unwrap(), BalanceType::RealMoney);
        assert_eq!(
            "real_money".parse::<BalanceType>().unwrap(),
            BalanceType::RealMoney
        );
        assert!("bonus".parse::<BalanceType>().is_err());
    }

    #[test]
    fn test_balances_accessors() {
        let mut balances = Balances {
            play_money: 100,
            real_money: 0,
        };
        *balances.get_mut(BalanceType::RealMoney) += 25;

        assert_eq!(balances.get(BalanceType::PlayMoney), 100);
        assert_eq!(balances.get(BalanceType::RealMoney), 25);
    }
}

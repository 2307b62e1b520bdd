//! Domain 模块
//!
//! 余额、流水、对局托管和提现的领域模型，以及密钥派生

pub mod balance;
pub mod derivation;
pub mod ledger_entry;
pub mod match_settlement;
pub mod pagination;
pub mod withdrawal_status;

// 重新导出常用类型
pub use balance::{Account, BalanceType, Balances, NewAccount};
pub use derivation::{DerivationError, HotKey, KeyDerivation, WalletSeed};
pub use ledger_entry::{
    deposit_idempotency_key, DepositFingerprint, EntryStatus, LedgerKind, LedgerTransaction,
    NewLedgerEntry,
};
pub use match_settlement::{
    plan_settlement, platform_fee, EscrowState, MatchEscrow, MatchOutcome, NewMatchEscrow,
    SettlementPlan,
};
pub use pagination::{PageRequest, Paginated};
pub use withdrawal_status::{NewWithdrawal, WithdrawalPatch, WithdrawalRequest, WithdrawalStatus};

//! 结算引擎错误类型
//!
//! 各层使用自己的错误枚举（StoreError / ChainError / BuildError / RateError），
//! 在服务边界统一收敛为 EngineError，并提供稳定的错误码。

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    domain::{BalanceType, DerivationError},
    repository::StoreError,
    service::{chain_gateway::ChainError, rate_source::RateError, transaction_builder::BuildError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    // 用户可见、无需重试
    #[error("insufficient {balance_type} funds on account {account_id}")]
    InsufficientFunds {
        account_id: Uuid,
        balance_type: BalanceType,
    },

    /// 热钱包链上余额不足以支付提现
    #[error("hot wallet cannot cover withdrawal: available {available} sats, required {required} sats")]
    HotWalletDepleted { available: u64, required: u64 },

    #[error("account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("escrow not found for match {0}")]
    EscrowNotFound(Uuid),

    #[error("escrow already exists for match {0}")]
    EscrowAlreadyExists(Uuid),

    #[error("match {0} already settled")]
    EscrowAlreadySettled(Uuid),

    #[error("withdrawal not found: {0}")]
    WithdrawalNotFound(Uuid),

    #[error("daily bonus not available until {next_claim_at}")]
    BonusNotYetAvailable { next_claim_at: DateTime<Utc> },

    // 链交互
    #[error("chain provider temporarily unavailable: {0}")]
    ChainTransient(String),

    #[error("transaction rejected by chain provider: {0}")]
    ChainRejected(String),

    #[error("exchange rate unavailable: {0}")]
    RateUnavailable(String),

    // 系统
    #[error("configuration error: {0}")]
    ConfigurationFatal(String),

    #[error("concurrent modification, retries exhausted: {0}")]
    ConcurrencyConflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// 稳定错误码（snake_case）
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::HotWalletDepleted { .. } => "hot_wallet_depleted",
            Self::AccountNotFound(_) => "account_not_found",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidAddress(_) => "invalid_address",
            Self::InvalidRequest(_) => "invalid_request",
            Self::EscrowNotFound(_) => "escrow_not_found",
            Self::EscrowAlreadyExists(_) => "escrow_already_exists",
            Self::EscrowAlreadySettled(_) => "escrow_already_settled",
            Self::WithdrawalNotFound(_) => "withdrawal_not_found",
            Self::BonusNotYetAvailable { .. } => "bonus_not_yet_available",
            Self::ChainTransient(_) => "chain_transient",
            Self::ChainRejected(_) => "chain_rejected",
            Self::RateUnavailable(_) => "rate_unavailable",
            Self::ConfigurationFatal(_) => "configuration_fatal",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal",
        }
    }

    /// 是否值得调用方稍后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChainTransient(_)
                | Self::RateUnavailable(_)
                | Self::ConcurrencyConflict(_)
                | Self::Storage(_)
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            StoreError::InsufficientFunds {
                account_id,
                balance_type,
            } => Self::InsufficientFunds {
                account_id,
                balance_type,
            },
            StoreError::EscrowExists(id) => Self::EscrowAlreadyExists(id),
            StoreError::EscrowNotFound(id) => Self::EscrowNotFound(id),
            StoreError::EscrowSettled(id) => Self::EscrowAlreadySettled(id),
            StoreError::WithdrawalNotFound(id) => Self::WithdrawalNotFound(id),
            StoreError::BonusCooldown { next_claim_at } => {
                Self::BonusNotYetAvailable { next_claim_at }
            }
            StoreError::Conflict(msg) => Self::ConcurrencyConflict(msg),
            e @ StoreError::AmountOverflow { .. } => Self::InvalidAmount(e.to_string()),
            e @ StoreError::StaleDepositTotal { .. } => Self::ConcurrencyConflict(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<ChainError> for EngineError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rejected(msg) => Self::ChainRejected(msg),
            ChainError::Transient(msg) => Self::ChainTransient(msg),
            ChainError::Timeout(d) => Self::ChainTransient(format!("timed out after {:?}", d)),
        }
    }
}

impl From<BuildError> for EngineError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::InsufficientFunds {
                available,
                required,
            } => Self::HotWalletDepleted {
                available,
                required,
            },
            BuildError::DustAmount { .. } => Self::InvalidAmount(err.to_string()),
            BuildError::InvalidDestination(msg) => Self::InvalidAddress(msg),
            BuildError::Chain(chain) => chain.into(),
            BuildError::Key(e) => Self::Internal(e.to_string()),
            BuildError::Signing(msg) => Self::Internal(msg),
        }
    }
}

impl From<RateError> for EngineError {
    fn from(err: RateError) -> Self {
        Self::RateUnavailable(err.to_string())
    }
}

impl From<DerivationError> for EngineError {
    fn from(err: DerivationError) -> Self {
        match err {
            DerivationError::MissingSeed | DerivationError::InvalidMnemonic => {
                Self::ConfigurationFatal(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let id = Uuid::nil();
        assert_eq!(
            EngineError::InsufficientFunds {
                account_id: id,
                balance_type: BalanceType::RealMoney
            }
            .code(),
            "insufficient_funds"
        );
        assert_eq!(EngineError::EscrowAlreadySettled(id).code(), "escrow_already_settled");
        assert_eq!(
            EngineError::ConfigurationFatal("seed".into()).code(),
            "configuration_fatal"
        );
    }

    #[test]
    fn test_chain_errors_map_to_taxonomy() {
        let rejected: EngineError = ChainError::Rejected("bad-txns".into()).into();
        assert!(matches!(rejected, EngineError::ChainRejected(_)));
        assert!(!rejected.is_retryable());

        let timeout: EngineError = ChainError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(timeout, EngineError::ChainTransient(_)));
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_store_conflict_is_retryable() {
        let err: EngineError = StoreError::Conflict("40001".into()).into();
        assert!(matches!(err, EngineError::ConcurrencyConflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_builder_shortfall_is_hot_wallet_depleted() {
        let err: EngineError = BuildError::InsufficientFunds {
            available: 1_000,
            required: 5_000,
        }
        .into();
        assert_eq!(err.code(), "hot_wallet_depleted");
    }
}

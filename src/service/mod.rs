pub mod chain_gateway;
pub mod deposit_addresses;
pub mod deposit_watcher; // 充值轮询入账
pub mod esplora_gateway;
pub mod ledger_service;
pub mod rate_source;
pub mod transaction_builder; // 选币 + 签名
pub mod withdrawal_orchestrator;

pub use chain_gateway::{ChainError, ChainGateway};
pub use deposit_addresses::DepositAddressService;
pub use deposit_watcher::{DepositWatcher, ScanReport};
pub use esplora_gateway::EsploraGateway;
pub use ledger_service::{EscrowRequest, LedgerService, LedgerSettings, Settlement};
pub use rate_source::{CoinGeckoRateSource, FixedRateSource, RateSource};
pub use transaction_builder::{BuildError, SignedTransaction, TransactionBuilder};
pub use withdrawal_orchestrator::{
    HotWalletStatus, ReconcileReport, WithdrawalOrchestrator, WithdrawalSettings,
};

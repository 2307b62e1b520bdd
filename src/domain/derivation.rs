//! 托管钱包密钥派生
//!
//! 所有充值地址和热钱包地址都从同一个主种子按 BIP84 路径派生：
//! `m/84'/{coin}'/{account}'/0/{index}`，地址格式为 P2WPKH (bc1q...)。
//! 同一 (种子, 索引) 永远得到同一地址；主种子只存在于进程内存，不落库、不打印。

use std::fmt;

use bip39::{Language, Mnemonic};
use bitcoin::{
    secp256k1::{PublicKey as Secp256k1PublicKey, SecretKey},
    Address, Network, PublicKey as BitcoinPublicKey,
};
use coins_bip32::{path::DerivationPath, prelude::*};
use k256::ecdsa::SigningKey;
use thiserror::Error;
use zeroize::Zeroizing;

/// 主种子环境变量
pub const WALLET_SEED_ENV: &str = "WALLET_SEED";

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("wallet seed is not configured")]
    MissingSeed,

    #[error("invalid wallet seed mnemonic")]
    InvalidMnemonic,

    #[error("key derivation failed for path {path}: {reason}")]
    Derive { path: String, reason: String },

    #[error("invalid derived public key: {0}")]
    InvalidKey(String),
}

/// BIP39 助记词形式的主种子
///
/// 内存在 drop 时清零，Debug 输出已脱敏
pub struct WalletSeed(Zeroizing<String>);

impl WalletSeed {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(phrase.into()))
    }

    /// 从 `WALLET_SEED` 读取；未设置或为空返回 None
    pub fn from_env() -> Option<Self> {
        std::env::var(WALLET_SEED_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }

    fn to_seed_bytes(&self) -> Result<Zeroizing<[u8; 64]>, DerivationError> {
        let mnemonic = Mnemonic::parse_in(Language::English, self.0.as_str())
            .map_err(|_| DerivationError::InvalidMnemonic)?;
        Ok(Zeroizing::new(mnemonic.to_seed("")))
    }
}

impl fmt::Debug for WalletSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WalletSeed(<redacted>)")
    }
}

/// 单个索引上的签名密钥，只在交易构建内部使用
pub struct HotKey {
    pub(crate) secret: SecretKey,
    pub(crate) public: BitcoinPublicKey,
}

impl fmt::Debug for HotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotKey")
            .field("public", &self.public.to_string())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// 确定性地址/密钥派生器
pub struct KeyDerivation {
    master: XPriv,
    network: Network,
    account: u32,
}

impl KeyDerivation {
    pub fn from_seed(
        seed: &WalletSeed,
        network: Network,
        account: u32,
    ) -> Result<Self, DerivationError> {
        let seed_bytes = seed.to_seed_bytes()?;
        let master = XPriv::root_from_seed(seed_bytes.as_ref(), None).map_err(|e| {
            DerivationError::Derive {
                path: "m".to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            master,
            network,
            account,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// BIP84 派生路径（主网 coin=0，其余网络 coin=1）
    pub fn path_for(&self, index: u32) -> String {
        let coin = if self.network == Network::Bitcoin { 0 } else { 1 };
        format!("m/84'/{}'/{}'/0/{}", coin, self.account, index)
    }

    /// 索引对应的收款地址
    pub fn address_for(&self, index: u32) -> Result<Address, DerivationError> {
        let key = self.signing_key_for(index)?;
        Address::p2wpkh(&key.public, self.network)
            .map_err(|e| DerivationError::InvalidKey(e.to_string()))
    }

    /// 索引对应的签名密钥
    pub(crate) fn signing_key_for(&self, index: u32) -> Result<HotKey, DerivationError> {
        let path = self.path_for(index);
        let derivation_path =
            path.parse::<DerivationPath>()
                .map_err(|e| DerivationError::Derive {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

        let derived = self
            .master
            .derive_path(&derivation_path)
            .map_err(|e| DerivationError::Derive {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        // XPriv 实现 AsRef<SigningKey>
        let signing_key: &SigningKey = derived.as_ref();
        let secret_bytes = Zeroizing::new(signing_key.to_bytes());
        let secret = SecretKey::from_slice(secret_bytes.as_slice())
            .map_err(|e| DerivationError::InvalidKey(e.to_string()))?;

        let compressed = signing_key.verifying_key().to_encoded_point(true);
        let secp_pubkey = Secp256k1PublicKey::from_slice(compressed.as_bytes())
            .map_err(|e| DerivationError::InvalidKey(e.to_string()))?;

        Ok(HotKey {
            secret,
            public: BitcoinPublicKey::new(secp_pubkey),
        })
    }
}

impl fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("network", &self.network)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

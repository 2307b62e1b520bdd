//! 提现交易构建器
//!
//! 从热钱包地址的已确认 UTXO 中贪心选币，按 P2WPKH 体积模型逐个输入重算手续费，
//! 找零低于粉尘阈值时并入手续费，最后用 `source_index` 上的密钥做 SegWit v0 签名。
//! 签名密钥只在 [`TransactionBuilder::build`] 内部存在。

use std::{str::FromStr, sync::Arc};

use bitcoin::{
    absolute::LockTime,
    consensus::encode::serialize,
    ecdsa,
    hashes::Hash,
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use thiserror::Error;

use super::chain_gateway::{ChainError, ChainGateway, SpendableOutput};
use crate::domain::{DerivationError, KeyDerivation};

/// 固定开销（版本、锁定时间、计数、segwit 标记）
pub const TX_OVERHEAD_VBYTES: u64 = 11;
/// P2WPKH 输入
pub const INPUT_VBYTES: u64 = 68;
/// P2WPKH 输出
pub const OUTPUT_VBYTES: u64 = 31;
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("insufficient hot wallet funds: available {available} sats, required {required} sats")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("amount {amount} sats is below dust threshold {threshold} sats")]
    DustAmount { amount: u64, threshold: u64 },

    #[error("invalid destination address: {0}")]
    InvalidDestination(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Key(#[from] DerivationError),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// 选币结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<SpendableOutput>,
    pub fee_sats: u64,
    /// 0 表示不产生找零输出
    pub change_sats: u64,
}

impl Selection {
    pub fn total_in(&self) -> u64 {
        self.inputs.iter().map(|u| u.value_sats).sum()
    }
}

/// 已签名交易
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub txid: String,
    /// 共识序列化字节
    pub raw: Vec<u8>,
    pub fee_sats: u64,
    pub inputs: Vec<(String, u32)>,
    pub change_sats: Option<u64>,
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES + INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64
}

/// 确定性贪心选币
///
/// 候选按金额降序、txid、vout 排序；每加入一个输入都重新计算手续费。
pub fn select_outputs(
    candidates: &[SpendableOutput],
    amount_sats: u64,
    fee_rate: u64,
    dust_threshold: u64,
) -> Result<Selection, BuildError> {
    let fee_rate = fee_rate.max(1);
    let mut sorted: Vec<&SpendableOutput> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        b.value_sats
            .cmp(&a.value_sats)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });

    let mut selected: Vec<SpendableOutput> = Vec::new();
    let mut total: u64 = 0;

    for utxo in sorted {
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.value_sats);

        let n = selected.len();
        let fee_without_change = estimate_vsize(n, 1) * fee_rate;
        if total < amount_sats.saturating_add(fee_without_change) {
            continue;
        }

        let fee_with_change = estimate_vsize(n, 2) * fee_rate;
        let change = total
            .checked_sub(amount_sats)
            .and_then(|rest| rest.checked_sub(fee_with_change))
            .unwrap_or(0);

        let selection = if change >= dust_threshold {
            Selection {
                inputs: selected,
                fee_sats: fee_with_change,
                change_sats: change,
            }
        } else {
            // 找零不经济，全部并入手续费
            Selection {
                inputs: selected,
                fee_sats: total - amount_sats,
                change_sats: 0,
            }
        };
        return Ok(selection);
    }

    let inputs = selected.len().max(1);
    Err(BuildError::InsufficientFunds {
        available: total,
        required: amount_sats.saturating_add(estimate_vsize(inputs, 1) * fee_rate),
    })
}

/// 解析并校验目标网络
pub fn parse_destination(destination: &str, network: Network) -> Result<Address, BuildError> {
    Address::from_str(destination.trim())
        .map_err(|e| BuildError::InvalidDestination(format!("{}: {}", destination, e)))?
        .require_network(network)
        .map_err(|e| BuildError::InvalidDestination(format!("{}: {}", destination, e)))
}

pub struct TransactionBuilder {
    derivation: Arc<KeyDerivation>,
    gateway: Arc<dyn ChainGateway>,
    dust_threshold: u64,
}

impl TransactionBuilder {
    pub fn new(
        derivation: Arc<KeyDerivation>,
        gateway: Arc<dyn ChainGateway>,
        dust_threshold: u64,
    ) -> Self {
        Self {
            derivation,
            gateway,
            dust_threshold,
        }
    }

    pub fn network(&self) -> Network {
        self.derivation.network()
    }

    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    pub fn source_address(&self, source_index: u32) -> Result<Address, BuildError> {
        Ok(self.derivation.address_for(source_index)?)
    }

    /// 构建并签名一笔从 `source_index` 地址付往 `destination` 的交易
    pub async fn build(
        &self,
        source_index: u32,
        destination: &str,
        amount_sats: u64,
    ) -> Result<SignedTransaction, BuildError> {
        if amount_sats < self.dust_threshold {
            return Err(BuildError::DustAmount {
                amount: amount_sats,
                threshold: self.dust_threshold,
            });
        }

        let network = self.derivation.network();
        let destination = parse_destination(destination, network)?;
        let source = self.derivation.address_for(source_index)?;

        let candidates = self
            .gateway
            .list_spendable_outputs(&source.to_string())
            .await?;
        let fee_rate = self.gateway.estimate_fee_rate().await?.max(1);

        let selection = select_outputs(&candidates, amount_sats, fee_rate, self.dust_threshold)?;

        tracing::debug!(
            source_index,
            inputs = selection.inputs.len(),
            fee_sats = selection.fee_sats,
            change_sats = selection.change_sats,
            fee_rate,
            "Coin selection complete"
        );

        self.sign(source_index, &source, &destination, amount_sats, selection)
    }

    fn sign(
        &self,
        source_index: u32,
        source: &Address,
        destination: &Address,
        amount_sats: u64,
        selection: Selection,
    ) -> Result<SignedTransaction, BuildError> {
        let inputs = selection
            .inputs
            .iter()
            .map(|u| {
                let txid = Txid::from_str(&u.txid)
                    .map_err(|e| BuildError::Signing(format!("bad outpoint {}: {}", u.txid, e)))?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, u.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: destination.script_pubkey(),
        }];
        if selection.change_sats > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(selection.change_sats),
                script_pubkey: source.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        let key = self.derivation.signing_key_for(source_index)?;
        let secp = Secp256k1::new();
        let spent_script = source.script_pubkey();

        let witnesses = {
            let mut cache = SighashCache::new(&tx);
            selection
                .inputs
                .iter()
                .enumerate()
                .map(|(i, utxo)| {
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            i,
                            &spent_script,
                            Amount::from_sat(utxo.value_sats),
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| BuildError::Signing(e.to_string()))?;
                    let msg = Message::from_digest(sighash.to_byte_array());
                    let sig = ecdsa::Signature {
                        sig: secp.sign_ecdsa(&msg, &key.secret),
                        hash_ty: EcdsaSighashType::All,
                    };
                    Ok(Witness::p2wpkh(&sig, &key.public.inner))
                })
                .collect::<Result<Vec<_>, BuildError>>()?
        };

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        Ok(SignedTransaction {
            txid: tx.txid().to_string(),
            raw: serialize(&tx),
            fee_sats: selection.fee_sats,
            inputs: selection
                .inputs
                .iter()
                .map(|u| (u.txid.clone(), u.vout))
                .collect(),
            change_sats: (selection.change_sats > 0).then_some(selection.change_sats),
        })
    }
}

//! Esplora REST 网关（Blockstream / mempool.space）
//!
//! 读请求带有限次重试；广播不重试，超时视为结果未知交给对账流程。

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use bitcoin::{consensus::encode::deserialize, Address, Transaction};
use reqwest::StatusCode;
use serde::Deserialize;

use super::chain_gateway::{ChainError, ChainGateway, Inflow, SpendableOutput, TxStatus};
use crate::config::ChainConfig;

/// 单页最多 25 笔已确认交易
const TXS_PAGE_SIZE: usize = 25;
const MAX_TXS_PAGES: usize = 40;

#[derive(Debug, Deserialize)]
struct AddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct AddressInfo {
    chain_stats: AddressStats,
}

#[derive(Debug, Deserialize)]
struct UtxoStatus {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: u64,
    status: UtxoStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    vout: Vec<EsploraVout>,
    status: EsploraTxStatus,
}

pub struct EsploraGateway {
    http_client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    fee_target_blocks: u16,
    fallback_fee_rate: u64,
    max_retries: u32,
    retry_delay: Duration,
}

impl EsploraGateway {
    pub fn new(config: &ChainConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client: client,
            base_url: config.esplora_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            fee_target_blocks: config.fee_target_blocks,
            fallback_fee_rate: config.fallback_fee_rate.max(1),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    fn classify(&self, err: reqwest::Error) -> ChainError {
        if err.is_timeout() {
            return ChainError::Timeout(self.request_timeout);
        }
        match err.status() {
            Some(status) => classify_status(status, err.to_string()),
            None => ChainError::Transient(err.to_string()),
        }
    }

    /// GET 并在可重试错误上退避重试
    async fn get_with_retry(&self, path: &str) -> Result<reqwest::Response, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            let err = match self.http_client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {
                    return Ok(resp)
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    classify_status(status, body)
                }
                Err(e) => self.classify(e),
            };

            attempt += 1;
            if !err.is_retryable() || attempt > self.max_retries {
                return Err(err);
            }

            tracing::warn!(
                url = %url,
                attempt,
                error = %err,
                "Esplora request failed, retrying"
            );
            tokio::time::sleep(self.retry_delay * attempt).await;
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let resp = self.get_with_retry(path).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ChainError::Rejected(format!("{} not found", path)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ChainError::Transient(format!("malformed response for {}: {}", path, e)))
    }

    async fn list_chain_txs(&self, address: &str) -> Result<Vec<EsploraTx>, ChainError> {
        let mut all = Vec::new();
        let mut last_seen: Option<String> = None;

        for _ in 0..MAX_TXS_PAGES {
            let path = match &last_seen {
                Some(txid) => format!("/address/{}/txs/chain/{}", address, txid),
                None => format!("/address/{}/txs/chain", address),
            };
            let page: Vec<EsploraTx> = self.get_json(&path).await?;
            let full = page.len() >= TXS_PAGE_SIZE;
            last_seen = page.last().map(|tx| tx.txid.clone());
            all.extend(page);
            if !full || last_seen.is_none() {
                break;
            }
        }

        Ok(all)
    }
}

fn classify_status(status: StatusCode, body: String) -> ChainError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ChainError::Transient(format!("{}: {}", status, body))
    } else {
        ChainError::Rejected(format!("{}: {}", status, body))
    }
}

/// 节点已持有该交易时的拒绝信息
fn is_already_known(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already known")
        || lower.contains("txn-already-in-mempool")
        || lower.contains("already in block chain")
}

/// 选择覆盖目标确认块数的费率（向上取整，至少 1 sat/vB）
fn pick_fee_rate(estimates: &[(u16, f64)], target: u16) -> Option<u64> {
    let mut sorted: Vec<(u16, f64)> = estimates
        .iter()
        .copied()
        .filter(|(_, rate)| rate.is_finite() && *rate > 0.0)
        .collect();
    sorted.sort_by_key(|(blocks, _)| *blocks);

    sorted
        .iter()
        .find(|(blocks, _)| *blocks >= target)
        .or_else(|| sorted.last())
        .map(|(_, rate)| (rate.ceil() as u64).max(1))
}

/// 同一交易中付给该地址的输出合并为一笔入账
fn inflows_to(address: &str, txs: Vec<EsploraTx>) -> Vec<Inflow> {
    txs.into_iter()
        .filter(|tx| tx.status.confirmed)
        .filter_map(|tx| {
            let value: u64 = tx
                .vout
                .iter()
                .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
                .map(|out| out.value)
                .sum();
            (value > 0).then_some(Inflow {
                txid: tx.txid,
                value_sats: value,
            })
        })
        .collect()
}

#[async_trait]
impl ChainGateway for EsploraGateway {
    async fn get_confirmed_balance(&self, address: &str) -> Result<u64, ChainError> {
        let info: AddressInfo = self.get_json(&format!("/address/{}", address)).await?;
        Ok(info
            .chain_stats
            .funded_txo_sum
            .saturating_sub(info.chain_stats.spent_txo_sum))
    }

    async fn list_spendable_outputs(
        &self,
        address: &str,
    ) -> Result<Vec<SpendableOutput>, ChainError> {
        let script_pubkey = Address::from_str(address)
            .map_err(|e| ChainError::Rejected(format!("invalid address {}: {}", address, e)))?
            .assume_checked()
            .script_pubkey();
        let script_hex = hex::encode(script_pubkey.as_bytes());

        let utxos: Vec<Utxo> = self.get_json(&format!("/address/{}/utxo", address)).await?;

        Ok(utxos
            .into_iter()
            .filter(|u| u.status.confirmed)
            .map(|u| SpendableOutput {
                txid: u.txid,
                vout: u.vout,
                value_sats: u.value,
                script_pubkey: script_hex.clone(),
            })
            .collect())
    }

    async fn estimate_fee_rate(&self) -> Result<u64, ChainError> {
        let raw: std::collections::HashMap<String, f64> = match self.get_json("/fee-estimates").await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = self.fallback_fee_rate,
                    "Fee estimate unavailable, using fallback rate"
                );
                return Ok(self.fallback_fee_rate);
            }
        };

        let estimates: Vec<(u16, f64)> = raw
            .into_iter()
            .filter_map(|(blocks, rate)| blocks.parse::<u16>().ok().map(|b| (b, rate)))
            .collect();

        Ok(pick_fee_rate(&estimates, self.fee_target_blocks).unwrap_or(self.fallback_fee_rate))
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, ChainError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .http_client
            .post(&url)
            .body(hex::encode(raw_tx))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?;

        if status.is_success() {
            return Ok(body.trim().to_string());
        }

        if is_already_known(&body) {
            let tx: Transaction = deserialize(raw_tx)
                .map_err(|e| ChainError::Rejected(format!("undecodable transaction: {}", e)))?;
            tracing::info!(txid = %tx.txid(), "Transaction already known to provider");
            return Ok(tx.txid().to_string());
        }

        Err(classify_status(status, body))
    }

    async fn transaction_status(&self, txid: &str) -> Result<Option<TxStatus>, ChainError> {
        let resp = self.get_with_retry(&format!("/tx/{}/status", txid)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status: EsploraTxStatus = resp
            .json()
            .await
            .map_err(|e| ChainError::Transient(format!("malformed tx status: {}", e)))?;

        Ok(Some(TxStatus {
            confirmed: status.confirmed,
            block_height: status.block_height,
        }))
    }

    async fn list_confirmed_inflows(
        &self,
        address: &str,
    ) -> Result<Option<Vec<Inflow>>, ChainError> {
        let txs = self.list_chain_txs(address).await?;
        Ok(Some(inflows_to(address, txs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_fee_rate_prefers_target_then_slower() {
        let estimates = vec![(1, 40.2), (3, 12.1), (6, 8.0), (144, 1.0)];
        assert_eq!(pick_fee_rate(&estimates, 3), Some(13));
        assert_eq!(pick_fee_rate(&estimates, 2), Some(13));
        assert_eq!(pick_fee_rate(&estimates, 500), Some(1));
        assert_eq!(pick_fee_rate(&[], 3), None);
    }

    #[test]
    fn test_fee_rate_is_at_least_one() {
        assert_eq!(pick_fee_rate(&[(2, 0.4)], 2), Some(1));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            ChainError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ChainError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad-txns".into()),
            ChainError::Rejected(_)
        ));
    }

    #[test]
    fn test_already_known_detection() {
        assert!(is_already_known(
            r#"sendrawtransaction RPC error: {"code":-27,"message":"Transaction already in block chain"}"#
        ));
        assert!(is_already_known("txn-already-in-mempool"));
        assert!(!is_already_known("bad-txns-inputs-missingorspent"));
    }

    #[test]
    fn test_decode_esplora_tx_listing() {
        let body = r#"[{
            "txid": "cc",
            "version": 2,
            "vin": [],
            "vout": [
                {"scriptpubkey": "0014aa", "scriptpubkey_address": "bc1qexample", "value": 42000},
                {"scriptpubkey": "6a04deadbeef", "scriptpubkey_type": "op_return", "value": 0}
            ],
            "status": {"confirmed": true, "block_height": 812345, "block_hash": "00ff"}
        }]"#;

        let txs: Vec<EsploraTx> = serde_json::from_str(body).unwrap();
        assert_eq!(
            inflows_to("bc1qexample", txs),
            vec![Inflow {
                txid: "cc".into(),
                value_sats: 42_000
            }]
        );
    }

    #[test]
    fn test_inflows_merge_outputs_per_tx() {
        let addr = "bc1qexample";
        let txs = vec![
            EsploraTx {
                txid: "aa".into(),
                vout: vec![
                    EsploraVout {
                        scriptpubkey_address: Some(addr.into()),
                        value: 1_000,
                    },
                    EsploraVout {
                        scriptpubkey_address: Some(addr.into()),
                        value: 500,
                    },
                    EsploraVout {
                        scriptpubkey_address: Some("bc1qother".into()),
                        value: 9_000,
                    },
                ],
                status: EsploraTxStatus {
                    confirmed: true,
                    block_height: Some(800_000),
                },
            },
            EsploraTx {
                txid: "bb".into(),
                vout: vec![EsploraVout {
                    scriptpubkey_address: Some(addr.into()),
                    value: 7,
                }],
                status: EsploraTxStatus {
                    confirmed: false,
                    block_height: None,
                },
            },
        ];

        assert_eq!(
            inflows_to(addr, txs),
            vec![Inflow {
                txid: "aa".into(),
                value_sats: 1_500
            }]
        );
    }
}

//! 汇率源（法币/BTC）
//!
//! 真实货币余额以法币最小单位（分）记账，链上金额以聪计。
//! 两个方向的换算都向下取整。

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::RatesConfig;

const SATS_PER_BTC: i64 = 100_000_000;
const MINOR_UNITS_PER_FIAT: i64 = 100;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("rate provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("amount out of range")]
    Overflow,
}

#[async_trait]
pub trait RateSource: Send + Sync {
    /// 1 BTC 的法币价格
    async fn btc_price(&self) -> Result<Decimal, RateError>;
}

fn check_price(price: Decimal) -> Result<Decimal, RateError> {
    if price <= Decimal::ZERO {
        return Err(RateError::InvalidPrice(price.to_string()));
    }
    Ok(price)
}

/// 聪 → 法币最小单位（向下取整）
pub fn sats_to_minor_units(sats: u64, btc_price: Decimal) -> Result<i64, RateError> {
    let price = check_price(btc_price)?;
    let value = Decimal::from(sats)
        .checked_mul(price)
        .and_then(|v| v.checked_mul(Decimal::from(MINOR_UNITS_PER_FIAT)))
        .ok_or(RateError::Overflow)?
        / Decimal::from(SATS_PER_BTC);
    value.floor().to_i64().ok_or(RateError::Overflow)
}

/// 法币最小单位 → 聪（向下取整）
pub fn minor_units_to_sats(minor_units: i64, btc_price: Decimal) -> Result<u64, RateError> {
    let price = check_price(btc_price)?;
    if minor_units < 0 {
        return Err(RateError::Overflow);
    }
    let value = Decimal::from(minor_units)
        .checked_mul(Decimal::from(SATS_PER_BTC))
        .ok_or(RateError::Overflow)?
        / Decimal::from(MINOR_UNITS_PER_FIAT)
        / price;
    value.floor().to_u64().ok_or(RateError::Overflow)
}

/// 固定汇率（测试与离线环境）
#[derive(Debug, Clone)]
pub struct FixedRateSource {
    price: Decimal,
}

impl FixedRateSource {
    pub fn new(price: Decimal) -> Self {
        Self { price }
    }
}

#[async_trait]
impl RateSource for FixedRateSource {
    async fn btc_price(&self) -> Result<Decimal, RateError> {
        check_price(self.price)
    }
}

/// CoinGecko `simple/price`，内存缓存 TTL
pub struct CoinGeckoRateSource {
    client: reqwest::Client,
    base_url: String,
    fiat_currency: String,
    cache_ttl: Duration,
    cache: RwLock<Option<(Decimal, Instant)>>,
}

impl CoinGeckoRateSource {
    pub fn new(config: &RatesConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            fiat_currency: config.fiat_currency.to_lowercase(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<Decimal, RateError> {
        let url = format!(
            "{}/simple/price?ids=bitcoin&vs_currencies={}",
            self.base_url, self.fiat_currency
        );

        tracing::debug!(url = %url, "Fetching BTC price from CoinGecko");

        let body: HashMap<String, HashMap<String, f64>> = self
            .client
            .get(&url)
            .header("User-Agent", "oxledger/0.1")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RateError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| RateError::Unavailable(format!("malformed response: {}", e)))?;

        let raw = body
            .get("bitcoin")
            .and_then(|prices| prices.get(&self.fiat_currency))
            .copied()
            .ok_or_else(|| {
                RateError::Unavailable(format!("no bitcoin/{} price in response", self.fiat_currency))
            })?;

        let price = Decimal::from_f64(raw).ok_or_else(|| RateError::InvalidPrice(raw.to_string()))?;
        check_price(price)
    }
}

#[async_trait]
impl RateSource for CoinGeckoRateSource {
    async fn btc_price(&self) -> Result<Decimal, RateError> {
        {
            let cache = self.cache.read().await;
            if let Some((price, fetched_at)) = *cache {
                if fetched_at.elapsed() < self.cache_ttl {
                    return Ok(price);
                }
            }
        }

        match self.fetch().await {
            Ok(price) => {
                *self.cache.write().await = Some((price, Instant::now()));
                Ok(price)
            }
            Err(e) => {
                // 拉取失败时不使用过期价格
                tracing::warn!(error = %e, "BTC price refresh failed");
                Err(e)
            }
        }
    }
}

//! DexScreener integration.
//!
//! Base URL: https://api.dexscreener.com
//! Endpoint: `/latest/dex/tokens/{mint}` → `{ pairs: [...] }`. Every pair
//! containing the mint is listed, on either side; only pairs whose base
//! token is the mint quote its price in `priceUsd`, and the first of those
//! is taken as representative. No auth.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::MarketDataSource;
use crate::types::{CycleError, TokenSnapshot};

const SERVICE: &str = "dexscreener";

pub const DEFAULT_BASE_URL: &str = "https://api.dexscreener.com";

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    #[serde(default)]
    base_token: Option<PairToken>,
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    fdv: Option<f64>,
    #[serde(default)]
    volume: Option<Window<f64>>,
    #[serde(default)]
    txns: Option<Window<TxnCounts>>,
    #[serde(default)]
    price_change: Option<Window<f64>>,
}

#[derive(Debug, Deserialize)]
struct PairToken {
    #[serde(default)]
    address: String,
}

/// A `{ "h24": ... }` window object.
#[derive(Debug, Deserialize)]
struct Window<T> {
    #[serde(default)]
    h24: Option<T>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct TxnCounts {
    #[serde(default)]
    buys: u64,
    #[serde(default)]
    sells: u64,
}

impl Pair {
    fn is_base(&self, mint: &str) -> bool {
        self.base_token.as_ref().is_some_and(|t| t.address == mint)
    }

    fn snapshot(&self) -> TokenSnapshot {
        let txns = self
            .txns
            .as_ref()
            .and_then(|w| w.h24)
            .unwrap_or_default();
        TokenSnapshot {
            price_usd: self.price_usd.clone().unwrap_or_else(|| "0".into()),
            market_cap: self.market_cap.or(self.fdv).unwrap_or(0.0),
            volume_24h: self.volume.as_ref().and_then(|w| w.h24).unwrap_or(0.0),
            buys_24h: txns.buys,
            sells_24h: txns.sells,
            price_change_24h: self.price_change.as_ref().and_then(|w| w.h24).unwrap_or(0.0),
        }
    }
}

pub struct DexScreenerClient {
    http: Client,
    base_url: String,
    sol_mint: String,
}

impl DexScreenerClient {
    pub fn new(base_url: &str, sol_mint: &str) -> Result<Self, CycleError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("swapcycle/0.1.0")
            .build()
            .map_err(|e| CycleError::Config(format!("Failed to build HTTP client for DexScreener: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            sol_mint: sol_mint.to_string(),
        })
    }

    async fn base_pair(&self, mint: &str) -> Result<Option<Pair>, CycleError> {
        let url = format!(
            "{}/latest/dex/tokens/{}",
            self.base_url,
            urlencoding::encode(mint)
        );
        debug!(url = %url, "Fetching DexScreener pairs");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CycleError::upstream(SERVICE, format!("HTTP {}", resp.status().as_u16())));
        }

        let body: TokensResponse = resp
            .json()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, format!("Failed to parse response: {e}")))?;

        Ok(base_pair_of(body, mint))
    }
}

/// First listed pair that has `mint` as its base token.
fn base_pair_of(body: TokensResponse, mint: &str) -> Option<Pair> {
    body.pairs?.into_iter().find(|p| p.is_base(mint))
}

#[async_trait]
impl MarketDataSource for DexScreenerClient {
    async fn token_snapshot(&self, mint: &str) -> Result<Option<TokenSnapshot>, CycleError> {
        Ok(self.base_pair(mint).await?.map(|p| p.snapshot()))
    }

    async fn sol_price_usd(&self) -> Result<Decimal, CycleError> {
        let pair = self
            .base_pair(&self.sol_mint)
            .await?
            .ok_or_else(|| CycleError::upstream(SERVICE, "no SOL pair listed"))?;

        let raw = pair
            .price_usd
            .ok_or_else(|| CycleError::upstream(SERVICE, "SOL pair has no priceUsd"))?;

        Decimal::from_str(&raw)
            .map_err(|e| CycleError::upstream(SERVICE, format!("bad priceUsd {raw:?}: {e}")))
    }
}

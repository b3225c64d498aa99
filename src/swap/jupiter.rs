//! Jupiter swap API integration.
//!
//! API docs: https://dev.jup.ag/docs/swap-api
//! Base URL: https://api.jup.ag/swap/v1
//! Auth: optional `x-api-key` header.
//!
//! Flow: `GET /quote` → `POST /swap` (returns a base64 unsigned
//! transaction) → caller signs and submits.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::SwapRouter;
use crate::types::{CycleError, SwapQuote};

const SERVICE: &str = "jupiter";

/// Default public endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.jup.ag/swap/v1";

/// Response from `POST /swap`. Only the fields we need.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    #[serde(default)]
    swap_transaction: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Jupiter swap API client.
pub struct JupiterClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl JupiterClient {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, CycleError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("swapcycle/0.1.0")
            .build()
            .map_err(|e| CycleError::Config(format!("Failed to build HTTP client for Jupiter: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key.expose_secret().as_str()),
            None => req,
        }
    }

    /// Send a request and return the parsed JSON body, failing on non-2xx.
    async fn send_json(&self, req: RequestBuilder) -> Result<Value, CycleError> {
        let resp = self
            .with_auth(req)
            .send()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(100).collect();
            return Err(CycleError::upstream(SERVICE, format!("HTTP {}: {snippet}", status.as_u16())));
        }

        resp.json()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, format!("Failed to parse response: {e}")))
    }

    fn quote_url(&self, input_mint: &str, output_mint: &str, amount: u64, slippage_bps: u16) -> String {
        format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url,
            urlencoding::encode(input_mint),
            urlencoding::encode(output_mint),
            amount,
            slippage_bps,
        )
    }
}

/// Validate a quote body and convert it to a `SwapQuote`.
fn parse_quote(
    body: Value,
    input_mint: &str,
    output_mint: &str,
    amount: u64,
) -> Result<SwapQuote, CycleError> {
    if let Some(err) = body.get("error").and_then(Value::as_str) {
        return Err(CycleError::NoRoute(err.to_string()));
    }

    let out_amount = body
        .get("outAmount")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    if out_amount == 0 {
        return Err(CycleError::NoRoute("No route".into()));
    }

    let in_amount = body
        .get("inAmount")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(amount);

    Ok(SwapQuote {
        input_mint: input_mint.to_string(),
        output_mint: output_mint.to_string(),
        in_amount,
        out_amount,
        raw: body,
    })
}

/// Extract and decode the unsigned transaction from a swap response.
fn parse_swap(body: Value) -> Result<Vec<u8>, CycleError> {
    let resp: SwapResponse = serde_json::from_value(body)
        .map_err(|e| CycleError::NoSwapTransaction(e.to_string()))?;

    let Some(encoded) = resp.swap_transaction else {
        return Err(CycleError::NoSwapTransaction(
            resp.error.unwrap_or_else(|| "No tx".into()),
        ));
    };

    BASE64
        .decode(encoded)
        .map_err(|e| CycleError::NoSwapTransaction(format!("invalid base64 transaction: {e}")))
}

#[async_trait]
impl SwapRouter for JupiterClient {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<SwapQuote, CycleError> {
        let url = self.quote_url(input_mint, output_mint, amount, slippage_bps);
        debug!(url = %url, "Fetching Jupiter quote");

        let body = self.send_json(self.http.get(&url)).await?;
        parse_quote(body, input_mint, output_mint, amount)
    }

    async fn build_swap_transaction(
        &self,
        quote: &SwapQuote,
        owner: &str,
        priority_fee_lamports: u64,
    ) -> Result<Vec<u8>, CycleError> {
        let body = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": owner,
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
            "prioritizationFeeLamports": priority_fee_lamports,
        });

        let url = format!("{}/swap", self.base_url);
        debug!(url = %url, owner, "Requesting Jupiter swap transaction");

        let resp = self.send_json(self.http.post(&url).json(&body)).await?;
        parse_swap(resp)
    }

    fn name(&self) -> &str {
        SERVICE
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

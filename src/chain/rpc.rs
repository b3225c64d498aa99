//! Solana JSON-RPC client.
//!
//! Methods used: `getBalance`, `getTokenAccountsByOwner` (jsonParsed) and
//! `sendTransaction` (base64, preflight skipped, bounded node-side retries).
//! Errors returned by the node are surfaced with their message verbatim.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::ChainRpc;
use crate::types::{CycleError, TokenBalance};

const SERVICE: &str = "rpc";

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP JSON-RPC client for a Solana node.
pub struct SolanaRpcClient {
    http: Client,
    url: String,
}

impl SolanaRpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, CycleError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("swapcycle/0.1.0")
            .build()
            .map_err(|e| CycleError::Config(format!("Failed to build RPC HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    /// Perform one JSON-RPC call and return its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value, CycleError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!(method, "RPC call");

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, format!("{method}: {e}")))?;

        let parsed: RpcResponse = resp
            .json()
            .await
            .map_err(|e| CycleError::upstream(SERVICE, format!("{method}: bad response: {e}")))?;

        into_result(method, parsed)
    }
}

fn into_result(method: &str, resp: RpcResponse) -> Result<Value, CycleError> {
    if let Some(err) = resp.error {
        let message = err
            .message
            .unwrap_or_else(|| format!("RPC error code {}", err.code));
        return Err(CycleError::upstream(SERVICE, message));
    }
    resp.result
        .ok_or_else(|| CycleError::upstream(SERVICE, format!("{method}: missing result")))
}

/// Extract lamports from a `getBalance` result.
fn parse_balance(result: &Value) -> Result<u64, CycleError> {
    result
        .get("value")
        .and_then(Value::as_u64)
        .ok_or_else(|| CycleError::upstream(SERVICE, "getBalance: missing value"))
}

/// Extract the first token account's balance from a
/// `getTokenAccountsByOwner` jsonParsed result.
fn parse_token_balance(result: &Value) -> TokenBalance {
    let Some(amount) = result
        .pointer("/value/0/account/data/parsed/info/tokenAmount")
    else {
        return TokenBalance::default();
    };

    TokenBalance {
        amount: amount
            .get("amount")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        decimals: amount
            .get("decimals")
            .and_then(Value::as_u64)
            .and_then(|d| u8::try_from(d).ok())
            .unwrap_or(0),
    }
}

#[async_trait]
impl ChainRpc for SolanaRpcClient {
    async fn get_balance(&self, owner: &str) -> Result<u64, CycleError> {
        let result = self.call("getBalance", json!([owner])).await?;
        parse_balance(&result)
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<TokenBalance, CycleError> {
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([owner, { "mint": mint }, { "encoding": "jsonParsed" }]),
            )
            .await?;
        Ok(parse_token_balance(&result))
    }

    async fn send_transaction(&self, signed_b64: &str, max_retries: u32) -> Result<String, CycleError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [
                signed_b64,
                { "encoding": "base64", "skipPreflight": true, "maxRetries": max_retries }
            ],
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CycleError::SubmissionFailed(e.to_string()))?;

        let parsed: RpcResponse = resp
            .json()
            .await
            .map_err(|e| CycleError::SubmissionFailed(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(CycleError::SubmissionFailed(
                err.message.unwrap_or_else(|| format!("RPC error code {}", err.code)),
            ));
        }

        parsed
            .result
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CycleError::SubmissionFailed("sendTransaction returned no signature".into()))
    }
}

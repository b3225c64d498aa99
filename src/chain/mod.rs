//! Blockchain access.
//!
//! Defines the `ChainRpc` trait the swap executor and cycle runner depend
//! on, and the JSON-RPC implementation in [`rpc`].

pub mod rpc;

use async_trait::async_trait;

use crate::types::{CycleError, TokenBalance};

/// Abstraction over a Solana JSON-RPC endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// SOL balance of `owner`, in lamports.
    async fn get_balance(&self, owner: &str) -> Result<u64, CycleError>;

    /// Balance of `mint` held by `owner`. Zero when the owner has no
    /// token account for the mint.
    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<TokenBalance, CycleError>;

    /// Submit a signed, base64-encoded transaction. Returns the signature.
    async fn send_transaction(&self, signed_b64: &str, max_retries: u32) -> Result<String, CycleError>;
}

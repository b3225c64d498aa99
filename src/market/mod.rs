//! Market data for status display and volume accounting.

pub mod dexscreener;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{CycleError, TokenSnapshot};

/// Abstraction over a token price/volume source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Market snapshot of `mint`; `None` when no pair is listed.
    async fn token_snapshot(&self, mint: &str) -> Result<Option<TokenSnapshot>, CycleError>;

    /// Current SOL price in USD.
    async fn sol_price_usd(&self) -> Result<Decimal, CycleError>;
}

//! Swap routing and execution.
//!
//! Defines the `SwapRouter` trait over a third-party aggregator, the
//! Jupiter implementation, and the executor that turns a quote into a
//! locally signed, submitted transaction.

pub mod executor;
pub mod jupiter;

use async_trait::async_trait;

use crate::types::{CycleError, SwapQuote};

/// Abstraction over a swap-routing API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapRouter: Send + Sync {
    /// Quote swapping `amount` raw units of `input_mint` into `output_mint`.
    ///
    /// Fails with `NoRoute` when no route exists or the output is zero.
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<SwapQuote, CycleError>;

    /// Build an unsigned transaction for `quote` paid by `owner`.
    /// Returns the raw transaction bytes.
    ///
    /// Fails with `NoSwapTransaction` when the router returns no payload.
    async fn build_swap_transaction(
        &self,
        quote: &SwapQuote,
        owner: &str,
        priority_fee_lamports: u64,
    ) -> Result<Vec<u8>, CycleError>;

    /// Router name for logging.
    fn name(&self) -> &str;
}

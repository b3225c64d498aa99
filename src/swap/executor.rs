//! Swap executor.
//!
//! Quote → build → sign locally → submit. One call per swap leg. No
//! idempotency key is attached: two `execute` calls are two swaps.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::ChainRpc;
use crate::swap::SwapRouter;
use crate::types::{CycleError, Direction, SwapReceipt};
use crate::wallet::transaction::sign_transaction;
use crate::wallet::Keypair;

/// Per-service swap parameters.
#[derive(Debug, Clone)]
pub struct SwapSettings {
    pub sol_mint: String,
    pub token_mint: String,
    pub slippage_bps: u16,
    pub priority_fee_lamports: u64,
    pub max_send_retries: u32,
}

impl SwapSettings {
    /// `(input, output)` mints for a direction.
    pub fn mints(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::Buy => (&self.sol_mint, &self.token_mint),
            Direction::Sell => (&self.token_mint, &self.sol_mint),
        }
    }
}

pub struct SwapExecutor {
    router: Arc<dyn SwapRouter>,
    chain: Arc<dyn ChainRpc>,
    settings: SwapSettings,
    dry_run: bool,
}

impl SwapExecutor {
    pub fn new(
        router: Arc<dyn SwapRouter>,
        chain: Arc<dyn ChainRpc>,
        settings: SwapSettings,
        dry_run: bool,
    ) -> Self {
        Self {
            router,
            chain,
            settings,
            dry_run,
        }
    }

    pub fn settings(&self) -> &SwapSettings {
        &self.settings
    }

    /// Execute one swap of `amount` raw input units.
    ///
    /// In dry-run mode, logs and returns a synthetic receipt without
    /// touching the router or the chain.
    pub async fn execute(
        &self,
        direction: Direction,
        amount: u64,
        keypair: &Keypair,
    ) -> Result<SwapReceipt, CycleError> {
        let (input_mint, output_mint) = self.settings.mints(direction);

        if self.dry_run {
            info!(
                %direction,
                amount,
                wallet = keypair.public_key(),
                "[DRY RUN] Would swap"
            );
            return Ok(SwapReceipt::dry_run(direction, amount));
        }

        let quote = self
            .router
            .quote(input_mint, output_mint, amount, self.settings.slippage_bps)
            .await?;
        debug!(%direction, in_amount = quote.in_amount, out_amount = quote.out_amount, "Quote received");

        let unsigned = self
            .router
            .build_swap_transaction(&quote, keypair.public_key(), self.settings.priority_fee_lamports)
            .await?;

        let signed = sign_transaction(&unsigned, keypair)?;
        let encoded = BASE64.encode(&signed);

        let signature = match self
            .chain
            .send_transaction(&encoded, self.settings.max_send_retries)
            .await
        {
            Ok(sig) => sig,
            Err(e) => {
                warn!(%direction, router = self.router.name(), error = %e, "Submission failed");
                return Err(match e {
                    CycleError::SubmissionFailed(_) => e,
                    other => CycleError::SubmissionFailed(other.to_string()),
                });
            }
        };

        info!(
            %direction,
            signature = %signature,
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            "Swap submitted"
        );

        Ok(SwapReceipt {
            direction,
            signature,
            in_amount: quote.in_amount,
            out_amount: quote.out_amount,
        })
    }
}

impl SwapReceipt {
    /// A synthetic receipt for dry-run mode.
    pub fn dry_run(direction: Direction, amount: u64) -> Self {
        Self {
            direction,
            signature: format!("dry-run-{}", uuid::Uuid::new_v4()),
            in_amount: amount,
            out_amount: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

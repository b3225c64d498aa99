//! Cycle runner.
//!
//! Runs one buy → settle → sell cycle for a session and records the
//! result. A run first claims the session under a fresh `run_id`; every
//! path out of [`CycleRunner::run`] releases that claim and either
//! reschedules the session or leaves it inactive, so an active session is
//! never left without a pending run (barring a storage failure).

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chain::ChainRpc;
use crate::engine::accountant::{Accountant, LegReport};
use crate::market::MarketDataSource;
use crate::storage::SessionStore;
use crate::swap::executor::SwapExecutor;
use crate::types::{
    lamports_to_sol, CycleError, CycleOutcome, Direction, Session, StopReason,
};
use crate::wallet::Keypair;

// ---------------------------------------------------------------------------
// Pacing and thresholds
// ---------------------------------------------------------------------------

/// Randomized delays: the settle wait between legs and the interval
/// between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub settle_min: Duration,
    pub settle_max: Duration,
    pub interval_min: Duration,
    pub interval_max: Duration,
}

impl Pacing {
    /// No waiting at all.
    pub fn immediate() -> Self {
        Self {
            settle_min: Duration::ZERO,
            settle_max: Duration::ZERO,
            interval_min: Duration::ZERO,
            interval_max: Duration::ZERO,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        random_between(self.settle_min, self.settle_max)
    }

    pub fn next_interval(&self) -> Duration {
        random_between(self.interval_min, self.interval_max)
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = (max.as_millis() as u64).max(lo);
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Balance requirements, as multiples of the trade size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceLimits {
    /// Needed to start.
    pub start_multiplier: Decimal,
    /// Below this a running session pauses.
    pub pause_multiplier: Decimal,
}

impl BalanceLimits {
    pub fn start_requirement(&self, trade_size_sol: Decimal) -> Decimal {
        trade_size_sol * self.start_multiplier
    }

    pub fn pause_threshold(&self, trade_size_sol: Decimal) -> Decimal {
        trade_size_sol * self.pause_multiplier
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct CycleRunner {
    store: SessionStore,
    chain: Arc<dyn ChainRpc>,
    executor: Arc<SwapExecutor>,
    market: Arc<dyn MarketDataSource>,
    pacing: Pacing,
    limits: BalanceLimits,
    fallback_sol_price: Decimal,
}

impl CycleRunner {
    pub fn new(
        store: SessionStore,
        chain: Arc<dyn ChainRpc>,
        executor: Arc<SwapExecutor>,
        market: Arc<dyn MarketDataSource>,
        pacing: Pacing,
        limits: BalanceLimits,
        fallback_sol_price: Decimal,
    ) -> Self {
        Self {
            store,
            chain,
            executor,
            market,
            pacing,
            limits,
            fallback_sol_price,
        }
    }

    pub fn limits(&self) -> BalanceLimits {
        self.limits
    }

    /// Run one cycle for `user_id`.
    ///
    /// Errors are storage failures only; leg failures come back as
    /// `CycleOutcome::Failed`.
    pub async fn run(&self, user_id: &str) -> Result<CycleOutcome, CycleError> {
        let Some(session) = self.store.get(user_id).await? else {
            return Ok(skipped("No session"));
        };
        if !session.is_active {
            return Ok(skipped("Session inactive"));
        }
        if session.in_flight() {
            return Ok(skipped("Cycle already in flight"));
        }
        if session.next_run_at.is_none() {
            return Ok(skipped("No run pending"));
        }

        // Claim under the version check. A concurrent runner either
        // conflicts here or sees the claim above.
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut claim = session.clone();
        Accountant::claim(&mut claim, &run_id);
        let session = match self.store.update(&claim).await {
            Ok(s) => s,
            Err(CycleError::VersionConflict(_)) => {
                debug!(user_id, "Session claimed by another runner");
                return Ok(skipped("Claimed by another runner"));
            }
            Err(e) => return Err(e),
        };

        info!(
            user_id,
            run_id = %run_id,
            cycle = session.cycles_completed + 1,
            max_cycles = session.max_cycles,
            trade_size_sol = %session.trade_size_sol,
            "Starting cycle"
        );

        if session.reached_max_cycles() {
            return self.stop(user_id, &run_id, StopReason::MaxCyclesReached).await;
        }

        let balance = match self.chain.get_balance(&session.wallet_public_key).await {
            Ok(lamports) => lamports_to_sol(lamports),
            Err(e) => return self.fail(user_id, &run_id, e).await,
        };
        let threshold = self.limits.pause_threshold(session.trade_size_sol);
        if balance < threshold {
            warn!(user_id, balance = %balance, threshold = %threshold, "Balance below pause threshold");
            return self.stop(user_id, &run_id, StopReason::LowBalance).await;
        }

        let keypair = match Keypair::from_base58(&session.wallet_private_key) {
            Ok(kp) => kp,
            Err(e) => {
                error!(user_id, error = %e, "Stored wallet key is unusable, deactivating");
                self.store
                    .modify(user_id, |s| {
                        Accountant::deactivate(s);
                        Accountant::release(s, &run_id);
                        Ok(())
                    })
                    .await?;
                return Ok(failed(&e));
            }
        };

        let legs = match self.execute_legs(&session, &keypair).await {
            Ok(legs) => legs,
            Err(e) => return self.fail(user_id, &run_id, e).await,
        };

        let sol_price = self.sol_price().await;
        let next_run_at = self.next_run_at();

        let recorded = self
            .store
            .modify(user_id, |s| {
                Accountant::reconcile(s, &run_id, &legs, sol_price, next_run_at)
            })
            .await;

        let (counted, cycles_completed, volume_usd) = match recorded {
            Ok((_, rec)) => (rec.counted, rec.cycles_completed, rec.volume_usd),
            Err(CycleError::NotRunning) => {
                warn!(user_id, run_id = %run_id, "Cycle claim lost; not counted");
                let current = self.store.require(user_id).await?;
                (false, current.cycles_completed, Decimal::ZERO)
            }
            Err(e) => return Err(e),
        };

        let LegReport { buy, sell } = legs;
        let (sell, sell_error) = match sell {
            Ok(r) => (Some(r), None),
            Err(e) => (None, Some(e.to_string())),
        };

        Ok(CycleOutcome::Completed {
            buy,
            sell,
            sell_error,
            volume_usd,
            counted,
            cycles_completed,
        })
    }

    /// Buy, wait for settlement, sell the whole resulting token balance.
    ///
    /// Errors mean the buy leg did not produce tokens; a failed sell is
    /// reported inside the `LegReport`.
    async fn execute_legs(&self, session: &Session, keypair: &Keypair) -> Result<LegReport, CycleError> {
        let buy = self
            .executor
            .execute(Direction::Buy, session.trade_lamports(), keypair)
            .await?;

        let settle = self.pacing.settle_delay();
        debug!(user_id = %session.user_id, settle_ms = settle.as_millis() as u64, "Waiting for buy to settle");
        tokio::time::sleep(settle).await;

        let token_mint = &self.executor.settings().token_mint;
        let tokens = self
            .chain
            .get_token_balance(&session.wallet_public_key, token_mint)
            .await?;
        if tokens.is_empty() {
            return Err(CycleError::NoTokensAfterBuy);
        }
        debug!(user_id = %session.user_id, tokens = %tokens.ui_amount(), "Selling full token balance");

        let sell = self
            .executor
            .execute(Direction::Sell, tokens.amount, keypair)
            .await;
        if let Err(e) = &sell {
            warn!(user_id = %session.user_id, error = %e, "Sell leg failed");
        }

        Ok(LegReport { buy, sell })
    }

    fn next_run_at(&self) -> DateTime<Utc> {
        let wait = chrono::Duration::from_std(self.pacing.next_interval())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + wait
    }

    async fn sol_price(&self) -> Decimal {
        match self.market.sol_price_usd().await {
            Ok(p) if p > Decimal::ZERO => p,
            Ok(_) => self.fallback_sol_price,
            Err(e) => {
                debug!(error = %e, fallback = %self.fallback_sol_price, "SOL price unavailable, using fallback");
                self.fallback_sol_price
            }
        }
    }

    /// Soft failure: log, keep counters, schedule the next run.
    async fn fail(&self, user_id: &str, run_id: &str, err: CycleError) -> Result<CycleOutcome, CycleError> {
        warn!(user_id, error = %err, kind = err.kind(), "Cycle failed");
        let next_run_at = self.next_run_at();
        match self
            .store
            .modify(user_id, |s| Accountant::reschedule(s, run_id, next_run_at))
            .await
        {
            Ok(_) | Err(CycleError::NotRunning) => Ok(failed(&err)),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, user_id: &str, run_id: &str, reason: StopReason) -> Result<CycleOutcome, CycleError> {
        self.store
            .modify(user_id, |s| {
                Accountant::deactivate(s);
                Accountant::release(s, run_id);
                Ok(())
            })
            .await?;
        info!(user_id, %reason, "Session deactivated");
        Ok(CycleOutcome::Stopped { reason })
    }
}

fn skipped(reason: &str) -> CycleOutcome {
    CycleOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn failed(err: &CycleError) -> CycleOutcome {
    CycleOutcome::Failed {
        error: err.to_string(),
        kind: err.kind().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Accountant: volume accounting and counter updates.
//!
//! Reconciles each finished cycle into the session: advances the cycle
//! counter, accumulates USD volume and decides whether the session keeps
//! running. Pure functions over `Session`; persistence is the caller's job.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::types::{CycleError, Session, SwapReceipt};

// ---------------------------------------------------------------------------
// Leg report
// ---------------------------------------------------------------------------

/// What the two legs of a cycle produced. Only built once the buy landed.
#[derive(Debug, Clone)]
pub struct LegReport {
    pub buy: SwapReceipt,
    pub sell: Result<SwapReceipt, CycleError>,
}

impl LegReport {
    /// Number of legs that executed (1 or 2).
    pub fn legs_executed(&self) -> u32 {
        if self.sell.is_ok() {
            2
        } else {
            1
        }
    }
}

/// Result of reconciling one cycle into a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub volume_usd: Decimal,
    pub cycles_completed: u32,
    /// The cycle hit `max_cycles` and the session was deactivated.
    pub finished: bool,
    /// False when the session was stopped while the cycle ran.
    pub counted: bool,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// USD volume generated by `legs` swaps of `trade_size_sol`.
    pub fn volume_usd(trade_size_sol: Decimal, sol_price_usd: Decimal, legs: u32) -> Decimal {
        trade_size_sol * sol_price_usd * Decimal::from(legs)
    }

    /// Take the session for one cycle: no pending run, claim `run_id`.
    pub fn claim(session: &mut Session, run_id: &str) {
        session.next_run_at = None;
        session.run_id = Some(run_id.to_string());
    }

    /// Drop the claim if `run_id` still holds it. Returns whether it did.
    pub fn release(session: &mut Session, run_id: &str) -> bool {
        if session.run_id.as_deref() == Some(run_id) {
            session.run_id = None;
            true
        } else {
            false
        }
    }

    /// Apply a finished cycle to `session` and release its claim.
    ///
    /// A session stopped while the cycle ran gets its claim released but
    /// its counters untouched (`counted: false`). Fails with `NotRunning`
    /// when `run_id` no longer holds the claim. The counter never passes
    /// `max_cycles`.
    pub fn reconcile(
        session: &mut Session,
        run_id: &str,
        legs: &LegReport,
        sol_price_usd: Decimal,
        next_run_at: DateTime<Utc>,
    ) -> Result<Reconciliation, CycleError> {
        if !Self::release(session, run_id) {
            return Err(CycleError::NotRunning);
        }
        if !session.is_active {
            warn!(user_id = %session.user_id, run_id, "Session stopped during cycle, not counted");
            return Ok(Reconciliation {
                volume_usd: Decimal::ZERO,
                cycles_completed: session.cycles_completed,
                finished: false,
                counted: false,
            });
        }
        if session.reached_max_cycles() {
            warn!(user_id = %session.user_id, "Cycle finished past max_cycles, not counted");
            session.is_active = false;
            session.next_run_at = None;
            return Ok(Reconciliation {
                volume_usd: Decimal::ZERO,
                cycles_completed: session.cycles_completed,
                finished: true,
                counted: false,
            });
        }

        let volume = Self::volume_usd(session.trade_size_sol, sol_price_usd, legs.legs_executed());
        session.cycles_completed += 1;
        session.total_volume_usd += volume;

        let finished = session.reached_max_cycles();
        if finished {
            session.is_active = false;
            session.next_run_at = None;
        } else {
            session.next_run_at = Some(next_run_at);
        }

        info!(
            user_id = %session.user_id,
            cycle = session.cycles_completed,
            max_cycles = session.max_cycles,
            legs = legs.legs_executed(),
            volume_usd = %volume,
            total_volume_usd = %session.total_volume_usd,
            finished,
            "Cycle reconciled"
        );

        Ok(Reconciliation {
            volume_usd: volume,
            cycles_completed: session.cycles_completed,
            finished,
            counted: true,
        })
    }

    /// Release the claim after a failed cycle: counters untouched, next
    /// run scheduled if the session is still active.
    pub fn reschedule(
        session: &mut Session,
        run_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), CycleError> {
        if !Self::release(session, run_id) {
            return Err(CycleError::NotRunning);
        }
        if session.is_active {
            session.next_run_at = Some(next_run_at);
        }
        Ok(())
    }

    /// Move a session to INACTIVE.
    pub fn deactivate(session: &mut Session) {
        session.is_active = false;
        session.next_run_at = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

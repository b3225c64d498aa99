//! Shared types for the swapcycle service.
//!
//! These types form the data model used across all modules: the persisted
//! session record, swap/cycle results, market snapshots and the error
//! taxonomy every operation reports through.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lamports per SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert a lamport amount to SOL.
pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from_i128_with_scale(lamports as i128, 9)
}

/// Convert a SOL amount to lamports, truncating sub-lamport dust.
pub fn sol_to_lamports(sol: Decimal) -> u64 {
    use rust_decimal::prelude::ToPrimitive;
    (sol * Decimal::from(LAMPORTS_PER_SOL))
        .trunc()
        .to_u64()
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-user session record: custodied wallet, trade parameters and the
/// aggregate counters of the cycles run so far.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub wallet_public_key: String,
    /// Base58 64-byte secret. Never logged.
    #[serde(skip_serializing)]
    pub wallet_private_key: String,
    pub trade_size_sol: Decimal,
    pub is_active: bool,
    pub cycles_completed: u32,
    pub max_cycles: u32,
    pub total_volume_usd: Decimal,
    pub started_at: Option<DateTime<Utc>>,
    /// When the next cycle is due. `None` while idle or while a cycle is
    /// in flight.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Claim token of the cycle currently in flight. Set when a runner
    /// claims the session and cleared when that same runner finishes, even
    /// if the session was stopped meanwhile.
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped on every write.
    pub version: u64,
}

impl Session {
    /// A fresh, inactive session for a newly custodied wallet.
    pub fn new(
        user_id: &str,
        public_key: &str,
        private_key: &str,
        trade_size_sol: Decimal,
        max_cycles: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            wallet_public_key: public_key.to_string(),
            wallet_private_key: private_key.to_string(),
            trade_size_sol,
            is_active: false,
            cycles_completed: 0,
            max_cycles,
            total_volume_usd: Decimal::ZERO,
            started_at: None,
            next_run_at: None,
            run_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn has_wallet(&self) -> bool {
        !self.wallet_private_key.is_empty() && !self.wallet_public_key.is_empty()
    }

    /// Trade size in lamports.
    pub fn trade_lamports(&self) -> u64 {
        sol_to_lamports(self.trade_size_sol)
    }

    pub fn reached_max_cycles(&self) -> bool {
        self.cycles_completed >= self.max_cycles
    }

    /// A runner holds a claim on this session.
    pub fn in_flight(&self) -> bool {
        self.run_id.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        if self.is_active {
            SessionStatus::Active
        } else {
            SessionStatus::Inactive
        }
    }
}

/// The two scheduler states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Inactive,
    Active,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Inactive => write!(f, "INACTIVE"),
            SessionStatus::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Public view of a session, as returned by the `status` action.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub is_active: bool,
    pub cycle_in_flight: bool,
    pub wallet: String,
    pub balance: Decimal,
    pub trade_size_sol: Decimal,
    pub cycles_completed: u32,
    pub max_cycles: u32,
    pub total_volume_usd: Decimal,
    pub started_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn from_session(session: &Session, balance: Decimal) -> Self {
        Self {
            status: session.status(),
            is_active: session.is_active,
            cycle_in_flight: session.in_flight(),
            wallet: session.wallet_public_key.clone(),
            balance,
            trade_size_sol: session.trade_size_sol,
            cycles_completed: session.cycles_completed,
            max_cycles: session.max_cycles,
            total_volume_usd: session.total_volume_usd,
            started_at: session.started_at,
            next_run_at: session.next_run_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Swaps
// ---------------------------------------------------------------------------

/// Which way a swap goes relative to SOL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// SOL → token.
    Buy,
    /// Token → SOL.
    Sell,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// A route quote from the swap router. `raw` is passed back verbatim when
/// building the transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub raw: serde_json::Value,
}

/// Result of a submitted swap.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SwapReceipt {
    pub direction: Direction,
    pub signature: String,
    /// Raw input amount (lamports or token base units).
    pub in_amount: u64,
    /// Quoted raw output amount.
    pub out_amount: u64,
}

/// SPL token balance of an owner for one mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenBalance {
    /// Raw amount in base units.
    pub amount: u64,
    pub decimals: u8,
}

impl TokenBalance {
    pub fn is_empty(&self) -> bool {
        self.amount == 0
    }

    pub fn ui_amount(&self) -> Decimal {
        Decimal::from_i128_with_scale(self.amount as i128, u32::from(self.decimals))
    }
}

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Outcome of one invocation of the cycle runner.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Buy and (possibly) sell executed.
    Completed {
        buy: SwapReceipt,
        sell: Option<SwapReceipt>,
        /// Sell leg error, if the sell failed after a successful buy.
        sell_error: Option<String>,
        volume_usd: Decimal,
        /// False when the session was stopped while the cycle ran.
        counted: bool,
        cycles_completed: u32,
    },
    /// Leg failure; counters not advanced, next run still scheduled.
    Failed { error: String, kind: String },
    /// Session was inactive or another runner owned it.
    Skipped { reason: String },
    /// The session was deactivated by this run.
    Stopped { reason: StopReason },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }
}

/// Why the scheduler moved a session to INACTIVE on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxCyclesReached,
    LowBalance,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxCyclesReached => write!(f, "Max cycles reached"),
            StopReason::LowBalance => write!(f, "Low balance, paused"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Snapshot of the traded token's market, for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSnapshot {
    pub price_usd: String,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub buys_24h: u64,
    pub sells_24h: u64,
    pub price_change_24h: f64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Every failure an operation can report. `kind()` gives the stable tag
/// used in API responses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Quote: {0}")]
    NoRoute(String),

    #[error("Swap: {0}")]
    NoSwapTransaction(String),

    #[error("{0}")]
    SubmissionFailed(String),

    #[error("No tokens after buy")]
    NoTokensAfterBuy,

    #[error("Upstream error ({service}): {message}")]
    Upstream { service: String, message: String },

    #[error("Need {needed:.4} SOL, have {available:.4}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Trade size must be {min}-{max} SOL")]
    InvalidTradeSize { min: Decimal, max: Decimal },

    #[error("No wallet configured")]
    NoWallet,

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Session not found for user {0}")]
    SessionNotFound(String),

    #[error("Session {0} was modified concurrently")]
    VersionConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CycleError {
    /// Stable snake_case tag for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::InvalidKey(_) => "invalid_key",
            CycleError::MalformedTransaction(_) => "malformed_transaction",
            CycleError::NoRoute(_) => "no_route",
            CycleError::NoSwapTransaction(_) => "no_swap_transaction",
            CycleError::SubmissionFailed(_) => "submission_failed",
            CycleError::NoTokensAfterBuy => "no_tokens_after_buy",
            CycleError::Upstream { .. } => "upstream",
            CycleError::InsufficientBalance { .. } => "insufficient_balance",
            CycleError::InvalidTradeSize { .. } => "invalid_trade_size",
            CycleError::NoWallet => "no_wallet",
            CycleError::AlreadyRunning => "already_running",
            CycleError::NotRunning => "not_running",
            CycleError::SessionNotFound(_) => "session_not_found",
            CycleError::VersionConflict(_) => "version_conflict",
            CycleError::Storage(_) => "storage",
            CycleError::Config(_) => "config",
        }
    }

    pub fn upstream(service: &str, message: impl Into<String>) -> Self {
        CycleError::Upstream {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CycleError {
    fn from(e: sqlx::Error) -> Self {
        CycleError::Storage(e.to_string())
    }
}

/// Trade-size band defaults.
pub const MIN_TRADE_SOL: Decimal = dec!(0.001);
pub const MAX_TRADE_SOL: Decimal = dec!(0.01);
pub const DEFAULT_TRADE_SOL: Decimal = dec!(0.005);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

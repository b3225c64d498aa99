//! Session controller.
//!
//! The user-facing operations: custody a wallet, read status, change the
//! trade size, start and stop cycling. Each one validates against the
//! stored session and writes through the versioned store.

use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::ChainRpc;
use crate::engine::accountant::Accountant;
use crate::engine::runner::CycleRunner;
use crate::market::MarketDataSource;
use crate::storage::SessionStore;
use crate::types::{
    lamports_to_sol, CycleError, CycleOutcome, Session, SessionView, TokenSnapshot,
};
use crate::wallet::Keypair;

/// Trade-size band and per-session cycle cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeLimits {
    pub min_trade_sol: Decimal,
    pub max_trade_sol: Decimal,
    pub default_trade_sol: Decimal,
    pub max_cycles: u32,
}

impl TradeLimits {
    pub fn check(&self, trade_size_sol: Decimal) -> Result<(), CycleError> {
        if trade_size_sol < self.min_trade_sol || trade_size_sol > self.max_trade_sol {
            return Err(CycleError::InvalidTradeSize {
                min: self.min_trade_sol,
                max: self.max_trade_sol,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletInfo {
    pub public_key: String,
    pub balance: Decimal,
}

/// A freshly generated wallet. The secret is handed out exactly once.
#[derive(Debug, Clone)]
pub struct CreatedWallet {
    pub public_key: String,
    pub private_key: SecretString,
    pub balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub session: Option<SessionView>,
    pub token: Option<TokenSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopSummary {
    pub cycles_completed: u32,
    pub total_volume_usd: Decimal,
}

pub struct SessionController {
    store: SessionStore,
    chain: Arc<dyn ChainRpc>,
    market: Arc<dyn MarketDataSource>,
    runner: Arc<CycleRunner>,
    limits: TradeLimits,
    token_mint: String,
}

impl SessionController {
    pub fn new(
        store: SessionStore,
        chain: Arc<dyn ChainRpc>,
        market: Arc<dyn MarketDataSource>,
        runner: Arc<CycleRunner>,
        limits: TradeLimits,
        token_mint: &str,
    ) -> Self {
        Self {
            store,
            chain,
            market,
            runner,
            limits,
            token_mint: token_mint.to_string(),
        }
    }

    /// Import a base58 keypair as the user's custodied wallet. Replaces any
    /// previous wallet and resets the session.
    pub async fn set_wallet(&self, user_id: &str, private_key: &str) -> Result<WalletInfo, CycleError> {
        let keypair = Keypair::from_base58(private_key)?;
        let balance = self.balance_of(keypair.public_key()).await?;
        self.store_wallet(user_id, &keypair).await?;

        info!(user_id, wallet = keypair.public_key(), balance = %balance, "Wallet imported");
        Ok(WalletInfo {
            public_key: keypair.public_key().to_string(),
            balance,
        })
    }

    /// Generate a new custodied wallet for the user.
    pub async fn create_wallet(&self, user_id: &str) -> Result<CreatedWallet, CycleError> {
        let keypair = Keypair::generate();
        self.store_wallet(user_id, &keypair).await?;

        let balance = match self.balance_of(keypair.public_key()).await {
            Ok(b) => b,
            Err(e) => {
                warn!(user_id, error = %e, "Balance lookup failed for new wallet");
                Decimal::ZERO
            }
        };

        info!(user_id, wallet = keypair.public_key(), "Wallet generated");
        Ok(CreatedWallet {
            public_key: keypair.public_key().to_string(),
            private_key: keypair.secret_base58().clone(),
            balance,
        })
    }

    async fn store_wallet(&self, user_id: &str, keypair: &Keypair) -> Result<Session, CycleError> {
        let session = Session::new(
            user_id,
            keypair.public_key(),
            keypair.secret_base58().expose_secret(),
            self.limits.default_trade_sol,
            self.limits.max_cycles,
        );
        self.store.upsert_wallet(&session).await
    }

    /// Session view plus a market snapshot of the traded token. Market
    /// data failures degrade to `token: None`.
    pub async fn status(&self, user_id: &str) -> Result<StatusReport, CycleError> {
        let session = match self.store.get(user_id).await? {
            Some(s) => {
                let balance = self.balance_of(&s.wallet_public_key).await?;
                Some(SessionView::from_session(&s, balance))
            }
            None => None,
        };

        let token = match self.market.token_snapshot(&self.token_mint).await {
            Ok(snap) => snap,
            Err(e) => {
                warn!(error = %e, "Token snapshot unavailable");
                None
            }
        };

        Ok(StatusReport { session, token })
    }

    /// Change the trade size. Takes effect from the next cycle.
    pub async fn set_volume(&self, user_id: &str, trade_size_sol: Decimal) -> Result<(), CycleError> {
        self.limits.check(trade_size_sol)?;
        if self.store.get(user_id).await?.is_none() {
            return Err(CycleError::NoWallet);
        }
        self.store
            .modify(user_id, |s| {
                s.trade_size_sol = trade_size_sol;
                Ok(())
            })
            .await?;
        info!(user_id, trade_size_sol = %trade_size_sol, "Trade size updated");
        Ok(())
    }

    /// Activate the session and run its first cycle.
    ///
    /// Fails without touching the session when the wallet holds less than
    /// the start multiple of the trade size. A session stopped while a
    /// cycle was in flight stays `AlreadyRunning` until that cycle ends.
    pub async fn start(&self, user_id: &str) -> Result<CycleOutcome, CycleError> {
        let session = match self.store.get(user_id).await? {
            Some(s) if s.has_wallet() => s,
            _ => return Err(CycleError::NoWallet),
        };
        if session.is_active || session.in_flight() {
            return Err(CycleError::AlreadyRunning);
        }

        let balance = self.balance_of(&session.wallet_public_key).await?;
        let needed = self.runner.limits().start_requirement(session.trade_size_sol);
        if balance < needed {
            return Err(CycleError::InsufficientBalance {
                needed,
                available: balance,
            });
        }

        let now = Utc::now();
        self.store
            .modify(user_id, |s| {
                if s.is_active || s.in_flight() {
                    return Err(CycleError::AlreadyRunning);
                }
                s.is_active = true;
                s.cycles_completed = 0;
                s.total_volume_usd = Decimal::ZERO;
                s.max_cycles = self.limits.max_cycles;
                s.started_at = Some(now);
                s.next_run_at = Some(now);
                Ok(())
            })
            .await?;

        info!(user_id, balance = %balance, trade_size_sol = %session.trade_size_sol, "Session started");
        self.runner.run(user_id).await
    }

    /// Deactivate the session. Any cycle already in flight finishes but is
    /// not counted.
    pub async fn stop(&self, user_id: &str) -> Result<StopSummary, CycleError> {
        if self.store.get(user_id).await?.is_none() {
            return Err(CycleError::NotRunning);
        }
        let (session, _) = self
            .store
            .modify(user_id, |s| {
                if !s.is_active {
                    return Err(CycleError::NotRunning);
                }
                Accountant::deactivate(s);
                Ok(())
            })
            .await?;

        info!(
            user_id,
            cycles_completed = session.cycles_completed,
            total_volume_usd = %session.total_volume_usd,
            "Session stopped"
        );
        Ok(StopSummary {
            cycles_completed: session.cycles_completed,
            total_volume_usd: session.total_volume_usd,
        })
    }

    /// Run one cycle for `user_id` now, outside the scheduler's cadence.
    pub async fn run_cycle(&self, user_id: &str) -> Result<CycleOutcome, CycleError> {
        self.runner.run(user_id).await
    }

    async fn balance_of(&self, public_key: &str) -> Result<Decimal, CycleError> {
        Ok(lamports_to_sol(self.chain.get_balance(public_key).await?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

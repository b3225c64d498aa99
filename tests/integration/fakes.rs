//! In-memory chain, router and market fakes for integration testing.
//!
//! `FakeRouter` encodes each swap into a small v0-style message; `FakeChain`
//! verifies the wallet's signature over it and applies the swap to its
//! balances, so a cycle moves real (fake) funds end to end.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use swapcycle::chain::ChainRpc;
use swapcycle::engine::controller::{SessionController, TradeLimits};
use swapcycle::engine::runner::{BalanceLimits, CycleRunner, Pacing};
use swapcycle::engine::scheduler::Scheduler;
use swapcycle::market::MarketDataSource;
use swapcycle::storage::SessionStore;
use swapcycle::swap::executor::{SwapExecutor, SwapSettings};
use swapcycle::swap::SwapRouter;
use swapcycle::types::{CycleError, Direction, SwapQuote, TokenBalance, TokenSnapshot};
use swapcycle::wallet::transaction::encode_compact_u16;

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const TOKEN_MINT: &str = "8hiQpxRxqiW31B6LZsJbdLPhxGT4DA2kX2TMZXLDjoy9";

/// Token base units received per lamport on a buy.
const TOKENS_PER_LAMPORT: u64 = 1_000;

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// A landed swap, as seen by the fake chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub direction: Direction,
    pub owner: String,
    pub in_amount: u64,
    pub out_amount: u64,
}

/// Parks one call until released.
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until a call is parked on this gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn park(&self) {
        self.reached.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
pub struct FakeChain {
    lamports: Mutex<HashMap<String, u64>>,
    tokens: Mutex<HashMap<String, u64>>,
    submitted: Mutex<Vec<Submitted>>,
    /// Fail every send whose direction matches.
    fail_sends: Mutex<Option<Direction>>,
    /// Parks the next token balance read, i.e. a cycle between its legs.
    hold_token_read: Mutex<Option<Arc<Gate>>>,
}

impl FakeChain {
    pub fn set_balance(&self, owner: &str, sol: Decimal) {
        self.lamports
            .lock()
            .unwrap()
            .insert(owner.to_string(), swapcycle::types::sol_to_lamports(sol));
    }

    pub fn balance(&self, owner: &str) -> u64 {
        self.lamports.lock().unwrap().get(owner).copied().unwrap_or(0)
    }

    pub fn tokens(&self, owner: &str) -> u64 {
        self.tokens.lock().unwrap().get(owner).copied().unwrap_or(0)
    }

    pub fn fail_sends(&self, direction: Option<Direction>) {
        *self.fail_sends.lock().unwrap() = direction;
    }

    /// Park the next token balance read until the returned gate is
    /// released.
    pub fn hold_next_token_read(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.hold_token_read.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn submitted(&self) -> Vec<Submitted> {
        self.submitted.lock().unwrap().clone()
    }

    fn apply(&self, swap: &Submitted) -> Result<(), CycleError> {
        let mut lamports = self.lamports.lock().unwrap();
        let mut tokens = self.tokens.lock().unwrap();
        let sol = lamports.entry(swap.owner.clone()).or_insert(0);
        let tok = tokens.entry(swap.owner.clone()).or_insert(0);

        match swap.direction {
            Direction::Buy => {
                *sol = sol
                    .checked_sub(swap.in_amount)
                    .ok_or_else(|| CycleError::SubmissionFailed("insufficient lamports".into()))?;
                *tok += swap.out_amount;
            }
            Direction::Sell => {
                *tok = tok
                    .checked_sub(swap.in_amount)
                    .ok_or_else(|| CycleError::SubmissionFailed("insufficient tokens".into()))?;
                *sol += swap.out_amount;
            }
        }
        Ok(())
    }
}

/// Parse and verify a transaction built by [`FakeRouter`].
fn decode_signed(signed_b64: &str) -> Result<Submitted, CycleError> {
    let bad = |m: &str| CycleError::SubmissionFailed(m.to_string());
    let tx = BASE64.decode(signed_b64).map_err(|_| bad("bad base64"))?;
    // One signature: 1-byte count, 64-byte slot, then the message.
    if tx.len() < 1 + 64 + MESSAGE_LEN || tx[0] != 1 {
        return Err(bad("unexpected layout"));
    }
    let sig = Signature::from_slice(&tx[1..65]).map_err(|_| bad("bad signature bytes"))?;
    let message = &tx[65..];

    let owner_bytes: [u8; 32] = message[2..34].try_into().map_err(|_| bad("bad owner"))?;
    let owner = VerifyingKey::from_bytes(&owner_bytes).map_err(|_| bad("bad owner key"))?;
    owner
        .verify(message, &sig)
        .map_err(|_| bad("signature verification failed"))?;

    let direction = if message[1] == 0 { Direction::Buy } else { Direction::Sell };
    let read_u64 = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&message[at..at + 8]);
        u64::from_le_bytes(b)
    };

    Ok(Submitted {
        direction,
        owner: bs58::encode(owner_bytes).into_string(),
        in_amount: read_u64(34),
        out_amount: read_u64(42),
    })
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn get_balance(&self, owner: &str) -> Result<u64, CycleError> {
        Ok(self.balance(owner))
    }

    async fn get_token_balance(&self, owner: &str, _mint: &str) -> Result<TokenBalance, CycleError> {
        let gate = self.hold_token_read.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.park().await;
        }
        Ok(TokenBalance {
            amount: self.tokens(owner),
            decimals: 6,
        })
    }

    async fn send_transaction(&self, signed_b64: &str, _max_retries: u32) -> Result<String, CycleError> {
        let swap = decode_signed(signed_b64)?;
        if *self.fail_sends.lock().unwrap() == Some(swap.direction) {
            return Err(CycleError::SubmissionFailed("Blockhash not found".into()));
        }
        self.apply(&swap)?;

        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(swap);
        Ok(format!("fake-sig-{}", submitted.len()))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// `0x80 | direction | owner(32) | in u64 | out u64`
const MESSAGE_LEN: usize = 1 + 1 + 32 + 8 + 8;

#[derive(Default)]
pub struct FakeRouter {
    no_route: Mutex<bool>,
}

impl FakeRouter {
    pub fn set_no_route(&self, on: bool) {
        *self.no_route.lock().unwrap() = on;
    }
}

#[async_trait]
impl SwapRouter for FakeRouter {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        _slippage_bps: u16,
    ) -> Result<SwapQuote, CycleError> {
        if *self.no_route.lock().unwrap() {
            return Err(CycleError::NoRoute("No route".into()));
        }
        // Sells lose 1% to the pool.
        let out_amount = if input_mint == SOL_MINT {
            amount * TOKENS_PER_LAMPORT
        } else {
            amount / TOKENS_PER_LAMPORT * 99 / 100
        };
        Ok(SwapQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: amount,
            out_amount,
            raw: serde_json::json!({ "inAmount": amount.to_string(), "outAmount": out_amount.to_string() }),
        })
    }

    async fn build_swap_transaction(
        &self,
        quote: &SwapQuote,
        owner: &str,
        _priority_fee_lamports: u64,
    ) -> Result<Vec<u8>, CycleError> {
        let owner = bs58::decode(owner)
            .into_vec()
            .map_err(|e| CycleError::NoSwapTransaction(e.to_string()))?;

        let mut tx = encode_compact_u16(1);
        tx.extend([0u8; 64]);
        tx.push(0x80);
        tx.push(if quote.input_mint == SOL_MINT { 0 } else { 1 });
        tx.extend(owner);
        tx.extend(quote.in_amount.to_le_bytes());
        tx.extend(quote.out_amount.to_le_bytes());
        Ok(tx)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

pub struct FakeMarket {
    pub sol_price: Option<Decimal>,
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn token_snapshot(&self, _mint: &str) -> Result<Option<TokenSnapshot>, CycleError> {
        Ok(Some(TokenSnapshot {
            price_usd: "0.0001".into(),
            market_cap: 100_000.0,
            volume_24h: 2_500.0,
            buys_24h: 12,
            sells_24h: 9,
            price_change_24h: 1.5,
        }))
    }

    async fn sol_price_usd(&self) -> Result<Decimal, CycleError> {
        self.sol_price
            .ok_or_else(|| CycleError::upstream("fake-market", "price unavailable"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// The full service wired over the fakes.
pub struct Harness {
    pub store: SessionStore,
    pub chain: Arc<FakeChain>,
    pub router: Arc<FakeRouter>,
    pub runner: Arc<CycleRunner>,
    pub controller: SessionController,
    pub scheduler: Scheduler,
}

impl Harness {
    pub async fn new(max_cycles: u32) -> Self {
        Self::with_price(max_cycles, Some(dec!(150))).await
    }

    pub async fn with_price(max_cycles: u32, sol_price: Option<Decimal>) -> Self {
        let store = SessionStore::in_memory().await.unwrap();
        let chain = Arc::new(FakeChain::default());
        let router = Arc::new(FakeRouter::default());
        let market: Arc<dyn MarketDataSource> = Arc::new(FakeMarket { sol_price });

        let settings = SwapSettings {
            sol_mint: SOL_MINT.into(),
            token_mint: TOKEN_MINT.into(),
            slippage_bps: 500,
            priority_fee_lamports: 300_000,
            max_send_retries: 3,
        };
        let executor = Arc::new(SwapExecutor::new(router.clone(), chain.clone(), settings, false));

        let runner = Arc::new(CycleRunner::new(
            store.clone(),
            chain.clone(),
            executor,
            market.clone(),
            Pacing::immediate(),
            BalanceLimits {
                start_multiplier: dec!(2),
                pause_multiplier: dec!(1.5),
            },
            dec!(150),
        ));

        let controller = SessionController::new(
            store.clone(),
            chain.clone(),
            market,
            runner.clone(),
            TradeLimits {
                min_trade_sol: dec!(0.001),
                max_trade_sol: dec!(0.01),
                default_trade_sol: dec!(0.005),
                max_cycles,
            },
            TOKEN_MINT,
        );

        let scheduler = Scheduler::new(store.clone(), runner.clone(), Duration::from_millis(5));

        Self {
            store,
            chain,
            router,
            runner,
            controller,
            scheduler,
        }
    }

    /// Import a deterministic wallet for `user` funded with `sol`.
    /// Returns the wallet address.
    pub async fn funded_wallet(&self, user: &str, seed: u8, sol: Decimal) -> String {
        let secret = keypair_b58(seed);
        let public_key = swapcycle::wallet::Keypair::from_base58(&secret)
            .unwrap()
            .public_key()
            .to_string();
        self.chain.set_balance(&public_key, sol);
        self.controller.set_wallet(user, &secret).await.unwrap();
        public_key
    }
}

/// Base58 64-byte keypair derived from a fixed seed.
pub fn keypair_b58(seed: u8) -> String {
    let signing = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    bs58::encode(signing.to_keypair_bytes()).into_string()
}

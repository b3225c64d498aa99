//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys, bearer tokens) are referenced by env-var name in the
//! config and resolved at runtime into `secrecy` wrappers.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::controller::TradeLimits;
use crate::engine::runner::{BalanceLimits, Pacing};
use crate::swap::executor::SwapSettings;
use crate::types::{sol_to_lamports, DEFAULT_TRADE_SOL, MAX_TRADE_SOL, MIN_TRADE_SOL};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    pub token: TokenConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub market: MarketConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub port: u16,
    /// Log swaps instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Env var holding `user_id=token` pairs, comma separated.
    pub user_tokens_env: String,
    /// Env var holding the service token allowed to call `run_cycle`.
    pub service_token_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            user_tokens_env: "SWAPCYCLE_USER_TOKENS".into(),
            service_token_env: "SWAPCYCLE_SERVICE_TOKEN".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// If set and present in the environment, the Helius mainnet RPC is
    /// used instead of `rpc_url`.
    #[serde(default)]
    pub helius_api_key_env: Option<String>,
    #[serde(default = "default_send_retries")]
    pub max_send_retries: u32,
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SwapConfig {
    pub jupiter_base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub slippage_bps: u16,
    pub priority_fee_sol: Decimal,
    pub timeout_secs: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            jupiter_base_url: crate::swap::jupiter::DEFAULT_BASE_URL.into(),
            api_key_env: Some("JUPITER_API_KEY".into()),
            slippage_bps: 500,
            priority_fee_sol: dec!(0.0003),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    /// Mint of the token the cycles trade.
    pub mint: String,
    #[serde(default = "default_sol_mint")]
    pub sol_mint: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VolumeConfig {
    pub min_trade_sol: Decimal,
    pub max_trade_sol: Decimal,
    pub default_trade_sol: Decimal,
    pub max_cycles: u32,
    /// Balance multiple of the trade size required to start.
    pub start_multiplier: Decimal,
    /// Balance multiple below which a running session pauses.
    pub pause_multiplier: Decimal,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            min_trade_sol: MIN_TRADE_SOL,
            max_trade_sol: MAX_TRADE_SOL,
            default_trade_sol: DEFAULT_TRADE_SOL,
            max_cycles: 100,
            start_multiplier: dec!(2),
            pause_multiplier: dec!(1.5),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PacingConfig {
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
    pub interval_min_secs: u64,
    pub interval_max_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            settle_min_ms: 3_000,
            settle_max_ms: 8_000,
            interval_min_secs: 30,
            interval_max_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// Pick active sessions back up after a restart. When false, every
    /// active session is deactivated at startup.
    pub resume_on_restart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            resume_on_restart: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    pub dexscreener_base_url: String,
    /// Used for volume accounting when the live SOL price is unavailable.
    pub fallback_sol_price_usd: Decimal,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            dexscreener_base_url: crate::market::dexscreener::DEFAULT_BASE_URL.into(),
            fallback_sol_price_usd: dec!(150),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_send_retries() -> u32 {
    3
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_sol_mint() -> String {
    "So11111111111111111111111111111111111111112".into()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let v = &self.volume;
        if v.min_trade_sol <= Decimal::ZERO || v.min_trade_sol > v.max_trade_sol {
            bail!("volume: min_trade_sol must be positive and <= max_trade_sol");
        }
        if v.default_trade_sol < v.min_trade_sol || v.default_trade_sol > v.max_trade_sol {
            bail!("volume: default_trade_sol must lie within the trade-size band");
        }
        if v.pause_multiplier > v.start_multiplier {
            bail!("volume: pause_multiplier must not exceed start_multiplier");
        }
        let p = &self.pacing;
        if p.settle_min_ms > p.settle_max_ms || p.interval_min_secs > p.interval_max_secs {
            bail!("pacing: min must not exceed max");
        }
        if self.scheduler.poll_interval_ms == 0 {
            bail!("scheduler: poll_interval_ms must be positive");
        }
        Ok(())
    }

    /// Resolve an optional secret referenced by env-var name.
    pub fn resolve_secret(env_name: Option<&str>) -> Option<SecretString> {
        env_name
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
            .map(SecretString::new)
    }

    /// The RPC endpoint to use, preferring Helius when its key is set.
    pub fn rpc_url(&self) -> String {
        match self
            .chain
            .helius_api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
        {
            Some(key) => format!("https://mainnet.helius-rpc.com/?api-key={key}"),
            None => self.chain.rpc_url.clone(),
        }
    }

    pub fn swap_settings(&self) -> SwapSettings {
        SwapSettings {
            sol_mint: self.token.sol_mint.clone(),
            token_mint: self.token.mint.clone(),
            slippage_bps: self.swap.slippage_bps,
            priority_fee_lamports: sol_to_lamports(self.swap.priority_fee_sol),
            max_send_retries: self.chain.max_send_retries,
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            settle_min: Duration::from_millis(self.pacing.settle_min_ms),
            settle_max: Duration::from_millis(self.pacing.settle_max_ms),
            interval_min: Duration::from_secs(self.pacing.interval_min_secs),
            interval_max: Duration::from_secs(self.pacing.interval_max_secs),
        }
    }

    pub fn balance_limits(&self) -> BalanceLimits {
        BalanceLimits {
            start_multiplier: self.volume.start_multiplier,
            pause_multiplier: self.volume.pause_multiplier,
        }
    }

    pub fn trade_limits(&self) -> TradeLimits {
        TradeLimits {
            min_trade_sol: self.volume.min_trade_sol,
            max_trade_sol: self.volume.max_trade_sol,
            default_trade_sol: self.volume.default_trade_sol,
            max_cycles: self.volume.max_cycles,
        }
    }
}

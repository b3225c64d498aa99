//! swapcycle: custodial swap-cycle service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the session store, recovers sessions left running by a previous
//! process, then serves the action API and runs the scheduler until
//! Ctrl+C.

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use swapcycle::api::{self, ApiState, TokenAuth};
use swapcycle::chain::rpc::SolanaRpcClient;
use swapcycle::chain::ChainRpc;
use swapcycle::config::AppConfig;
use swapcycle::engine::controller::SessionController;
use swapcycle::engine::runner::CycleRunner;
use swapcycle::engine::scheduler::Scheduler;
use swapcycle::market::dexscreener::DexScreenerClient;
use swapcycle::market::MarketDataSource;
use swapcycle::storage::SessionStore;
use swapcycle::swap::executor::SwapExecutor;
use swapcycle::swap::jupiter::JupiterClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    info!(
        name = %cfg.service.name,
        token = %cfg.token.mint,
        dry_run = cfg.service.dry_run,
        max_cycles = cfg.volume.max_cycles,
        "swapcycle starting up"
    );

    // -- Components ------------------------------------------------------

    let store = SessionStore::connect(&cfg.storage.database_url)
        .await
        .context("Failed to open session store")?;

    let chain: Arc<dyn ChainRpc> = Arc::new(SolanaRpcClient::new(
        &cfg.rpc_url(),
        Duration::from_secs(cfg.chain.timeout_secs),
    )?);

    let jupiter_key = AppConfig::resolve_secret(cfg.swap.api_key_env.as_deref());
    if jupiter_key.is_none() {
        warn!("No Jupiter API key configured, using keyless access");
    }
    let router = Arc::new(JupiterClient::new(
        &cfg.swap.jupiter_base_url,
        jupiter_key,
        Duration::from_secs(cfg.swap.timeout_secs),
    )?);

    let market: Arc<dyn MarketDataSource> = Arc::new(DexScreenerClient::new(
        &cfg.market.dexscreener_base_url,
        &cfg.token.sol_mint,
    )?);

    if cfg.service.dry_run {
        warn!("Dry-run mode: swaps are logged, never sent");
    }
    let executor = Arc::new(SwapExecutor::new(
        router,
        chain.clone(),
        cfg.swap_settings(),
        cfg.service.dry_run,
    ));

    let runner = Arc::new(CycleRunner::new(
        store.clone(),
        chain.clone(),
        executor,
        market.clone(),
        cfg.pacing(),
        cfg.balance_limits(),
        cfg.market.fallback_sol_price_usd,
    ));

    let controller = Arc::new(SessionController::new(
        store.clone(),
        chain,
        market,
        runner.clone(),
        cfg.trade_limits(),
        &cfg.token.mint,
    ));

    let scheduler = Scheduler::new(
        store,
        runner,
        Duration::from_millis(cfg.scheduler.poll_interval_ms),
    );
    scheduler
        .recover(cfg.scheduler.resume_on_restart)
        .await
        .context("Failed to recover sessions")?;

    // -- API -------------------------------------------------------------

    let users = AppConfig::resolve_secret(Some(cfg.api.user_tokens_env.as_str()))
        .map(|raw| TokenAuth::parse_user_tokens(raw.expose_secret()))
        .unwrap_or_default();
    let service_token = AppConfig::resolve_secret(Some(cfg.api.service_token_env.as_str()));
    if users.is_empty() {
        warn!(env = %cfg.api.user_tokens_env, "No user tokens configured; only the service token can call the API");
    }
    let auth = TokenAuth::new(users, service_token);
    info!(users = auth.user_count(), "API auth loaded");

    let state = Arc::new(ApiState { controller, auth });
    let addr: SocketAddr = format!("{}:{}", cfg.service.bind, cfg.service.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", cfg.service.bind, cfg.service.port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server = tokio::spawn(api::serve(state, addr, wait_for_shutdown(shutdown_rx.clone())));

    // -- Main loop -------------------------------------------------------

    tokio::select! {
        _ = scheduler.run(wait_for_shutdown(shutdown_rx)) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received.");
        }
        res = &mut server => {
            // The server only returns on its own if it failed.
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("API server task panicked: {e}")),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server stopped with error"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!(in_flight = scheduler.in_flight(), "swapcycle shut down cleanly.");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("swapcycle=info"));

    let json_logging = std::env::var("SWAPCYCLE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

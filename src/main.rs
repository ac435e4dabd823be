//! Real-time price aggregation for on-chain liquidity pools
//!
//! Subscribes to pool account updates over the chain websocket, decodes each
//! pool's state into a spot price, synthesizes cross pairs through the WSOL
//! bridge, persists tick and 1-minute candle history to SQLite, and streams
//! diffs plus live-forming candles to websocket clients.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod candles;
mod config;
mod lifinity;
mod meteora;
mod orca;
mod parser;
mod price_store;
mod programs;
mod pumpfun;
mod raydium;
mod rpc_client;
mod server;
mod storage;
mod tick_writer;

use config::Config;
use price_store::CoreState;
use programs::ProgramRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,price_aggregator=debug")),
        )
        .init();

    info!("📈 Starting pool price aggregator");

    let config = Config::from_env()?;
    info!("✅ Configuration loaded:");
    info!("  • RPC websocket: {}", config.solana_rpc_ws);
    info!("  • Registry file: {}", config.programs_file.display());
    info!("  • Listen address: {}:{}", config.host, config.port);

    let registry = ProgramRegistry::load(&config.programs_file)?;

    // Create every registered pair's tables up front; re-creation is a no-op.
    {
        let ticks = storage::open(&config.tick_db_path)?;
        let historical = storage::open(&config.historical_db_path)?;
        storage::ensure_tables(&ticks, &historical, &registry)?;
    }

    let state = Arc::new(CoreState::new(config, registry));
    seed_price_store(&state).await;

    let (shutdown_tx, _) = broadcast::channel(1);

    let writer = tokio::spawn(tick_writer::run_tick_writer(
        state.clone(),
        shutdown_tx.subscribe(),
    ));
    let aggregator = tokio::spawn(candles::run_aggregator(
        state.clone(),
        shutdown_tx.subscribe(),
    ));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🚀 Serving on http://{addr}");

    axum::serve(listener, server::router(state.clone()))
        .with_graceful_shutdown(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("🛑 Shutdown signal received (Ctrl+C)"),
                Err(e) => error!("❌ Failed to listen for shutdown signal: {e}"),
            }
        })
        .await
        .context("server failed")?;

    // Cooperative cancellation: both long-running tasks release their
    // sockets and database handles on the way out.
    let _ = shutdown_tx.send(());
    for (name, handle) in [("tick writer", writer), ("candle aggregator", aggregator)] {
        match handle.await {
            Ok(Ok(())) => info!("✅ {name} stopped"),
            Ok(Err(e)) => error!("❌ {name} failed: {e:#}"),
            Err(e) => error!("❌ {name} panicked: {e}"),
        }
    }

    info!("👋 Shutdown complete");
    Ok(())
}

/// Warm the price store with the newest persisted tick per pair, so clients
/// connecting before the first upstream update still get known prices.
async fn seed_price_store(state: &CoreState) {
    let registry = state.registry.read().await;
    let conn = match storage::open(&state.config.tick_db_path) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("⚠️ Could not open tick store for seeding: {e:#}");
            return;
        }
    };

    let mut seeded = 0usize;
    for program in &registry.programs {
        let asset_id = program.asset_id.to_string();
        for pair in &program.pairs {
            let Some(table) = storage::tick_table(&registry.valid_tables, &asset_id, pair) else {
                continue;
            };
            match storage::latest_tick(&conn, &table) {
                Ok(Some(tick)) => {
                    state.price_store.set(program.asset_id, pair, tick.price).await;
                    seeded += 1;
                }
                Ok(None) => {}
                Err(e) => debug!("No seed price for {table}: {e}"),
            }
        }
    }

    if seeded > 0 {
        info!("✅ Seeded {seeded} pair prices from the tick store");
    }
}

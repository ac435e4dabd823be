// Upstream ingestion: account subscriptions, decoding, pair synthesis
//
// Sole writer to the tick tables and the price store. One websocket
// connection carries every registered pool's account updates; any failure
// tears the connection down, and the outer loop reconnects a second later
// with fresh subscription state. USD pivots and the synthesized cross pairs
// live in writer-local maps that reset with the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rusqlite::Connection;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::price_store::CoreState;
use crate::programs::ProgramDescriptor;
use crate::rpc_client::RpcClient;
use crate::storage::{self, TICK_SOURCE};

/// Pivot currency for synthesized cross pairs.
const BRIDGE_SYMBOL: &str = "WSOL";
/// USD-denominated stablecoin every pivot is quoted against.
const STABLE_SYMBOL: &str = "USDC";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tick writer task: connect, subscribe, stream until something breaks,
/// then reconnect. Only a shutdown signal ends the loop.
pub async fn run_tick_writer(
    state: Arc<CoreState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut conn = storage::open(&state.config.tick_db_path)?;
    let rpc = RpcClient::new(state.config.solana_rpc_url.clone());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Tick writer stopping");
                return Ok(());
            }
            result = stream_prices(&state, &mut conn, &rpc) => {
                match result {
                    Ok(()) => warn!("Upstream websocket closed, reconnecting"),
                    Err(e) => error!("❌ Tick writer connection failed: {e:#}"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// One websocket connection's lifetime: subscribe to every descriptor and
/// process notifications until the stream ends or errors.
async fn stream_prices(state: &CoreState, conn: &mut Connection, rpc: &RpcClient) -> Result<()> {
    let programs: Vec<ProgramDescriptor> = state.registry.read().await.programs.clone();

    let (socket, _) = connect_async(state.config.solana_rpc_ws.as_str())
        .await
        .context("failed to connect to RPC websocket")?;
    info!("🔌 Connected to RPC websocket ({} pools)", programs.len());

    let (mut write, mut read) = socket.split();

    // Request id doubles as the descriptor index; the acknowledgement maps
    // the server-assigned subscription id back to it.
    for (idx, program) in programs.iter().enumerate() {
        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": idx,
            "method": "accountSubscribe",
            "params": [
                program.program_id,
                {"encoding": "jsonParsed", "commitment": "confirmed"},
            ],
        });
        write.send(Message::Text(subscribe.to_string())).await?;
    }

    let mut subscription_to_program: HashMap<u64, usize> = HashMap::new();
    let mut usd_prices: HashMap<String, f64> = HashMap::new();
    let mut pair_values: HashMap<String, f64> = HashMap::new();

    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: Value = serde_json::from_str(&text).context("malformed frame from upstream")?;

        if let (Some(id), Some(result)) = (frame.get("id"), frame.get("result")) {
            if let (Some(idx), Some(subscription)) = (id.as_u64(), result.as_u64()) {
                if (idx as usize) < programs.len() {
                    subscription_to_program.insert(subscription, idx as usize);
                }
            }
            continue;
        }

        let Some(params) = frame.get("params") else { continue };
        let Some(subscription) = params.get("subscription").and_then(Value::as_u64) else {
            continue;
        };
        let Some(&program_idx) = subscription_to_program.get(&subscription) else {
            continue;
        };
        let program = &programs[program_idx];

        // Acks and error frames carry non-array data; skip them.
        let Some(blob) = params
            .pointer("/result/value/data")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(Value::as_str)
        else {
            warn!("Skipping frame without account data: {text}");
            continue;
        };

        let account_data = match BASE64_STANDARD.decode(blob) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Account data for asset {} was not base64: {e}", program.asset_id);
                continue;
            }
        };

        let Some(price) = program.decode(&account_data, rpc).await else { continue };
        if !price.is_finite() || price <= 0.0 {
            warn!("Discarding out-of-range price {price} for asset {}", program.asset_id);
            continue;
        }

        update_usd_prices(program, price, &mut usd_prices);

        let new_pairs = synthesize_pairs(program, price, &pair_values);
        let updated = detect_changes(new_pairs, &mut pair_values);
        if updated.is_empty() {
            continue;
        }

        persist_ticks(state, conn, program, &updated, &pair_values).await?;
    }

    Ok(())
}

/// USD pivot bookkeeping. The map is writer-local and never persisted; it
/// exists so assets only quoted against the bridge still get a USD figure.
fn update_usd_prices(program: &ProgramDescriptor, price: f64, usd: &mut HashMap<String, f64>) {
    if program.symbol_b == STABLE_SYMBOL {
        usd.insert(program.symbol_a.clone(), price);
    } else if program.symbol_a == STABLE_SYMBOL {
        usd.insert(program.symbol_b.clone(), 1.0 / price);
    } else if let Some(&usd_a) = usd.get(&program.symbol_a) {
        // price is B per A, so a known USD value for A prices B at usd_a / p.
        usd.insert(program.symbol_b.clone(), usd_a / price);
    } else if let Some(&usd_b) = usd.get(&program.symbol_b) {
        usd.insert(program.symbol_a.clone(), usd_b * price);
    }
}

/// Resolve every pair the descriptor contributes to from this update.
///
/// Direct and inverse orientations come straight from the pool price; a
/// "X-USDC" pair with no direct quote is bridged through WSOL when both
/// legs are known. Direct pairs resolve first so a cross in the same update
/// sees this update's leg value.
fn synthesize_pairs(
    program: &ProgramDescriptor,
    price: f64,
    pair_values: &HashMap<String, f64>,
) -> Vec<(String, f64)> {
    let mut resolved: Vec<(String, f64)> = Vec::new();
    let mut crosses: Vec<&String> = Vec::new();

    for pair in &program.pairs {
        let Some((first, second)) = pair.split_once('-') else { continue };
        if first == program.symbol_a && second == program.symbol_b {
            resolved.push((pair.clone(), price));
        } else if first == program.symbol_b && second == program.symbol_a {
            resolved.push((pair.clone(), 1.0 / price));
        } else if second == STABLE_SYMBOL {
            crosses.push(pair);
        }
    }

    let bridge_pair = format!("{BRIDGE_SYMBOL}-{STABLE_SYMBOL}");
    for pair in crosses {
        let Some((first, _)) = pair.split_once('-') else { continue };
        let leg_pair = format!("{first}-{BRIDGE_SYMBOL}");
        let lookup = |key: &str| {
            resolved
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| *value)
                .or_else(|| pair_values.get(key).copied())
        };
        if let (Some(bridge), Some(leg)) = (lookup(&bridge_pair), lookup(&leg_pair)) {
            resolved.push((pair.clone(), leg * bridge));
        }
    }

    resolved
}

/// Exact-equality change detection against the writer's pair cache. Returns
/// the pairs whose value actually moved (or appeared), cache updated.
fn detect_changes(
    new_pairs: Vec<(String, f64)>,
    pair_values: &mut HashMap<String, f64>,
) -> Vec<String> {
    let mut updated = Vec::new();
    for (pair, price) in new_pairs {
        if pair_values.get(&pair) != Some(&price) {
            pair_values.insert(pair.clone(), price);
            updated.push(pair);
        }
    }
    updated
}

/// One transaction per inbound update covering every changed pair, then the
/// in-memory price store.
async fn persist_ticks(
    state: &CoreState,
    conn: &mut Connection,
    program: &ProgramDescriptor,
    updated: &[String],
    pair_values: &HashMap<String, f64>,
) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    let asset_id = program.asset_id.to_string();
    let valid_tables = state.registry.read().await.valid_tables.clone();

    {
        let tx = conn.transaction()?;
        for pair in updated {
            let Some(&price) = pair_values.get(pair) else { continue };
            let Some(table) = storage::tick_table(&valid_tables, &asset_id, pair) else {
                warn!("No tick table registered for {asset_id}/{pair}, dropping tick");
                continue;
            };
            storage::insert_tick(&tx, &table, pair, price, now_ms, TICK_SOURCE)?;
        }
        tx.commit()?;
    }

    for pair in updated {
        if let Some(&price) = pair_values.get(pair) {
            state.price_store.set(program.asset_id, pair, price).await;
            debug!("Tick {}/{pair} = {price}", program.asset_id);
        }
    }

    Ok(())
}

// HTTP read endpoints and the client websocket fan-out
//
// The read endpoints are thin selects over the two stores; every table name
// they assemble is gated against the registry before any SQL runs. The /ws
// endpoint runs two sub-tasks per connection (inbound subscription handling
// and the 100ms outbound diff loop); either one ending tears the whole
// connection down.

use std::collections::{HashMap, HashSet};
use std::path::Path as FilePath;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::candles;
use crate::price_store::CoreState;
use crate::programs::flat_pair;
use crate::storage;

/// Outbound cadence for every client connection.
const CLIENT_TICK: Duration = Duration::from_millis(100);
/// Default /historical_prices window: the last six hours.
const DEFAULT_WINDOW_S: i64 = 60 * 60 * 6;
/// Largest allowed /historical_prices span.
const MAX_RANGE_S: i64 = 60 * 60 * 24 * 30;

pub fn router(state: Arc<CoreState>) -> Router {
    Router::new()
        .route("/assets", get(get_assets))
        .route("/historical_prices/:asset_id/:pair", get(get_historical_prices))
        .route("/prices/:asset_id/:pair", get(get_prices))
        .route("/metadata/:asset_id/:pair", get(get_metadata))
        .route("/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn invalid_pair(endpoint: &str) -> Json<Value> {
    Json(json!({"error": "Invalid pair", "endpoint": endpoint}))
}

fn storage_error(endpoint: &str, error: anyhow::Error) -> Json<Value> {
    warn!("❌ Storage failure on {endpoint}: {error:#}");
    Json(json!({"error": "Storage unavailable", "endpoint": endpoint}))
}

async fn get_assets(State(state): State<Arc<CoreState>>) -> Json<Value> {
    let registry = state.registry.read().await;
    Json(serde_json::to_value(&registry.programs).unwrap_or_else(|_| json!([])))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: Option<i64>,
    to: Option<i64>,
    timeframe: Option<i64>,
}

/// Normalize a seconds range: fill defaults, swap inverted bounds.
fn normalize_range(from: Option<i64>, to: Option<i64>, now_s: i64) -> (i64, i64) {
    let from_s = from.unwrap_or(now_s - DEFAULT_WINDOW_S);
    let to_s = to.unwrap_or(now_s);
    if from_s > to_s {
        (to_s, from_s)
    } else {
        (from_s, to_s)
    }
}

async fn get_historical_prices(
    State(state): State<Arc<CoreState>>,
    Path((asset_id, pair)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let valid_tables = state.registry.read().await.valid_tables.clone();
    let Some(table) = storage::historical_table(&valid_tables, &asset_id, &pair) else {
        return invalid_pair("/historical_prices");
    };

    let (from_s, to_s) = normalize_range(query.from, query.to, Utc::now().timestamp());
    if to_s - from_s > MAX_RANGE_S {
        return Json(json!({"error": "Time range too large", "endpoint": "/historical_prices"}));
    }

    let rows = match (|| {
        let conn = storage::open(&state.config.historical_db_path)?;
        storage::candles_in_range(&conn, &table, from_s * 1000, to_s * 1000)
    })() {
        Ok(rows) => rows,
        Err(e) => return storage_error("/historical_prices", e),
    };

    let timeframe = query.timeframe.unwrap_or(1);
    let rows = if timeframe > 1 {
        candles::resample(&rows, timeframe)
    } else {
        rows
    };

    let out: Vec<Value> = rows
        .iter()
        .map(|candle| {
            json!([candle.open, candle.high, candle.low, candle.close, candle.timestamp / 1000])
        })
        .collect();
    Json(Value::Array(out))
}

async fn get_prices(
    State(state): State<Arc<CoreState>>,
    Path((asset_id, pair)): Path<(String, String)>,
) -> Json<Value> {
    let valid_tables = state.registry.read().await.valid_tables.clone();
    let Some(table) = storage::tick_table(&valid_tables, &asset_id, &pair) else {
        return invalid_pair("/prices");
    };

    let rows = match (|| {
        let conn = storage::open(&state.config.tick_db_path)?;
        storage::ticks_newest_first(&conn, &table)
    })() {
        Ok(rows) => rows,
        Err(e) => return storage_error("/prices", e),
    };

    let out: Vec<Value> = rows
        .iter()
        .map(|row| json!([row.pair, row.price, row.timestamp, row.source]))
        .collect();
    Json(Value::Array(out))
}

async fn get_metadata(
    State(state): State<Arc<CoreState>>,
    Path((asset_id, pair)): Path<(String, String)>,
) -> Json<Value> {
    let valid_tables = state.registry.read().await.valid_tables.clone();
    if storage::metadata_table(&valid_tables, &asset_id, &pair).is_none() {
        return invalid_pair("/metadata");
    }
    let Some(table) = storage::tick_table(&valid_tables, &asset_id, &pair) else {
        return invalid_pair("/metadata");
    };

    let latest = match (|| {
        let conn = storage::open(&state.config.tick_db_path)?;
        storage::latest_tick(&conn, &table)
    })() {
        Ok(latest) => latest,
        Err(e) => return storage_error("/metadata", e),
    };

    // The latest tick can be gone entirely if aggregation just pruned the
    // table; answer with a null price rather than an error.
    match latest {
        Some(tick) => Json(json!({
            "pair": tick.pair,
            "blockchain": tick.source,
            "price": tick.price,
        })),
        None => Json(json!({"pair": pair, "blockchain": "solana", "price": null})),
    }
}

async fn ws_handler(
    State(state): State<Arc<CoreState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: Arc<CoreState>) {
    info!("🔗 Client connected");
    if let Err(e) = client_session(socket, state).await {
        debug!("Client session ended: {e:#}");
    }
    info!("Client disconnected");
}

async fn client_session(mut socket: WebSocket, state: Arc<CoreState>) -> Result<()> {
    // Per-client diff state: every registered pair starts unseen, so the
    // first observed price always diffs (the descriptor-nonce semantics).
    let mut user_state: HashMap<i64, HashMap<String, Option<f64>>> = HashMap::new();
    let mut initial: HashMap<i64, HashMap<String, Option<f64>>> = HashMap::new();
    {
        let registry = state.registry.read().await;
        let snapshot = state.price_store.snapshot().await;
        for program in &registry.programs {
            let seen = user_state.entry(program.asset_id).or_default();
            let known = initial.entry(program.asset_id).or_default();
            for pair in &program.pairs {
                seen.insert(pair.clone(), None);
                let price = snapshot
                    .get(&program.asset_id)
                    .and_then(|pairs| pairs.get(pair))
                    .copied();
                known.insert(pair.clone(), price);
            }
        }
    }

    socket
        .send(Message::Text(
            json!({"type": "prices", "data": initial}).to_string(),
        ))
        .await?;

    let subscribed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let (sender, receiver) = socket.split();

    let mut recv_task = tokio::spawn(handle_subscriptions(receiver, subscribed.clone()));
    let mut send_task = tokio::spawn(push_updates(sender, state, subscribed, user_state));

    // Either sub-task finishing (disconnect, protocol failure, storage
    // failure) tears the other down.
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }

    Ok(())
}

/// Inbound sub-task: maintain the per-connection subscription set. Unknown
/// message types are ignored; a disconnect ends the task.
async fn handle_subscriptions(
    mut receiver: SplitStream<WebSocket>,
    subscribed: Arc<Mutex<HashSet<String>>>,
) {
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
        let Some(kind) = frame.get("type").and_then(Value::as_str) else { continue };
        let Some(asset) = frame.get("asset_id").and_then(Value::as_str) else { continue };

        let composite = asset.replace('-', "_");
        match kind {
            "subscribe_bars" => {
                subscribed.lock().await.insert(composite);
            }
            "unsubscribe_bars" => {
                subscribed.lock().await.remove(&composite);
            }
            _ => {}
        }
    }
}

/// Outbound sub-task: every 100ms, diff the price store against what this
/// client has seen, push live-forming bars for subscribed assets that just
/// moved, then push the price diff.
async fn push_updates(
    mut sender: SplitSink<WebSocket, Message>,
    state: Arc<CoreState>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    mut user_state: HashMap<i64, HashMap<String, Option<f64>>>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(CLIENT_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let snapshot = state.price_store.snapshot().await;
        let mut diff: HashMap<i64, HashMap<String, f64>> = HashMap::new();
        let mut changed: HashSet<String> = HashSet::new();

        for (asset_id, pairs) in &snapshot {
            for (pair, &price) in pairs {
                let seen = user_state
                    .entry(*asset_id)
                    .or_default()
                    .entry(pair.clone())
                    .or_insert(None);
                if *seen != Some(price) {
                    *seen = Some(price);
                    diff.entry(*asset_id).or_default().insert(pair.clone(), price);
                    changed.insert(format!("{asset_id}_{}", flat_pair(pair)));
                }
            }
        }

        let wanted: Vec<String> = {
            let set = subscribed.lock().await;
            set.intersection(&changed).cloned().collect()
        };
        for composite in wanted {
            let table = format!("prices_{composite}");
            let registered = state.registry.read().await.valid_tables.contains(&table);
            if !registered {
                subscribed.lock().await.remove(&composite);
                continue;
            }

            let bucket_start_s = Utc::now().timestamp() / 60 * 60;
            let bar = load_live_bar(&state.config.tick_db_path, &table, bucket_start_s)?;
            if let Some(bar) = bar {
                sender
                    .send(Message::Text(
                        json!({
                            "type": "bars",
                            "data": {
                                "asset": composite,
                                "bar": bar,
                                "timestamp": bucket_start_s,
                            },
                        })
                        .to_string(),
                    ))
                    .await?;
            }
        }

        if !diff.is_empty() {
            sender
                .send(Message::Text(json!({"type": "prices", "data": diff}).to_string()))
                .await?;
        }
    }
}

/// OHLC of the currently forming minute, from a short-lived connection.
fn load_live_bar(db_path: &FilePath, table: &str, bucket_start_s: i64) -> Result<Option<[f64; 4]>> {
    let conn = storage::open(db_path)?;
    let rows = storage::ticks_in_range(
        &conn,
        table,
        bucket_start_s * 1000,
        (bucket_start_s + 60) * 1000,
    )?;
    Ok(candles::fold_live_bar(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_range_defaults() {
        let now = 1_700_000_000;
        let (from, to) = normalize_range(None, None, now);
        assert_eq!(to, now);
        assert_eq!(from, now - DEFAULT_WINDOW_S);
    }

    #[test]
    fn test_normalize_range_swaps_inverted_bounds() {
        let (from, to) = normalize_range(Some(2_000), Some(1_000), 5_000);
        assert_eq!((from, to), (1_000, 2_000));
    }

    #[test]
    fn test_range_cap_uses_magnitude() {
        // Inverted bounds spanning more than 30 days still trip the cap
        // after the swap.
        let span = MAX_RANGE_S + 1;
        let (from, to) = normalize_range(Some(span), Some(0), span + 10);
        assert!(to - from > MAX_RANGE_S);

        let (from, to) = normalize_range(Some(0), Some(MAX_RANGE_S), MAX_RANGE_S);
        assert!(to - from <= MAX_RANGE_S);
    }

    #[test]
    fn test_invalid_pair_envelope() {
        let Json(value) = invalid_pair("/prices");
        assert_eq!(value["error"], "Invalid pair");
        assert_eq!(value["endpoint"], "/prices");
    }
}

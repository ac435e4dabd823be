// 1-minute OHLC aggregation over persisted ticks
//
// The aggregator runs once a second but only does work when the wall-clock
// minute bucket advances. Finalization stays two buckets behind the current
// one so the live-candle path in the fan-out never races the finalizer on
// the same window. Merging a re-aggregated bucket into a stored candle is
// idempotent: stored open wins, fresh close wins, extrema combine.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::price_store::CoreState;
use crate::storage::{self, TickRow};

/// Width of the persisted candle bucket.
pub const BUCKET_MS: i64 = 60_000;

/// One OHLC bucket. `timestamp` is the bucket start in epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub pair: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp: i64,
}

impl Candle {
    fn from_tick(tick: &TickRow, bucket: i64) -> Self {
        Self {
            pair: tick.pair.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            timestamp: bucket,
        }
    }

    fn absorb(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    /// Merge this freshly folded candle into a previously stored one for the
    /// same bucket: the stored open stands, this candle's close wins, and
    /// the extrema combine.
    pub fn merged_into(mut self, stored: &Candle) -> Candle {
        self.open = stored.open;
        self.high = self.high.max(stored.high);
        self.low = self.low.min(stored.low);
        self
    }
}

/// Minute-bucket index for an epoch-ms timestamp.
pub fn bucket_index(now_ms: i64) -> i64 {
    now_ms / BUCKET_MS
}

/// Fold tick rows (ascending by timestamp) into one candle per bucket.
pub fn fold_ticks(rows: &[TickRow]) -> BTreeMap<i64, Candle> {
    let mut buckets = BTreeMap::new();
    for row in rows {
        let bucket = row.timestamp - row.timestamp.rem_euclid(BUCKET_MS);
        match buckets.entry(bucket) {
            Entry::Vacant(slot) => {
                slot.insert(Candle::from_tick(row, bucket));
            }
            Entry::Occupied(mut slot) => slot.get_mut().absorb(row.price),
        }
    }
    buckets
}

/// Re-bucket 1-minute candles (ascending) into a coarser timeframe given in
/// minutes. Open comes from the first candle of each group, close from the
/// last, extrema combine; the group timestamp is the coarse bucket start.
pub fn resample(candles: &[Candle], timeframe_minutes: i64) -> Vec<Candle> {
    let span = timeframe_minutes * BUCKET_MS;
    let mut grouped: BTreeMap<i64, Candle> = BTreeMap::new();
    for candle in candles {
        let bucket = candle.timestamp - candle.timestamp.rem_euclid(span);
        match grouped.entry(bucket) {
            Entry::Vacant(slot) => {
                let mut group = candle.clone();
                group.timestamp = bucket;
                slot.insert(group);
            }
            Entry::Occupied(mut slot) => {
                let group = slot.get_mut();
                group.high = group.high.max(candle.high);
                group.low = group.low.min(candle.low);
                group.close = candle.close;
            }
        }
    }
    grouped.into_values().collect()
}

/// Collapse the current minute's ticks into a live-forming [open, high,
/// low, close] bar. `None` when the minute has no ticks yet.
pub fn fold_live_bar(rows: &[TickRow]) -> Option<[f64; 4]> {
    let mut iter = rows.iter();
    let first = iter.next()?;
    let mut bar = [first.price; 4];
    for row in iter {
        bar[1] = bar[1].max(row.price);
        bar[2] = bar[2].min(row.price);
        bar[3] = row.price;
    }
    Some(bar)
}

/// Candle aggregation task: hot-reloads the registry every second and folds
/// finished tick buckets into the historical store once per minute.
pub async fn run_aggregator(
    state: Arc<CoreState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticks_conn = storage::open(&state.config.tick_db_path)?;
    let mut historical_conn = storage::open(&state.config.historical_db_path)?;
    let mut last_bucket = bucket_index(Utc::now().timestamp_millis());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Candle aggregator stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        reload_registry(&state, &mut ticks_conn, &mut historical_conn).await;

        let current_bucket = bucket_index(Utc::now().timestamp_millis());
        if current_bucket <= last_bucket {
            continue;
        }
        last_bucket = current_bucket;

        // Only buckets at least two behind the current are final; the
        // in-flight bucket and the one before it stay with the live path.
        let cutoff = (current_bucket - 1) * BUCKET_MS;

        let tables = match storage::tick_tables(&ticks_conn) {
            Ok(tables) => tables,
            Err(e) => {
                error!("❌ Failed to enumerate tick tables: {e:#}");
                continue;
            }
        };

        for table in tables {
            if let Err(e) = aggregate_table(&mut ticks_conn, &mut historical_conn, &table, cutoff) {
                error!("❌ Aggregation failed for {table}: {e:#}");
            }
        }
    }
}

async fn reload_registry(state: &CoreState, ticks: &mut Connection, historical: &mut Connection) {
    let mut registry = state.registry.write().await;
    match registry.reload_if_changed() {
        Ok(true) => {
            if let Err(e) = storage::ensure_tables(ticks, historical, &registry) {
                error!("❌ Failed to create tables after registry reload: {e:#}");
            }
        }
        Ok(false) => {}
        Err(e) => error!("❌ Registry reload failed: {e:#}"),
    }
}

/// Fold one tick table's finished buckets into its historical table, then
/// prune the aggregated ticks. Historical and tick stores commit
/// independently; a crash in between re-aggregates idempotently.
pub(crate) fn aggregate_table(
    ticks: &mut Connection,
    historical: &mut Connection,
    table: &str,
    cutoff: i64,
) -> Result<()> {
    let rows = storage::ticks_before(ticks, table, cutoff)?;
    if rows.is_empty() {
        return Ok(());
    }

    let historical_table = format!("historical_{table}");
    let buckets = fold_ticks(&rows);
    let bucket_count = buckets.len();

    let tx = historical.transaction()?;
    for candle in buckets.into_values() {
        storage::upsert_candle(&tx, &historical_table, candle)?;
    }
    tx.commit()?;

    let tx = ticks.transaction()?;
    let pruned = storage::delete_ticks_before(&tx, table, cutoff)?;
    tx.commit()?;

    debug!("Folded {} ticks into {bucket_count} candles for {table} (pruned {pruned})", rows.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(pair: &str, price: f64, timestamp: i64) -> TickRow {
        TickRow {
            pair: pair.to_string(),
            price,
            timestamp,
            source: "solana".to_string(),
        }
    }

    #[test]
    fn test_fold_single_bucket() {
        // Prices 1,3,2,4 across one minute: open 1, high 4, low 1, close 4.
        let rows = vec![
            tick("P-Q", 1.0, 0),
            tick("P-Q", 3.0, 15_000),
            tick("P-Q", 2.0, 30_000),
            tick("P-Q", 4.0, 59_000),
        ];
        let buckets = fold_ticks(&rows);
        assert_eq!(buckets.len(), 1);

        let candle = &buckets[&0];
        assert_eq!(candle.open, 1.0);
        assert_eq!(candle.high, 4.0);
        assert_eq!(candle.low, 1.0);
        assert_eq!(candle.close, 4.0);
        assert_eq!(candle.timestamp, 0);
    }

    #[test]
    fn test_fold_splits_buckets() {
        let rows = vec![
            tick("P-Q", 1.0, 59_999),
            tick("P-Q", 9.0, 60_000),
            tick("P-Q", 5.0, 119_999),
        ];
        let buckets = fold_ticks(&rows);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&0].close, 1.0);
        assert_eq!(buckets[&60_000].open, 9.0);
        assert_eq!(buckets[&60_000].close, 5.0);
    }

    #[test]
    fn test_candle_invariants() {
        let rows = vec![
            tick("P-Q", 3.0, 0),
            tick("P-Q", 1.0, 1_000),
            tick("P-Q", 7.0, 2_000),
            tick("P-Q", 2.0, 3_000),
        ];
        let candle = fold_ticks(&rows).remove(&0).unwrap();
        assert!(candle.low <= candle.open.min(candle.close));
        assert!(candle.high >= candle.open.max(candle.close));
        assert!(candle.low <= candle.high);
    }

    #[test]
    fn test_merge_associativity() {
        // Aggregating in two passes equals aggregating all ticks at once.
        let first: Vec<TickRow> = vec![tick("P-Q", 1.0, 0), tick("P-Q", 3.0, 10_000)];
        let second: Vec<TickRow> = vec![tick("P-Q", 2.0, 20_000), tick("P-Q", 4.0, 30_000)];
        let all: Vec<TickRow> = first.iter().chain(second.iter()).cloned().collect();

        let stored = fold_ticks(&first).remove(&0).unwrap();
        let fresh = fold_ticks(&second).remove(&0).unwrap();
        let merged = fresh.merged_into(&stored);

        let direct = fold_ticks(&all).remove(&0).unwrap();
        assert_eq!(merged, direct);
    }

    #[test]
    fn test_merge_is_idempotent_for_replays() {
        // Re-merging the same fold over the stored result must change
        // nothing, so a crash between the two commits is recoverable.
        let rows = vec![tick("P-Q", 2.0, 0), tick("P-Q", 5.0, 1_000)];
        let stored = fold_ticks(&rows).remove(&0).unwrap();
        let replay = fold_ticks(&rows).remove(&0).unwrap();

        let merged = replay.merged_into(&stored);
        assert_eq!(merged, stored);
    }

    #[test]
    fn test_resample_five_minutes() {
        // Five 1-minute candles in one 5-minute window collapse to one
        // candle holding the extrema of the five.
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                pair: "P-Q".to_string(),
                open: 10.0 + i as f64,
                high: 20.0 + i as f64,
                low: 5.0 - i as f64,
                close: 11.0 + i as f64,
                timestamp: i * BUCKET_MS,
            })
            .collect();

        let out = resample(&candles, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open, 10.0);
        assert_eq!(out[0].close, 15.0);
        assert_eq!(out[0].high, 24.0);
        assert_eq!(out[0].low, 1.0);
        assert_eq!(out[0].timestamp, 0);
    }

    #[test]
    fn test_resample_passthrough_groups() {
        let candles: Vec<Candle> = (0..6)
            .map(|i| Candle {
                pair: "P-Q".to_string(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                timestamp: i * BUCKET_MS,
            })
            .collect();

        let out = resample(&candles, 5);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 0);
        assert_eq!(out[1].timestamp, 5 * BUCKET_MS);
    }

    #[test]
    fn test_live_bar_grows_with_ticks() {
        let mut rows = vec![tick("P-Q", 2.0, 0)];
        assert_eq!(fold_live_bar(&rows), Some([2.0, 2.0, 2.0, 2.0]));

        rows.push(tick("P-Q", 5.0, 1_000));
        rows.push(tick("P-Q", 1.0, 2_000));
        assert_eq!(fold_live_bar(&rows), Some([2.0, 5.0, 1.0, 1.0]));

        assert_eq!(fold_live_bar(&[]), None);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(59_999), 0);
        assert_eq!(bucket_index(60_000), 1);
        assert_eq!(bucket_index(120_001), 2);
    }
}

// SQLite persistence for tick and candle history
//
// Two database files: prices.db holds one tick table per registered
// (asset, pair), prices_historical.db the matching 1-minute candle tables.
// Table names are derived from registry entries only, and every dynamically
// assembled name goes through the checked helpers below before it reaches
// SQL; that check is the sole defence against table-name injection from
// the external interface.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

use crate::candles::Candle;
use crate::programs::{flat_pair, ProgramRegistry};

pub const TICK_SOURCE: &str = "solana";

/// One persisted tick row.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRow {
    pub pair: String,
    pub price: f64,
    pub timestamp: i64,
    pub source: String,
}

pub fn open(path: &Path) -> Result<Connection> {
    Connection::open(path).with_context(|| format!("failed to open database {}", path.display()))
}

fn checked(valid_tables: &HashSet<String>, name: String) -> Option<String> {
    valid_tables.contains(&name).then_some(name)
}

/// `prices_<asset>_<flat_pair>`, gated against the registry's valid set.
pub fn tick_table(valid_tables: &HashSet<String>, asset_id: &str, pair: &str) -> Option<String> {
    checked(valid_tables, format!("prices_{asset_id}_{}", flat_pair(pair)))
}

/// `historical_prices_<asset>_<flat_pair>`, gated like [`tick_table`].
pub fn historical_table(
    valid_tables: &HashSet<String>,
    asset_id: &str,
    pair: &str,
) -> Option<String> {
    checked(
        valid_tables,
        format!("historical_prices_{asset_id}_{}", flat_pair(pair)),
    )
}

/// `metadata_<asset>_<flat_pair>`, gated like [`tick_table`].
pub fn metadata_table(valid_tables: &HashSet<String>, asset_id: &str, pair: &str) -> Option<String> {
    checked(valid_tables, format!("metadata_{asset_id}_{}", flat_pair(pair)))
}

/// Create the tick and candle tables for every registered pair. Safe to
/// re-run; creation is IF NOT EXISTS throughout.
pub fn ensure_tables(
    ticks: &Connection,
    historical: &Connection,
    registry: &ProgramRegistry,
) -> Result<()> {
    for program in &registry.programs {
        for pair in &program.pairs {
            let id = program.asset_id;
            let flat = flat_pair(pair);
            ticks
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS prices_{id}_{flat} \
                     (pair TEXT, price REAL, timestamp INTEGER, source CHAR(16)); \
                     CREATE INDEX IF NOT EXISTS idx_timestamp_{id}_{flat} \
                     ON prices_{id}_{flat}(timestamp);"
                ))
                .with_context(|| format!("failed to create tick table for {id}/{pair}"))?;
            historical
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS historical_prices_{id}_{flat} \
                     (pair TEXT, high REAL, low REAL, open REAL, close REAL, timestamp INTEGER); \
                     CREATE INDEX IF NOT EXISTS idx_timestamp_{id}_{flat} \
                     ON historical_prices_{id}_{flat}(timestamp);"
                ))
                .with_context(|| format!("failed to create candle table for {id}/{pair}"))?;
        }
    }
    Ok(())
}

pub fn insert_tick(
    conn: &Connection,
    table: &str,
    pair: &str,
    price: f64,
    timestamp: i64,
    source: &str,
) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO {table} (pair, price, timestamp, source) VALUES (?1, ?2, ?3, ?4)"),
        params![pair, price, timestamp, source],
    )?;
    Ok(())
}

fn tick_rows(conn: &Connection, sql: &str, bounds: &[i64]) -> Result<Vec<TickRow>> {
    let mut statement = conn.prepare(sql)?;
    let params = rusqlite::params_from_iter(bounds.iter());
    let rows = statement
        .query_map(params, |row| {
            Ok(TickRow {
                pair: row.get(0)?,
                price: row.get(1)?,
                timestamp: row.get(2)?,
                source: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ticks strictly older than `cutoff`, ascending. The aggregator's input.
pub fn ticks_before(conn: &Connection, table: &str, cutoff: i64) -> Result<Vec<TickRow>> {
    tick_rows(
        conn,
        &format!(
            "SELECT pair, price, timestamp, source FROM {table} \
             WHERE timestamp < ?1 ORDER BY timestamp ASC"
        ),
        &[cutoff],
    )
}

/// Ticks in `[start, end)`, ascending. The live-candle window.
pub fn ticks_in_range(conn: &Connection, table: &str, start: i64, end: i64) -> Result<Vec<TickRow>> {
    tick_rows(
        conn,
        &format!(
            "SELECT pair, price, timestamp, source FROM {table} \
             WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC"
        ),
        &[start, end],
    )
}

/// Every tick, newest first, for the /prices read-back.
pub fn ticks_newest_first(conn: &Connection, table: &str) -> Result<Vec<TickRow>> {
    tick_rows(
        conn,
        &format!("SELECT pair, price, timestamp, source FROM {table} ORDER BY timestamp DESC"),
        &[],
    )
}

pub fn latest_tick(conn: &Connection, table: &str) -> Result<Option<TickRow>> {
    Ok(tick_rows(
        conn,
        &format!(
            "SELECT pair, price, timestamp, source FROM {table} \
             ORDER BY timestamp DESC LIMIT 1"
        ),
        &[],
    )?
    .into_iter()
    .next())
}

pub fn delete_ticks_before(conn: &Connection, table: &str, cutoff: i64) -> Result<usize> {
    let deleted = conn.execute(
        &format!("DELETE FROM {table} WHERE timestamp < ?1"),
        params![cutoff],
    )?;
    Ok(deleted)
}

/// Names of every tick table present in the store.
pub fn tick_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut statement =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'prices\\_%' ESCAPE '\\'")?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

pub fn candle_at(conn: &Connection, table: &str, timestamp: i64) -> Result<Option<Candle>> {
    let mut statement = conn.prepare(&format!(
        "SELECT pair, high, low, open, close, timestamp FROM {table} WHERE timestamp = ?1"
    ))?;
    let candle = statement
        .query_row(params![timestamp], |row| {
            Ok(Candle {
                pair: row.get(0)?,
                high: row.get(1)?,
                low: row.get(2)?,
                open: row.get(3)?,
                close: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })
        .optional()?;
    Ok(candle)
}

/// Insert a candle, or merge into the stored one at the same bucket: the
/// stored open stands, the new close wins, extrema combine. Exactly one row
/// per (table, timestamp) comes out of this path.
pub fn upsert_candle(conn: &Connection, table: &str, candle: Candle) -> Result<()> {
    match candle_at(conn, table, candle.timestamp)? {
        Some(stored) => {
            let merged = candle.merged_into(&stored);
            conn.execute(
                &format!(
                    "UPDATE {table} SET high = ?1, low = ?2, open = ?3, close = ?4 \
                     WHERE timestamp = ?5"
                ),
                params![merged.high, merged.low, merged.open, merged.close, merged.timestamp],
            )?;
        }
        None => {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (pair, high, low, open, close, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    candle.pair,
                    candle.high,
                    candle.low,
                    candle.open,
                    candle.close,
                    candle.timestamp
                ],
            )?;
        }
    }
    Ok(())
}

/// Candles with `from < timestamp < to` (epoch ms), ascending.
pub fn candles_in_range(conn: &Connection, table: &str, from: i64, to: i64) -> Result<Vec<Candle>> {
    let mut statement = conn.prepare(&format!(
        "SELECT pair, high, low, open, close, timestamp FROM {table} \
         WHERE timestamp > ?1 AND timestamp < ?2 ORDER BY timestamp ASC"
    ))?;
    let candles = statement
        .query_map(params![from, to], |row| {
            Ok(Candle {
                pair: row.get(0)?,
                high: row.get(1)?,
                low: row.get(2)?,
                open: row.get(3)?,
                close: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(candles)
}

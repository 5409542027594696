//! SQLite persistence for engine state.
//!
//! Persists what must survive a restart:
//! - Per-pool balance checkpoints
//! - Closed-trade history (the source of lifetime metrics)
//! - Append-only activity log of engine events
//!
//! Positions are deliberately not persisted; a restart folds any reserved
//! funds back into the pool and starts flat.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::ClosedTrade;
use crate::strategy::StrategyKind;

/// One pool's balance state as of the last save.
#[derive(Debug, Clone)]
pub struct PoolCheckpoint {
    pub strategy: StrategyKind,
    pub initial_balance: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub epoch: u64,
    pub last_saved: DateTime<Utc>,
}

/// A row from the activity log.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub strategy: Option<String>,
    pub symbol: Option<String>,
    pub event: String,
    pub detail: String,
}

/// Lifetime trade statistics for one strategy, aggregated from the
/// closed-trade table.
#[derive(Debug, Clone)]
pub struct StrategyLifetime {
    pub strategy: String,
    pub trades: u64,
    pub wins: u64,
    pub realized_pnl: Decimal,
}

/// SQLite-backed store. The connection sits behind a mutex so the store can
/// be shared with command handlers; every call locks, runs its statements,
/// and releases before anything awaits.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        Self::init_schema(&conn)?;
        info!("State store initialized at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Per-pool balance checkpoints (one row per strategy)
            CREATE TABLE IF NOT EXISTS pool_checkpoints (
                strategy TEXT PRIMARY KEY,
                initial_balance TEXT NOT NULL,
                available TEXT NOT NULL,
                reserved TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                last_saved TEXT NOT NULL
            );

            -- Closed trades
            CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                closed_at TEXT NOT NULL,
                strategy TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                invested TEXT NOT NULL,
                proceeds TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                pnl_pct TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON closed_trades(closed_at);
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON closed_trades(strategy);

            -- Append-only engine event log
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                strategy TEXT,
                symbol TEXT,
                event TEXT NOT NULL,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned"))
    }

    /// Upsert every pool's checkpoint in one transaction.
    pub fn save_checkpoints(&self, checkpoints: &[PoolCheckpoint]) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        for cp in checkpoints {
            tx.execute(
                r#"
                INSERT INTO pool_checkpoints (strategy, initial_balance, available, reserved, epoch, last_saved)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(strategy) DO UPDATE SET
                    initial_balance = ?2,
                    available = ?3,
                    reserved = ?4,
                    epoch = ?5,
                    last_saved = ?6
                "#,
                params![
                    cp.strategy.as_str(),
                    cp.initial_balance.to_string(),
                    cp.available.to_string(),
                    cp.reserved.to_string(),
                    cp.epoch,
                    cp.last_saved.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        debug!(pools = checkpoints.len(), "Checkpoints saved");
        Ok(())
    }

    /// Load all saved checkpoints. Rows whose strategy name no longer parses
    /// are skipped with a warning.
    pub fn load_checkpoints(&self) -> Result<HashMap<StrategyKind, PoolCheckpoint>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT strategy, initial_balance, available, reserved, epoch, last_saved
            FROM pool_checkpoints
            "#,
        )?;

        let checkpoints: HashMap<StrategyKind, PoolCheckpoint> = stmt
            .query_map([], |row| {
                let strategy: String = row.get(0)?;
                let initial_balance: String = row.get(1)?;
                let available: String = row.get(2)?;
                let reserved: String = row.get(3)?;
                let epoch: u64 = row.get(4)?;
                let last_saved: String = row.get(5)?;
                Ok((strategy, initial_balance, available, reserved, epoch, last_saved))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(strategy, initial, available, reserved, epoch, saved)| {
                let Ok(kind) = strategy.parse::<StrategyKind>() else {
                    warn!(strategy = %strategy, "Skipping checkpoint for unknown strategy");
                    return None;
                };
                Some((
                    kind,
                    PoolCheckpoint {
                        strategy: kind,
                        initial_balance: Decimal::from_str(&initial).unwrap_or_default(),
                        available: Decimal::from_str(&available).unwrap_or_default(),
                        reserved: Decimal::from_str(&reserved).unwrap_or_default(),
                        epoch,
                        last_saved: DateTime::parse_from_rfc3339(&saved)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    },
                ))
            })
            .collect();

        if !checkpoints.is_empty() {
            info!(pools = checkpoints.len(), "Loaded pool checkpoints");
        }
        Ok(checkpoints)
    }

    /// Append a settled trade to the history.
    pub fn record_closed_trade(&self, trade: &ClosedTrade) -> Result<()> {
        self.lock()?.execute(
            r#"
            INSERT INTO closed_trades (closed_at, strategy, symbol, quantity, entry_price,
                                       exit_price, invested, proceeds, realized_pnl, pnl_pct, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                trade.closed_at.to_rfc3339(),
                trade.strategy.as_str(),
                trade.symbol,
                trade.quantity.to_string(),
                trade.entry_price.to_string(),
                trade.exit_price.to_string(),
                trade.invested.to_string(),
                trade.proceeds.to_string(),
                trade.realized_pnl.to_string(),
                trade.pnl_pct.to_string(),
                trade.reason.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Lifetime per-strategy totals from the closed-trade table.
    pub fn lifetime_stats(&self) -> Result<Vec<StrategyLifetime>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT strategy,
                   COUNT(*) as trades,
                   SUM(CASE WHEN CAST(realized_pnl AS REAL) > 0 THEN 1 ELSE 0 END) as wins,
                   SUM(CAST(realized_pnl AS REAL)) as total_pnl
            FROM closed_trades
            GROUP BY strategy
            ORDER BY strategy
            "#,
        )?;

        let stats: Vec<StrategyLifetime> = stmt
            .query_map([], |row| {
                let strategy: String = row.get(0)?;
                let trades: u64 = row.get(1)?;
                let wins: u64 = row.get(2)?;
                let total: f64 = row.get(3)?;
                Ok(StrategyLifetime {
                    strategy,
                    trades,
                    wins,
                    realized_pnl: Decimal::from_f64_retain(total).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(stats)
    }

    /// Most recent closed trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<(DateTime<Utc>, String, String, Decimal, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT closed_at, strategy, symbol, realized_pnl, reason
            FROM closed_trades
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let trades: Vec<(DateTime<Utc>, String, String, Decimal, String)> = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let strategy: String = row.get(1)?;
                let symbol: String = row.get(2)?;
                let pnl: String = row.get(3)?;
                let reason: String = row.get(4)?;
                Ok((
                    DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    strategy,
                    symbol,
                    Decimal::from_str(&pnl).unwrap_or_default(),
                    reason,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(trades)
    }

    /// Append one event to the activity log.
    pub fn log_event(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
        event: &str,
        detail: &str,
    ) -> Result<()> {
        self.lock()?.execute(
            r#"
            INSERT INTO activity_log (timestamp, strategy, symbol, event, detail)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![Utc::now().to_rfc3339(), strategy, symbol, event, detail],
        )?;
        Ok(())
    }

    /// Most recent activity, newest first.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, strategy, symbol, event, detail
            FROM activity_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries: Vec<ActivityEntry> = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                Ok(ActivityEntry {
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    strategy: row.get(1)?,
                    symbol: row.get(2)?,
                    event: row.get(3)?,
                    detail: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.lock()?.execute_batch(
            r#"
            DELETE FROM pool_checkpoints;
            DELETE FROM closed_trades;
            DELETE FROM activity_log;
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CloseReason;
    use rust_decimal_macros::dec;

    fn trade(strategy: StrategyKind, symbol: &str, pnl: Decimal) -> ClosedTrade {
        ClosedTrade {
            position_id: 1,
            symbol: symbol.to_string(),
            strategy,
            quantity: dec!(0.38),
            entry_price: dec!(100),
            exit_price: dec!(110),
            invested: dec!(38),
            proceeds: dec!(38) + pnl,
            realized_pnl: pnl,
            pnl_pct: dec!(10),
            reason: CloseReason::TrailingStop,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_checkpoints() {
        let store = StateStore::new(":memory:").unwrap();

        let checkpoints = vec![
            PoolCheckpoint {
                strategy: StrategyKind::Surge,
                initial_balance: dec!(100),
                available: dec!(62),
                reserved: dec!(38),
                epoch: 2,
                last_saved: Utc::now(),
            },
            PoolCheckpoint {
                strategy: StrategyKind::Rebound,
                initial_balance: dec!(100),
                available: dec!(100),
                reserved: Decimal::ZERO,
                epoch: 0,
                last_saved: Utc::now(),
            },
        ];
        store.save_checkpoints(&checkpoints).unwrap();

        let loaded = store.load_checkpoints().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&StrategyKind::Surge].available, dec!(62));
        assert_eq!(loaded[&StrategyKind::Surge].epoch, 2);

        // A second save overwrites, not duplicates.
        store.save_checkpoints(&checkpoints).unwrap();
        assert_eq!(store.load_checkpoints().unwrap().len(), 2);
    }

    #[test]
    fn test_lifetime_stats_aggregate_by_strategy() {
        let store = StateStore::new(":memory:").unwrap();

        store.record_closed_trade(&trade(StrategyKind::Surge, "BTCUSDT", dec!(5))).unwrap();
        store.record_closed_trade(&trade(StrategyKind::Surge, "ETHUSDT", dec!(-2))).unwrap();
        store.record_closed_trade(&trade(StrategyKind::Rebound, "SOLUSDT", dec!(1))).unwrap();

        let stats = store.lifetime_stats().unwrap();
        assert_eq!(stats.len(), 2);

        let surge = stats.iter().find(|s| s.strategy == "surge").unwrap();
        assert_eq!(surge.trades, 2);
        assert_eq!(surge.wins, 1);
        assert_eq!(surge.realized_pnl, dec!(3));
    }

    #[test]
    fn test_activity_log_is_append_only_and_ordered() {
        let store = StateStore::new(":memory:").unwrap();

        store
            .log_event(Some("surge"), Some("BTCUSDT"), "execution_started", "reserve 38")
            .unwrap();
        store
            .log_event(Some("surge"), Some("BTCUSDT"), "execution_filled", "position 1")
            .unwrap();
        store.log_event(None, None, "engine_paused", "").unwrap();

        let recent = store.recent_activity(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, "engine_paused");
        assert!(recent[0].strategy.is_none());
        assert_eq!(recent[1].event, "execution_filled");
    }
}

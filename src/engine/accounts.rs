//! Isolated per-strategy capital pools.
//!
//! Each strategy trades out of its own pool; a loss in one never dips into
//! another's funds. Capital moves through three buckets: available, reserved
//! (a buy is in flight), and invested (held by the ledger). The conservation
//! identity `available + reserved + invested = initial + realized P&L`
//! holds across every mutation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::ExecutionConfig;
use crate::engine::ledger::{LedgerSettings, Position, PositionLedger};
use crate::strategy::StrategyKind;
use crate::utils::decimal::{safe_div, signed_pct_change};

/// Why a routed opportunity was turned away before any funds moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteRejection {
    #[error("symbol already held or pending in this pool")]
    DuplicateSymbol,
    #[error("pool is at its position capacity")]
    PoolFull,
    #[error("pool cannot fund the minimum trade")]
    InsufficientFunds,
    #[error("symbol is cooling down after a recent attempt")]
    CoolingDown,
}

/// One strategy's capital and positions.
///
/// The epoch bumps on every hard reset; in-flight executions carry the
/// epoch they started under and discard their result if it no longer
/// matches, so a reset cannot be corrupted by a late fill.
#[derive(Debug)]
pub struct BalancePool {
    pub strategy: StrategyKind,
    pub initial_balance: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub epoch: u64,
    pub ledger: PositionLedger,
    pending_symbols: HashSet<String>,
    min_trade_amount: Decimal,
    reserve_buffer: Decimal,
    trade_fraction: Decimal,
    max_positions: usize,
}

impl BalancePool {
    pub fn new(
        strategy: StrategyKind,
        config: &ExecutionConfig,
        ledger_settings: LedgerSettings,
    ) -> Self {
        Self {
            strategy,
            initial_balance: config.initial_pool_balance,
            available: config.initial_pool_balance,
            reserved: Decimal::ZERO,
            epoch: 0,
            ledger: PositionLedger::new(ledger_settings),
            pending_symbols: HashSet::new(),
            min_trade_amount: config.min_trade_amount,
            reserve_buffer: config.reserve_buffer,
            trade_fraction: config.trade_fraction,
            max_positions: config.max_positions_per_pool,
        }
    }

    /// Admit a symbol and move its trade size from available to reserved.
    ///
    /// Size is a fraction of what the pool can spare above the buffer,
    /// floored at the venue minimum; if even that does not fit, the entry
    /// is rejected with no funds moved.
    pub fn try_reserve(&mut self, symbol: &str) -> Result<Decimal, RouteRejection> {
        if self.ledger.has_symbol(symbol) || self.pending_symbols.contains(symbol) {
            return Err(RouteRejection::DuplicateSymbol);
        }
        if self.ledger.open_count() + self.pending_symbols.len() >= self.max_positions {
            return Err(RouteRejection::PoolFull);
        }

        let spare = self.available - self.reserve_buffer;
        let sized = (spare * self.trade_fraction).max(self.min_trade_amount);
        if sized > spare {
            return Err(RouteRejection::InsufficientFunds);
        }

        self.available -= sized;
        self.reserved += sized;
        self.pending_symbols.insert(symbol.to_string());
        Ok(sized)
    }

    /// Return a reservation untouched after a failed or abandoned buy.
    pub fn release(&mut self, symbol: &str, amount: Decimal) {
        self.reserved -= amount;
        self.available += amount;
        self.pending_symbols.remove(symbol);
    }

    /// Convert a reservation into an executed entry. Whatever the fill did
    /// not spend (lot rounding) flows back to available; the spent portion
    /// is now the ledger's to track.
    pub fn commit_entry(&mut self, symbol: &str, reserved: Decimal, spent: Decimal) {
        self.reserved -= reserved;
        self.available += reserved - spent;
        self.pending_symbols.remove(symbol);
    }

    /// Credit sale proceeds back to available.
    pub fn credit(&mut self, proceeds: Decimal) {
        self.available += proceeds;
    }

    /// Hard reset: initial balance restored, book wiped, epoch bumped so
    /// in-flight executions from the old life discard themselves.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.available = self.initial_balance;
        self.reserved = Decimal::ZERO;
        self.pending_symbols.clear();
        self.ledger.reset();
        info!(strategy = %self.strategy, epoch = self.epoch, "Pool reset");
    }

    pub fn pending_count(&self) -> usize {
        self.pending_symbols.len()
    }

    pub fn metrics(&self, prices: &HashMap<String, Decimal>) -> PoolMetrics {
        let invested = self.ledger.invested_total();
        let unrealized_pnl = self.ledger.unrealized_pnl_total(prices);
        let realized_pnl = self.ledger.realized_pnl_total();

        let trades = self.ledger.closed_trades();
        let wins = trades.iter().filter(|t| t.realized_pnl > Decimal::ZERO).count();
        let losses = trades.len() - wins;
        let win_rate_pct = (safe_div(Decimal::from(wins as u64), Decimal::from(trades.len() as u64))
            * dec!(100))
        .round_dp(2);

        let equity = self.available + self.reserved + invested + unrealized_pnl;

        PoolMetrics {
            strategy: self.strategy,
            initial_balance: self.initial_balance,
            available: self.available,
            reserved: self.reserved,
            invested,
            unrealized_pnl,
            realized_pnl,
            equity,
            roi_pct: signed_pct_change(self.initial_balance, equity).round_dp(2),
            open_positions: self.ledger.open_count(),
            pending_entries: self.pending_symbols.len(),
            trades_closed: trades.len(),
            wins,
            losses,
            win_rate_pct,
        }
    }
}

/// Read-only snapshot of one pool's health, derived on demand.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub strategy: StrategyKind,
    pub initial_balance: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub invested: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub equity: Decimal,
    pub roi_pct: Decimal,
    pub open_positions: usize,
    pub pending_entries: usize,
    pub trades_closed: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate_pct: Decimal,
}

/// Cross-pool aggregate. Purely derived: building one never mutates a pool,
/// and no handle into pool state survives it.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedMetrics {
    pub pools: Vec<PoolMetrics>,
    pub total_equity: Decimal,
    pub total_available: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub roi_pct: Decimal,
    pub open_positions: usize,
}

/// A position qualified by its pool; ids are only unique within one pool.
#[derive(Debug, Clone)]
pub struct PoolPosition {
    pub strategy: StrategyKind,
    pub position: Position,
}

/// All strategy pools behind their locks. One lock per pool keeps the
/// strategies independent under concurrency as well as in accounting.
pub struct StrategyAccounts {
    pools: HashMap<StrategyKind, Arc<RwLock<BalancePool>>>,
}

impl StrategyAccounts {
    pub fn new(config: &ExecutionConfig, ledger_settings: &LedgerSettings) -> Self {
        let pools = StrategyKind::ALL
            .iter()
            .map(|&kind| {
                let pool = BalancePool::new(kind, config, ledger_settings.clone());
                (kind, Arc::new(RwLock::new(pool)))
            })
            .collect();
        Self { pools }
    }

    /// Handle to one strategy's pool. Every variant is constructed up
    /// front, so the lookup cannot miss.
    pub fn pool(&self, strategy: StrategyKind) -> Arc<RwLock<BalancePool>> {
        Arc::clone(&self.pools[&strategy])
    }

    pub async fn reset_pool(&self, strategy: StrategyKind) {
        self.pool(strategy).write().await.reset();
    }

    pub async fn combined_metrics(&self, prices: &HashMap<String, Decimal>) -> CombinedMetrics {
        let reads = StrategyKind::ALL.iter().map(|&kind| {
            let pool = self.pool(kind);
            async move { pool.read().await.metrics(prices) }
        });
        let mut pools = join_all(reads).await;
        pools.sort_by_key(|m| m.strategy.as_str());

        let total_equity: Decimal = pools.iter().map(|m| m.equity).sum();
        let initial_total: Decimal = pools.iter().map(|m| m.initial_balance).sum();

        CombinedMetrics {
            total_equity,
            total_available: pools.iter().map(|m| m.available).sum(),
            total_realized_pnl: pools.iter().map(|m| m.realized_pnl).sum(),
            total_unrealized_pnl: pools.iter().map(|m| m.unrealized_pnl).sum(),
            roi_pct: signed_pct_change(initial_total, total_equity).round_dp(2),
            open_positions: pools.iter().map(|m| m.open_positions).sum(),
            pools,
        }
    }

    pub async fn positions_snapshot(&self) -> Vec<PoolPosition> {
        let mut out = Vec::new();
        for &kind in StrategyKind::ALL.iter() {
            let pool = self.pool(kind);
            let guard = pool.read().await;
            out.extend(guard.ledger.open_positions().cloned().map(|position| PoolPosition {
                strategy: kind,
                position,
            }));
        }
        out
    }
}

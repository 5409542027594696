//! Per-pool position ledger.
//!
//! Tracks open positions with ratcheting trailing stops, detects stop
//! breaches on each price refresh, and settles closes into an immutable
//! trade log. The stop price only ever rises: the trailing distance hangs
//! off the highest price seen, and the profit lock can lift the floor
//! above entry, but nothing lowers it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::strategy::StrategyKind;
use crate::utils::decimal::safe_div;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("position {0} not found")]
    NotFound(u64),
    #[error("position {0} already has a close in flight")]
    CloseInFlight(u64),
    #[error("{0} already has an open position in this pool")]
    DuplicateSymbol(String),
}

/// Why a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TrailingStop,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::Manual => "manual",
        }
    }
}

/// An open spot position. `invested` is the quote amount the pool spent,
/// entry fee included.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: u64,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub invested: Decimal,
    pub highest_price: Decimal,
    pub trailing_stop_pct: Decimal,
    pub stop_price: Decimal,
    pub profit_locked: bool,
    pub opened_at: DateTime<Utc>,
    /// A sell is in flight; the refresh loop must not emit this position
    /// again until the close resolves.
    pub closing: bool,
}

impl Position {
    /// Liquidation value at `price`, net of the exit fee.
    pub fn net_value(&self, price: Decimal, exit_fee_rate: Decimal) -> Decimal {
        self.quantity * price * (Decimal::ONE - exit_fee_rate)
    }

    pub fn unrealized_pnl(&self, price: Decimal, exit_fee_rate: Decimal) -> Decimal {
        self.net_value(price, exit_fee_rate) - self.invested
    }

    pub fn unrealized_pnl_pct(&self, price: Decimal, exit_fee_rate: Decimal) -> Decimal {
        safe_div(self.unrealized_pnl(price, exit_fee_rate), self.invested) * dec!(100)
    }
}

/// A settled trade, kept for metrics and the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: u64,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub invested: Decimal,
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// A position whose stop was breached this refresh.
#[derive(Debug, Clone)]
pub struct CloseCandidate {
    pub position_id: u64,
    pub symbol: String,
    pub price: Decimal,
    pub stop_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub exit_fee_rate: Decimal,
    pub profit_lock_threshold_pct: Decimal,
    pub profit_lock_level_pct: Decimal,
}

/// Open positions and the closed-trade log for one strategy pool.
#[derive(Debug)]
pub struct PositionLedger {
    settings: LedgerSettings,
    positions: HashMap<u64, Position>,
    closed: Vec<ClosedTrade>,
    next_id: u64,
}

impl PositionLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            settings,
            positions: HashMap::new(),
            closed: Vec::new(),
            next_id: 1,
        }
    }

    /// Book a new position. The initial stop sits the trailing distance
    /// below the entry price.
    pub fn open(
        &mut self,
        symbol: &str,
        strategy: StrategyKind,
        quantity: Decimal,
        entry_price: Decimal,
        invested: Decimal,
        trailing_stop_pct: Decimal,
    ) -> Result<u64, LedgerError> {
        if self.has_symbol(symbol) {
            return Err(LedgerError::DuplicateSymbol(symbol.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;

        let stop_price = entry_price * (Decimal::ONE - trailing_stop_pct / dec!(100));
        let position = Position {
            id,
            symbol: symbol.to_string(),
            strategy,
            quantity,
            entry_price,
            invested,
            highest_price: entry_price,
            trailing_stop_pct,
            stop_price,
            profit_locked: false,
            opened_at: Utc::now(),
            closing: false,
        };

        info!(
            symbol = %symbol,
            strategy = %strategy,
            position_id = id,
            entry = %entry_price,
            stop = %stop_price,
            "Position opened"
        );
        self.positions.insert(id, position);
        Ok(id)
    }

    /// Ratchet highest prices and stops against fresh prices, returning the
    /// positions whose stop was touched. Positions already closing are
    /// skipped so a slow sell cannot be submitted twice.
    pub fn refresh(&mut self, prices: &HashMap<String, Decimal>) -> Vec<CloseCandidate> {
        let settings = self.settings.clone();
        let mut breached = Vec::new();

        for position in self.positions.values_mut() {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };
            if position.closing {
                continue;
            }

            if price > position.highest_price {
                position.highest_price = price;
            }

            let trailing = position.highest_price
                * (Decimal::ONE - position.trailing_stop_pct / dec!(100));
            let mut new_stop = trailing.max(position.stop_price);

            if !position.profit_locked
                && position.unrealized_pnl_pct(price, settings.exit_fee_rate)
                    > settings.profit_lock_threshold_pct
            {
                position.profit_locked = true;
                debug!(
                    symbol = %position.symbol,
                    position_id = position.id,
                    "Profit lock engaged"
                );
            }
            if position.profit_locked {
                let floor = position.entry_price
                    * (Decimal::ONE + settings.profit_lock_level_pct / dec!(100));
                new_stop = new_stop.max(floor);
            }

            position.stop_price = new_stop;

            if price <= position.stop_price {
                breached.push(CloseCandidate {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    price,
                    stop_price: position.stop_price,
                });
            }
        }

        breached
    }

    /// Flag a position as having a sell in flight.
    pub fn mark_closing(&mut self, id: u64) -> Result<&Position, LedgerError> {
        let position = self.positions.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        if position.closing {
            return Err(LedgerError::CloseInFlight(id));
        }
        position.closing = true;
        Ok(position)
    }

    /// Undo `mark_closing` after a failed sell; the position stays on the
    /// book and the next refresh sees it again.
    pub fn clear_closing(&mut self, id: u64) {
        if let Some(position) = self.positions.get_mut(&id) {
            position.closing = false;
        }
    }

    /// Remove a position and record the settled trade. Settling an id that
    /// is no longer on the book returns `NotFound`, which callers treat as
    /// an already-completed close.
    pub fn settle(
        &mut self,
        id: u64,
        exit_price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedTrade, LedgerError> {
        let position = self.positions.remove(&id).ok_or(LedgerError::NotFound(id))?;

        let proceeds = position.net_value(exit_price, self.settings.exit_fee_rate);
        let realized_pnl = proceeds - position.invested;
        let pnl_pct = (safe_div(realized_pnl, position.invested) * dec!(100)).round_dp(4);

        let trade = ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            strategy: position.strategy,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price,
            invested: position.invested,
            proceeds,
            realized_pnl,
            pnl_pct,
            reason,
            opened_at: position.opened_at,
            closed_at: Utc::now(),
        };

        info!(
            symbol = %trade.symbol,
            strategy = %trade.strategy,
            position_id = id,
            exit = %exit_price,
            pnl = %realized_pnl,
            pnl_pct = %pnl_pct,
            reason = reason.as_str(),
            "Position closed"
        );
        self.closed.push(trade.clone());
        Ok(trade)
    }

    pub fn position(&self, id: u64) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.positions.values().any(|p| p.symbol == symbol)
    }

    /// Quote value currently tied up in positions, at cost.
    pub fn invested_total(&self) -> Decimal {
        self.positions.values().map(|p| p.invested).sum()
    }

    pub fn unrealized_pnl_total(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| {
                prices
                    .get(&p.symbol)
                    .map(|&price| p.unrealized_pnl(price, self.settings.exit_fee_rate))
            })
            .sum()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn realized_pnl_total(&self) -> Decimal {
        self.closed.iter().map(|t| t.realized_pnl).sum()
    }

    /// Wipe the book and the trade log. Used by the hard pool reset.
    pub fn reset(&mut self) {
        self.positions.clear();
        self.closed.clear();
        self.next_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LedgerSettings {
        LedgerSettings {
            exit_fee_rate: Decimal::ZERO,
            profit_lock_threshold_pct: dec!(3),
            profit_lock_level_pct: dec!(2),
        }
    }

    fn ledger() -> PositionLedger {
        PositionLedger::new(settings())
    }

    fn prices(pairs: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    // =========================================================================
    // Trailing Stop Ratchet
    // =========================================================================

    #[test]
    fn test_initial_stop_below_entry() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        assert_eq!(l.position(id).unwrap().stop_price, dec!(99));
    }

    #[test]
    fn test_stop_follows_new_high() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        let breached = l.refresh(&prices(&[("BTCUSDT", dec!(110))]));
        assert!(breached.is_empty());

        let p = l.position(id).unwrap();
        assert_eq!(p.highest_price, dec!(110));
        assert_eq!(p.stop_price, dec!(108.9));
    }

    #[test]
    fn test_stop_never_falls_back() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        l.refresh(&prices(&[("BTCUSDT", dec!(110))]));
        // Price retreats but stays above the stop; stop and high must hold.
        let breached = l.refresh(&prices(&[("BTCUSDT", dec!(109.5))]));
        assert!(breached.is_empty());

        let p = l.position(id).unwrap();
        assert_eq!(p.highest_price, dec!(110));
        assert_eq!(p.stop_price, dec!(108.9));
    }

    #[test]
    fn test_breach_at_exact_stop_price() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        l.refresh(&prices(&[("BTCUSDT", dec!(110))]));
        let breached = l.refresh(&prices(&[("BTCUSDT", dec!(108.9))]));

        assert_eq!(breached.len(), 1);
        assert_eq!(breached[0].position_id, id);
        assert_eq!(breached[0].stop_price, dec!(108.9));
    }

    // =========================================================================
    // Profit Lock
    // =========================================================================

    #[test]
    fn test_profit_lock_lifts_stop_above_entry() {
        let mut l = ledger();
        // Wide 5% trailing stop: at 104 the trailing stop alone would sit
        // at 98.8, below entry.
        let id = l
            .open("ETHUSDT", StrategyKind::Breakout, dec!(1), dec!(100), dec!(100), dec!(5))
            .unwrap();

        // +4% exceeds the 3% lock threshold; stop floors at 102.
        l.refresh(&prices(&[("ETHUSDT", dec!(104))]));
        let p = l.position(id).unwrap();
        assert!(p.profit_locked);
        assert!(p.stop_price >= dec!(102));
    }

    #[test]
    fn test_profit_lock_floor_survives_pullback() {
        let mut l = ledger();
        let id = l
            .open("ETHUSDT", StrategyKind::Breakout, dec!(1), dec!(100), dec!(100), dec!(5))
            .unwrap();

        l.refresh(&prices(&[("ETHUSDT", dec!(104))]));
        // Pullback to 102 touches the locked floor and books the exit.
        let breached = l.refresh(&prices(&[("ETHUSDT", dec!(102))]));
        assert_eq!(breached.len(), 1);
        assert_eq!(breached[0].position_id, id);
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    #[test]
    fn test_settle_books_realized_pnl() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        let trade = l.settle(id, dec!(108.9), CloseReason::TrailingStop).unwrap();
        assert_eq!(trade.realized_pnl, dec!(8.9));
        assert_eq!(trade.pnl_pct, dec!(8.9000));
        assert_eq!(l.open_count(), 0);
        assert_eq!(l.closed_trades().len(), 1);
        assert_eq!(l.realized_pnl_total(), dec!(8.9));
    }

    #[test]
    fn test_settle_charges_exit_fee() {
        let mut l = PositionLedger::new(LedgerSettings {
            exit_fee_rate: dec!(0.001),
            ..settings()
        });
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(2), dec!(100), dec!(200), dec!(1))
            .unwrap();

        let trade = l.settle(id, dec!(110), CloseReason::Manual).unwrap();
        // 2 * 110 * 0.999 = 219.78
        assert_eq!(trade.proceeds, dec!(219.780));
        assert_eq!(trade.realized_pnl, dec!(19.780));
    }

    #[test]
    fn test_settle_is_idempotent() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        l.settle(id, dec!(105), CloseReason::Manual).unwrap();
        // The second settle finds nothing to do and the log keeps one entry.
        assert!(matches!(
            l.settle(id, dec!(90), CloseReason::Manual),
            Err(LedgerError::NotFound(_))
        ));
        assert_eq!(l.closed_trades().len(), 1);
        assert_eq!(l.closed_trades()[0].exit_price, dec!(105));
    }

    // =========================================================================
    // Close-In-Flight Guard
    // =========================================================================

    #[test]
    fn test_closing_flag_blocks_duplicate_submission() {
        let mut l = ledger();
        let id = l
            .open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        l.mark_closing(id).unwrap();
        assert!(matches!(l.mark_closing(id), Err(LedgerError::CloseInFlight(_))));

        // While closing, a refresh must not emit the position again.
        let breached = l.refresh(&prices(&[("BTCUSDT", dec!(50))]));
        assert!(breached.is_empty());

        // A failed sell clears the flag and the stop logic resumes.
        l.clear_closing(id);
        let breached = l.refresh(&prices(&[("BTCUSDT", dec!(50))]));
        assert_eq!(breached.len(), 1);
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let mut l = ledger();
        l.open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(100), dec!(100), dec!(1))
            .unwrap();

        assert!(matches!(
            l.open("BTCUSDT", StrategyKind::Surge, dec!(1), dec!(101), dec!(101), dec!(1)),
            Err(LedgerError::DuplicateSymbol(_))
        ));
    }
}

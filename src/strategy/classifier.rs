//! Opportunity classification rules.
//!
//! Each snapshot is checked against every strategy rule independently; a
//! rule emits at most one opportunity. Signals are heuristic approximations
//! from the single 24h ticker (no OHLC series): a synthetic momentum index
//! from the 24h change, volatility from the 24h range, and a volume
//! multiplier from the 24h quote volume extrapolated to an hourly rate.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::SignalConfig;
use crate::exchange::MarketSnapshot;
use crate::strategy::momentum::MomentumHistory;
use crate::strategy::StrategyKind;
use crate::utils::decimal::safe_div;

/// Signals derived from one snapshot, carried on the opportunity for
/// ranking and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSignals {
    /// Hourly-extrapolated volume versus the configured baseline.
    pub volume_multiplier: Decimal,
    /// Synthetic index on a 0–100 scale, 50 = flat 24h.
    pub momentum_index: Decimal,
    /// 24h range as a percentage of the last price.
    pub volatility_pct: Decimal,
}

/// A strategy-tagged trade candidate derived from one snapshot.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub price: Decimal,
    pub change_pct: Decimal,
    pub strategy: StrategyKind,
    pub rationale: String,
    pub signals: DerivedSignals,
}

/// Evaluates snapshots against the strategy rules.
///
/// Owns the per-symbol momentum history; `classify_batch` records this
/// cycle's index for every snapshot and sweeps symbols that left the feed.
pub struct SignalClassifier {
    config: SignalConfig,
    history: MomentumHistory,
}

impl SignalClassifier {
    pub fn new(config: SignalConfig) -> Self {
        let history = MomentumHistory::new(
            config.history_len,
            config.history_max_idle_cycles,
        );
        Self { config, history }
    }

    /// Derive the signal set for one snapshot.
    pub fn derive_signals(&self, snapshot: &MarketSnapshot) -> DerivedSignals {
        let hourly_volume = snapshot.quote_volume_24h / dec!(24);
        let volume_multiplier = safe_div(hourly_volume, self.config.baseline_hourly_volume);

        let momentum_index = (dec!(50) + snapshot.change_pct_24h * dec!(1.5))
            .clamp(Decimal::ZERO, dec!(100));

        let range = snapshot.high_24h - snapshot.low_24h;
        let volatility_pct = safe_div(range, snapshot.last_price) * dec!(100);

        DerivedSignals {
            volume_multiplier,
            momentum_index,
            volatility_pct,
        }
    }

    /// Evaluate one snapshot against every rule, recording momentum state.
    pub fn classify(&mut self, snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        if snapshot.last_price <= Decimal::ZERO {
            return Vec::new();
        }

        let signals = self.derive_signals(snapshot);
        let previous_index = self
            .history
            .record(&snapshot.symbol, signals.momentum_index);

        let mut opportunities = Vec::new();
        if let Some(opp) = self.surge_rule(snapshot, &signals) {
            opportunities.push(opp);
        }
        if let Some(opp) = self.breakout_rule(snapshot, &signals) {
            opportunities.push(opp);
        }
        if let Some(opp) = self.rebound_rule(snapshot, &signals, previous_index) {
            opportunities.push(opp);
        }

        for opp in &opportunities {
            debug!(
                symbol = %opp.symbol,
                strategy = %opp.strategy,
                momentum = %opp.signals.momentum_index,
                volume_mult = %opp.signals.volume_multiplier,
                "Opportunity detected"
            );
        }

        opportunities
    }

    /// Classify a full cycle's batch and age out departed symbols.
    pub fn classify_batch(&mut self, snapshots: &[MarketSnapshot]) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();
        for snapshot in snapshots {
            opportunities.extend(self.classify(snapshot));
        }

        let seen: HashSet<&str> = snapshots.iter().map(|s| s.symbol.as_str()).collect();
        self.history.sweep(&seen);

        opportunities
    }

    pub fn history(&self) -> &MomentumHistory {
        &self.history
    }

    /// Volume surge with the 24h move inside the tradeable band. The upper
    /// bound rejects blow-off candles that already spent their move.
    fn surge_rule(&self, snapshot: &MarketSnapshot, signals: &DerivedSignals) -> Option<Opportunity> {
        let cfg = &self.config;
        if signals.volume_multiplier < cfg.surge_min_volume_multiplier
            || snapshot.change_pct_24h < cfg.surge_min_change_pct
            || snapshot.change_pct_24h > cfg.surge_max_change_pct
        {
            return None;
        }

        Some(Opportunity {
            symbol: snapshot.symbol.clone(),
            price: snapshot.last_price,
            change_pct: snapshot.change_pct_24h,
            strategy: StrategyKind::Surge,
            rationale: format!(
                "volume {:.1}x hourly baseline with {:+.2}% 24h move",
                signals.volume_multiplier, snapshot.change_pct_24h
            ),
            signals: signals.clone(),
        })
    }

    /// Price pressing the 24h high with volume behind it.
    fn breakout_rule(
        &self,
        snapshot: &MarketSnapshot,
        signals: &DerivedSignals,
    ) -> Option<Opportunity> {
        let cfg = &self.config;
        if snapshot.high_24h <= Decimal::ZERO {
            return None;
        }

        let threshold =
            snapshot.high_24h * (Decimal::ONE - cfg.breakout_proximity_pct / dec!(100));
        if snapshot.last_price < threshold
            || snapshot.change_pct_24h < cfg.breakout_min_change_pct
            || signals.volume_multiplier < cfg.breakout_min_volume_multiplier
        {
            return None;
        }

        Some(Opportunity {
            symbol: snapshot.symbol.clone(),
            price: snapshot.last_price,
            change_pct: snapshot.change_pct_24h,
            strategy: StrategyKind::Breakout,
            rationale: format!(
                "price {} within {:.2}% of 24h high {}",
                snapshot.last_price, cfg.breakout_proximity_pct, snapshot.high_24h
            ),
            signals: signals.clone(),
        })
    }

    /// Oversold index crossing back up through the threshold while the 24h
    /// change is still negative. Needs the previous cycle's index: no
    /// crossing can fire on a symbol's first sighting.
    fn rebound_rule(
        &self,
        snapshot: &MarketSnapshot,
        signals: &DerivedSignals,
        previous_index: Option<Decimal>,
    ) -> Option<Opportunity> {
        let cfg = &self.config;
        let previous = previous_index?;

        let crossed_up = previous < cfg.rebound_oversold_index
            && signals.momentum_index >= cfg.rebound_oversold_index;
        if !crossed_up || snapshot.change_pct_24h >= Decimal::ZERO {
            return None;
        }

        Some(Opportunity {
            symbol: snapshot.symbol.clone(),
            price: snapshot.last_price,
            change_pct: snapshot.change_pct_24h,
            strategy: StrategyKind::Rebound,
            rationale: format!(
                "momentum {:.0} crossed up through oversold {:.0} (prev {:.0})",
                signals.momentum_index, cfg.rebound_oversold_index, previous
            ),
            signals: signals.clone(),
        })
    }
}

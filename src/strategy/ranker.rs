//! Opportunity scoring and selection.
//!
//! Every opportunity gets a 0–100 composite score; the sorted list's head is
//! the cycle's golden pick. Momentum fitness is direction-dependent: trend
//! strategies want a hot index, mean-reversion wants it cold. The same
//! volatility that hurts the stability sub-score widens the trailing stop,
//! so choppy symbols both rank lower and get more room.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::RankerConfig;
use crate::strategy::classifier::Opportunity;

const WEIGHT_VOLUME: Decimal = dec!(0.4);
const WEIGHT_MOMENTUM: Decimal = dec!(0.4);
const WEIGHT_STABILITY: Decimal = dec!(0.2);

/// Per-factor sub-scores, each on a 0–100 scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub volume: Decimal,
    pub momentum: Decimal,
    pub stability: Decimal,
}

/// An opportunity with its composite score and sized trailing stop.
#[derive(Debug, Clone)]
pub struct RankedOpportunity {
    pub opportunity: Opportunity,
    pub score: Decimal,
    pub breakdown: ScoreBreakdown,
    pub rank_reason: String,
    /// Volatility-sized trailing stop distance for this entry.
    pub trailing_stop_pct: Decimal,
}

pub struct OpportunityRanker {
    config: RankerConfig,
}

impl OpportunityRanker {
    pub fn new(config: RankerConfig) -> Self {
        Self { config }
    }

    /// Score and sort a cycle's opportunities, best first.
    ///
    /// Ordering is deterministic: score, then volume multiplier, then
    /// symbol, so equal-scoring cycles always pick the same head.
    pub fn rank(&self, opportunities: Vec<Opportunity>) -> Vec<RankedOpportunity> {
        let mut ranked: Vec<RankedOpportunity> =
            opportunities.into_iter().map(|o| self.score(o)).collect();

        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| {
                    b.opportunity
                        .signals
                        .volume_multiplier
                        .cmp(&a.opportunity.signals.volume_multiplier)
                })
                .then_with(|| a.opportunity.symbol.cmp(&b.opportunity.symbol))
        });

        ranked
    }

    fn score(&self, opportunity: Opportunity) -> RankedOpportunity {
        let signals = &opportunity.signals;

        let volume = (signals.volume_multiplier / self.config.target_volume_multiplier
            * dec!(100))
        .clamp(Decimal::ZERO, dec!(100));

        // Trend entries want momentum high; mean-reversion entries want the
        // index depressed, so the scale flips.
        let momentum = if opportunity.strategy.is_mean_reversion() {
            dec!(100) - signals.momentum_index
        } else {
            signals.momentum_index
        };

        let stability = (dec!(100) - signals.volatility_pct * dec!(10))
            .clamp(Decimal::ZERO, dec!(100));

        let score = (volume * WEIGHT_VOLUME
            + momentum * WEIGHT_MOMENTUM
            + stability * WEIGHT_STABILITY)
            .round_dp(2);

        let rank_reason = format!(
            "vol {:.0} / mom {:.0} / stab {:.0}",
            volume, momentum, stability
        );

        let trailing_stop_pct = self.trailing_stop_pct(signals.volatility_pct);

        RankedOpportunity {
            opportunity,
            score,
            breakdown: ScoreBreakdown {
                volume,
                momentum,
                stability,
            },
            rank_reason,
            trailing_stop_pct,
        }
    }

    /// Volatility-proportional stop distance, clamped to the configured
    /// band. Non-positive volatility (degenerate ticker) falls back to the
    /// configured default instead of producing a zero-width stop.
    pub fn trailing_stop_pct(&self, volatility_pct: Decimal) -> Decimal {
        let cfg = &self.config;
        if volatility_pct <= Decimal::ZERO {
            return cfg.default_trailing_stop_pct;
        }

        (volatility_pct * cfg.trailing_stop_volatility_factor)
            .clamp(cfg.min_trailing_stop_pct, cfg.max_trailing_stop_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::classifier::DerivedSignals;
    use crate::strategy::StrategyKind;

    fn opportunity(
        symbol: &str,
        strategy: StrategyKind,
        volume_multiplier: Decimal,
        momentum_index: Decimal,
        volatility_pct: Decimal,
    ) -> Opportunity {
        Opportunity {
            symbol: symbol.to_string(),
            price: dec!(100),
            change_pct: dec!(5),
            strategy,
            rationale: "test".to_string(),
            signals: DerivedSignals {
                volume_multiplier,
                momentum_index,
                volatility_pct,
            },
        }
    }

    fn ranker() -> OpportunityRanker {
        OpportunityRanker::new(RankerConfig::default())
    }

    // Defaults: target volume multiplier 5x, stop band 1..5% with factor
    // 0.3 and fallback 2%.

    // =========================================================================
    // Scoring
    // =========================================================================

    #[test]
    fn test_empty_in_empty_out() {
        assert!(ranker().rank(Vec::new()).is_empty());
    }

    #[test]
    fn test_score_is_weighted_sum() {
        // volume 5/5 -> 100, momentum 60, volatility 3% -> stability 70:
        // 100*0.4 + 60*0.4 + 70*0.2 = 78
        let ranked = ranker().rank(vec![opportunity(
            "BTCUSDT",
            StrategyKind::Surge,
            dec!(5),
            dec!(60),
            dec!(3),
        )]);

        assert_eq!(ranked[0].score, dec!(78.00));
        assert_eq!(ranked[0].breakdown.volume, dec!(100));
        assert_eq!(ranked[0].breakdown.stability, dec!(70));
    }

    #[test]
    fn test_score_stays_in_bounds() {
        // Everything maxed out still caps at 100.
        let hot = ranker().rank(vec![opportunity(
            "XUSDT",
            StrategyKind::Surge,
            dec!(50),
            dec!(100),
            dec!(0.1),
        )]);
        assert!(hot[0].score <= dec!(100));

        let cold = ranker().rank(vec![opportunity(
            "YUSDT",
            StrategyKind::Surge,
            dec!(0.1),
            dec!(0),
            dec!(40),
        )]);
        assert!(cold[0].score >= Decimal::ZERO);
    }

    #[test]
    fn test_momentum_fitness_flips_for_mean_reversion() {
        let r = ranker();
        // Same cold index 30: bad for a trend entry, good for a rebound.
        let trend = r.rank(vec![opportunity(
            "AUSDT",
            StrategyKind::Surge,
            dec!(5),
            dec!(30),
            dec!(3),
        )]);
        let reversion = r.rank(vec![opportunity(
            "BUSDT",
            StrategyKind::Rebound,
            dec!(5),
            dec!(30),
            dec!(3),
        )]);

        assert_eq!(trend[0].breakdown.momentum, dec!(30));
        assert_eq!(reversion[0].breakdown.momentum, dec!(70));
        assert!(reversion[0].score > trend[0].score);
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn test_golden_pick_is_highest_score() {
        let ranked = ranker().rank(vec![
            opportunity("LOWUSDT", StrategyKind::Surge, dec!(2), dec!(55), dec!(8)),
            opportunity("HIGHUSDT", StrategyKind::Surge, dec!(5), dec!(70), dec!(2)),
        ]);

        assert_eq!(ranked[0].opportunity.symbol, "HIGHUSDT");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_tie_breaks_on_volume_then_symbol() {
        let r = ranker();
        // Identical signals except volume already above the 5x target, so
        // the volume sub-score saturates and scores tie.
        let by_volume = r.rank(vec![
            opportunity("AUSDT", StrategyKind::Surge, dec!(6), dec!(60), dec!(3)),
            opportunity("BUSDT", StrategyKind::Surge, dec!(8), dec!(60), dec!(3)),
        ]);
        assert_eq!(by_volume[0].score, by_volume[1].score);
        assert_eq!(by_volume[0].opportunity.symbol, "BUSDT");

        // Fully identical signals fall through to the symbol.
        let by_symbol = r.rank(vec![
            opportunity("ZZUSDT", StrategyKind::Surge, dec!(6), dec!(60), dec!(3)),
            opportunity("AAUSDT", StrategyKind::Surge, dec!(6), dec!(60), dec!(3)),
        ]);
        assert_eq!(by_symbol[0].opportunity.symbol, "AAUSDT");
    }

    // =========================================================================
    // Trailing Stop Sizing
    // =========================================================================

    #[test]
    fn test_trailing_stop_scales_with_volatility() {
        let r = ranker();
        // 10% volatility * 0.3 = 3%, inside the 1..5 band
        assert_eq!(r.trailing_stop_pct(dec!(10)), dec!(3));
    }

    #[test]
    fn test_trailing_stop_is_clamped() {
        let r = ranker();
        assert_eq!(r.trailing_stop_pct(dec!(1)), dec!(1)); // 0.3 -> floor
        assert_eq!(r.trailing_stop_pct(dec!(40)), dec!(5)); // 12 -> ceiling
    }

    #[test]
    fn test_trailing_stop_falls_back_on_degenerate_volatility() {
        let r = ranker();
        assert_eq!(r.trailing_stop_pct(Decimal::ZERO), dec!(2));
        assert_eq!(r.trailing_stop_pct(dec!(-1)), dec!(2));
    }
}

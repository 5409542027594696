//! Opportunity detection: classification rules, momentum state, ranking.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod classifier;
mod momentum;
mod ranker;

pub use classifier::{DerivedSignals, Opportunity, SignalClassifier};
pub use momentum::MomentumHistory;
pub use ranker::{OpportunityRanker, RankedOpportunity, ScoreBreakdown};

/// The fixed set of trading strategies. Each owns one isolated balance pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Momentum continuation backed by a volume surge.
    Surge,
    /// Price pressing into the 24h high.
    Breakout,
    /// Oversold mean-reversion; the only strategy needing cross-cycle state.
    Rebound,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Surge,
        StrategyKind::Breakout,
        StrategyKind::Rebound,
    ];

    /// Stable lowercase key used in the checkpoint store.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Surge => "surge",
            StrategyKind::Breakout => "breakout",
            StrategyKind::Rebound => "rebound",
        }
    }

    /// Mean-reversion strategies invert momentum fitness when scored:
    /// deeper oversold readings rank higher, not lower.
    pub fn is_mean_reversion(&self) -> bool {
        matches!(self, StrategyKind::Rebound)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Surge => write!(f, "Surge"),
            StrategyKind::Breakout => write!(f, "Breakout"),
            StrategyKind::Rebound => write!(f, "Rebound"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "surge" => Ok(StrategyKind::Surge),
            "breakout" => Ok(StrategyKind::Breakout),
            "rebound" => Ok(StrategyKind::Rebound),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

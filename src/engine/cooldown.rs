//! Re-entry cool-down per (symbol, strategy).
//!
//! Any resolved execution, filled or failed, starts a cool-down window for
//! its pair so one hot ticker cannot be churned cycle after cycle. Expired
//! entries are pruned lazily on access.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::strategy::StrategyKind;

pub struct CooldownTracker {
    window: Duration,
    deadlines: HashMap<(String, StrategyKind), Instant>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    /// Start (or restart) the window for a pair.
    pub fn mark(&mut self, symbol: &str, strategy: StrategyKind) {
        self.deadlines
            .insert((symbol.to_string(), strategy), Instant::now() + self.window);
        debug!(symbol = %symbol, strategy = %strategy, "Cool-down started");
    }

    /// True while the pair's window is still running. An expired entry is
    /// dropped on the way out.
    pub fn is_active(&mut self, symbol: &str, strategy: StrategyKind) -> bool {
        let key = (symbol.to_string(), strategy);
        match self.deadlines.get(&key) {
            Some(&deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.deadlines.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop a strategy's windows entirely. Used by the pool hard reset so a
    /// fresh pool starts with a clean slate.
    pub fn clear_strategy(&mut self, strategy: StrategyKind) {
        self.deadlines.retain(|(_, s), _| *s != strategy);
    }

    /// Count of live windows, pruning expired ones along the way.
    pub fn active_count(&mut self) -> usize {
        let now = Instant::now();
        self.deadlines.retain(|_, deadline| now < *deadline);
        self.deadlines.len()
    }
}

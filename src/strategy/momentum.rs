//! Per-symbol momentum index history.
//!
//! The Rebound rule detects an index *crossing* up through the oversold
//! threshold, which needs the previous cycle's reading. The history is an
//! explicit state object owned by the classifier: recorded every cycle,
//! bounded per symbol, and swept of symbols that stop appearing in the
//! snapshot feed.

use std::collections::{HashMap, HashSet, VecDeque};

use rust_decimal::Decimal;

#[derive(Debug)]
struct SymbolSeries {
    values: VecDeque<Decimal>,
    idle_cycles: u32,
}

#[derive(Debug)]
pub struct MomentumHistory {
    capacity: usize,
    max_idle_cycles: u32,
    series: HashMap<String, SymbolSeries>,
}

impl MomentumHistory {
    /// `capacity` bounds each symbol's ring; `max_idle_cycles` is how many
    /// cycles a symbol may be absent from the feed before its history is
    /// dropped.
    pub fn new(capacity: usize, max_idle_cycles: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            max_idle_cycles,
            series: HashMap::new(),
        }
    }

    /// Record this cycle's index for a symbol, returning the previous
    /// cycle's index if one exists. The return value is the crossing
    /// comparator: `None` on first sighting means no crossing can fire yet.
    pub fn record(&mut self, symbol: &str, index: Decimal) -> Option<Decimal> {
        let series = self
            .series
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolSeries {
                values: VecDeque::new(),
                idle_cycles: 0,
            });

        let previous = series.values.back().copied();
        if series.values.len() == self.capacity {
            series.values.pop_front();
        }
        series.values.push_back(index);
        series.idle_cycles = 0;
        previous
    }

    /// Most recent recorded index for a symbol.
    pub fn latest(&self, symbol: &str) -> Option<Decimal> {
        self.series.get(symbol).and_then(|s| s.values.back().copied())
    }

    /// Age out symbols missing from this cycle's snapshot batch.
    pub fn sweep(&mut self, seen: &HashSet<&str>) {
        let max_idle = self.max_idle_cycles;
        self.series.retain(|symbol, series| {
            if seen.contains(symbol.as_str()) {
                true
            } else {
                series.idle_cycles += 1;
                series.idle_cycles <= max_idle
            }
        });
    }

    pub fn tracked_symbols(&self) -> usize {
        self.series.len()
    }

    #[cfg(test)]
    fn depth(&self, symbol: &str) -> usize {
        self.series.get(symbol).map_or(0, |s| s.values.len())
    }
}

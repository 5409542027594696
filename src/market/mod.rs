//! Market data feed: periodic snapshot fetch with static filtering.
//!
//! The feed supplies each refresh cycle with snapshots already narrowed to
//! tradeable markets: quote-asset match, optional base allow-list, a
//! minimum liquidity floor, and minus any symbols excluded during the
//! session (fed by non-retryable order rejections).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::MarketConfig;
use crate::exchange::{ExchangeApi, ExchangeError, MarketSnapshot};

pub struct MarketFeed {
    exchange: Arc<dyn ExchangeApi>,
    config: MarketConfig,
    excluded: RwLock<HashSet<String>>,
}

impl MarketFeed {
    pub fn new(exchange: Arc<dyn ExchangeApi>, config: MarketConfig) -> Self {
        Self {
            exchange,
            config,
            excluded: RwLock::new(HashSet::new()),
        }
    }

    /// Fetch and filter one cycle's snapshot batch.
    pub async fn fetch_cycle(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
        let tickers = self.exchange.ticker_24h().await?;
        let fetched = tickers.len();
        let excluded = self.excluded.read().await;

        let snapshots: Vec<MarketSnapshot> = tickers
            .into_iter()
            .filter(|t| self.tradeable(t, &excluded))
            .collect();

        debug!(
            fetched,
            tradeable = snapshots.len(),
            excluded = excluded.len(),
            "Market snapshot cycle"
        );

        Ok(snapshots)
    }

    fn tradeable(&self, snapshot: &MarketSnapshot, excluded: &HashSet<String>) -> bool {
        let Some(base) = snapshot.symbol.strip_suffix(&self.config.quote_asset) else {
            return false;
        };
        if base.is_empty() || excluded.contains(&snapshot.symbol) {
            return false;
        }
        if !self.config.allowed_bases.is_empty()
            && !self.config.allowed_bases.iter().any(|b| b == base)
        {
            return false;
        }
        snapshot.last_price > rust_decimal::Decimal::ZERO
            && snapshot.quote_volume_24h >= self.config.min_quote_volume_24h
    }

    /// Remove a symbol from future cycles.
    ///
    /// Called when the venue rejects it outright (invalid symbol, lot-size
    /// filter); exclusions last for the session.
    pub async fn exclude(&self, symbol: &str, reason: &str) {
        let mut excluded = self.excluded.write().await;
        if excluded.insert(symbol.to_string()) {
            warn!(%symbol, %reason, "Symbol excluded from market feed");
        }
    }

    pub async fn is_excluded(&self, symbol: &str) -> bool {
        self.excluded.read().await.contains(symbol)
    }

    pub async fn excluded_count(&self) -> usize {
        self.excluded.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeStatus, OrderReceipt, OrderRequest};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct CannedVenue(Vec<MarketSnapshot>);

    #[async_trait]
    impl ExchangeApi for CannedVenue {
        fn venue_name(&self) -> &'static str {
            "Canned"
        }

        async fn status(&self) -> ExchangeStatus {
            ExchangeStatus {
                online: true,
                latency_ms: 1,
                balance: None,
            }
        }

        async fn place_market_order(
            &self,
            order: &OrderRequest,
        ) -> Result<OrderReceipt, ExchangeError> {
            Err(ExchangeError::InvalidSymbol(order.symbol.clone()))
        }

        async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
            Ok(self.0.clone())
        }
    }

    fn snapshot(symbol: &str, volume: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: dec!(100),
            high_24h: dec!(110),
            low_24h: dec!(90),
            change_pct_24h: dec!(2),
            quote_volume_24h: volume,
        }
    }

    fn feed_with(config: MarketConfig, snapshots: Vec<MarketSnapshot>) -> MarketFeed {
        MarketFeed::new(Arc::new(CannedVenue(snapshots)), config)
    }

    fn test_config() -> MarketConfig {
        MarketConfig {
            quote_asset: "USDT".to_string(),
            allowed_bases: Vec::new(),
            min_quote_volume_24h: dec!(1_000_000),
        }
    }

    #[tokio::test]
    async fn test_quote_asset_and_liquidity_filter() {
        let feed = feed_with(
            test_config(),
            vec![
                snapshot("BTCUSDT", dec!(50_000_000)),
                snapshot("BTCBUSD", dec!(50_000_000)),
                snapshot("TINYUSDT", dec!(5_000)),
            ],
        );

        let cycle = feed.fetch_cycle().await.unwrap();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_base_allow_list() {
        let config = MarketConfig {
            allowed_bases: vec!["BTC".to_string(), "ETH".to_string()],
            ..test_config()
        };
        let feed = feed_with(
            config,
            vec![
                snapshot("BTCUSDT", dec!(50_000_000)),
                snapshot("ETHUSDT", dec!(20_000_000)),
                snapshot("DOGEUSDT", dec!(30_000_000)),
            ],
        );

        let cycle = feed.fetch_cycle().await.unwrap();
        let symbols: Vec<&str> = cycle.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn test_exclusion_drops_symbol_from_next_cycle() {
        let feed = feed_with(
            test_config(),
            vec![
                snapshot("BTCUSDT", dec!(50_000_000)),
                snapshot("ETHUSDT", dec!(20_000_000)),
            ],
        );

        assert_eq!(feed.fetch_cycle().await.unwrap().len(), 2);

        feed.exclude("ETHUSDT", "lot size rejected").await;
        assert!(feed.is_excluded("ETHUSDT").await);

        let cycle = feed.fetch_cycle().await.unwrap();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].symbol, "BTCUSDT");
        assert_eq!(feed.excluded_count().await, 1);
    }
}

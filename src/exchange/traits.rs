//! Venue-agnostic trait for the exchange contract the engine depends on.
//!
//! The engine never talks to a concrete venue type: market data, the
//! connectivity handshake, and order submission all go through
//! `ExchangeApi`, so live trading (`BinanceSpotClient`) and paper trading
//! (`PaperExchange`) are interchangeable at wiring time.

use async_trait::async_trait;

use crate::exchange::error::ExchangeError;
use crate::exchange::types::{ExchangeStatus, MarketSnapshot, OrderReceipt, OrderRequest};

/// The request/response contract between the engine and a trading venue.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Human-readable venue name for log lines.
    fn venue_name(&self) -> &'static str;

    /// Connectivity/balance handshake.
    ///
    /// Never errors: an unreachable venue reports `online: false`. The
    /// executor fails fast on an offline venue without consuming a retry
    /// slot.
    async fn status(&self) -> ExchangeStatus;

    /// Submit a market order and wait for the fill acknowledgement.
    async fn place_market_order(&self, order: &OrderRequest)
        -> Result<OrderReceipt, ExchangeError>;

    /// Fetch the full 24h ticker list.
    async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError>;

    /// Hook invoked with each cycle's snapshot batch.
    ///
    /// Live venues ignore it; the paper venue uses it to mark simulated
    /// fills to current prices.
    async fn sync_market(&self, _snapshots: &[MarketSnapshot]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct StubVenue;

    #[async_trait]
    impl ExchangeApi for StubVenue {
        fn venue_name(&self) -> &'static str {
            "Stub"
        }

        async fn status(&self) -> ExchangeStatus {
            ExchangeStatus {
                online: true,
                latency_ms: 1,
                balance: Some(dec!(1000)),
            }
        }

        async fn place_market_order(
            &self,
            order: &OrderRequest,
        ) -> Result<OrderReceipt, ExchangeError> {
            Err(ExchangeError::InvalidSymbol(order.symbol.clone()))
        }

        async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let venue: Box<dyn ExchangeApi> = Box::new(StubVenue);
        assert_eq!(venue.venue_name(), "Stub");
        assert!(venue.status().await.online);
        // Default sync_market is a no-op and must not panic on any input.
        venue.sync_market(&[]).await;
    }
}

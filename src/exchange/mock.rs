//! Simulated venue for paper trading and executor tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::debug;

use crate::exchange::error::ExchangeError;
use crate::exchange::traits::ExchangeApi;
use crate::exchange::types::{
    ExchangeStatus, MarketSnapshot, OrderReceipt, OrderRequest, OrderSide,
};

/// In-process venue that fills market orders at the last synced price.
///
/// Paper mode trades through this venue while real market data flows in via
/// `sync_market`. Tests drive the failure-injection knobs to exercise every
/// branch of the execution state machine.
pub struct PaperExchange {
    /// Simulated quote-asset account balance.
    balance: Arc<RwLock<Decimal>>,
    /// Last synced price per symbol; orders for unknown symbols are rejected.
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    /// Fills recorded in submission order.
    fills: Arc<RwLock<Vec<OrderReceipt>>>,
    /// Symbols that reject with `InvalidSymbol` (non-retryable injection).
    rejected_symbols: Arc<RwLock<HashSet<String>>>,
    /// Number of upcoming submissions to fail with a retryable venue error.
    fail_next: AtomicU32,
    /// When set, the handshake reports offline and submissions error out.
    offline: AtomicBool,
    order_id_counter: AtomicU64,
    /// Taker fee charged on the simulated account balance (0.1% spot).
    fee_rate: Decimal,
}

impl PaperExchange {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: Arc::new(RwLock::new(starting_balance)),
            prices: Arc::new(RwLock::new(HashMap::new())),
            fills: Arc::new(RwLock::new(Vec::new())),
            rejected_symbols: Arc::new(RwLock::new(HashSet::new())),
            fail_next: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.001),
        }
    }

    /// Set one symbol's fill price directly (tests).
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Toggle the simulated connectivity state.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` submissions with a retryable venue error.
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make a symbol reject with `InvalidSymbol` from now on.
    pub async fn reject_symbol(&self, symbol: &str) {
        self.rejected_symbols
            .write()
            .await
            .insert(symbol.to_string());
    }

    /// All fills recorded so far, in submission order.
    pub async fn fills(&self) -> Vec<OrderReceipt> {
        self.fills.read().await.clone()
    }

    /// Current simulated account balance.
    pub async fn balance(&self) -> Decimal {
        *self.balance.read().await
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    fn venue_name(&self) -> &'static str {
        "Paper"
    }

    async fn status(&self) -> ExchangeStatus {
        if self.offline.load(Ordering::SeqCst) {
            return ExchangeStatus {
                online: false,
                latency_ms: 0,
                balance: None,
            };
        }

        ExchangeStatus {
            online: true,
            latency_ms: 2,
            balance: Some(*self.balance.read().await),
        }
    }

    async fn place_market_order(
        &self,
        order: &OrderRequest,
    ) -> Result<OrderReceipt, ExchangeError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ExchangeError::Offline("paper venue offline".to_string()));
        }

        if self.rejected_symbols.read().await.contains(&order.symbol) {
            return Err(ExchangeError::InvalidSymbol(order.symbol.clone()));
        }

        // fetch_sub wraps on 0, so guard with a compare loop.
        loop {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(ExchangeError::Venue {
                    code: -1001,
                    msg: "injected submission failure".to_string(),
                });
            }
        }

        let price = {
            let prices = self.prices.read().await;
            match prices.get(&order.symbol) {
                Some(&p) => p,
                None => return Err(ExchangeError::InvalidSymbol(order.symbol.clone())),
            }
        };

        let notional = order.quantity * price;
        let fee = notional * self.fee_rate;
        {
            let mut balance = self.balance.write().await;
            match order.side {
                OrderSide::Buy => *balance -= notional + fee,
                OrderSide::Sell => *balance += notional - fee,
            }
        }

        let receipt = OrderReceipt {
            order_id: self.order_id_counter.fetch_add(1, Ordering::SeqCst),
            symbol: order.symbol.clone(),
            side: order.side,
            executed_qty: order.quantity,
            fill_price: price,
            filled_at: Utc::now(),
        };

        debug!(
            symbol = %receipt.symbol,
            side = ?receipt.side,
            qty = %receipt.executed_qty,
            price = %receipt.fill_price,
            "Paper fill"
        );

        self.fills.write().await.push(receipt.clone());
        Ok(receipt)
    }

    async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
        // The paper venue is a fill simulator, not a data source; market
        // data comes from the live public API even in paper mode.
        Ok(Vec::new())
    }

    async fn sync_market(&self, snapshots: &[MarketSnapshot]) {
        let mut prices = self.prices.write().await;
        for snapshot in snapshots {
            prices.insert(snapshot.symbol.clone(), snapshot.last_price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy(symbol: &str, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity,
        }
    }

    // =========================================================================
    // Fill Behavior
    // =========================================================================

    #[tokio::test]
    async fn test_fills_at_synced_price() {
        let venue = PaperExchange::new(dec!(10000));
        venue.set_price("BTCUSDT", dec!(40000)).await;

        let receipt = venue
            .place_market_order(&buy("BTCUSDT", dec!(0.01)))
            .await
            .unwrap();

        assert_eq!(receipt.fill_price, dec!(40000));
        assert_eq!(receipt.executed_qty, dec!(0.01));
        assert_eq!(venue.fills().await.len(), 1);
    }

    #[tokio::test]
    async fn test_order_ids_increment() {
        let venue = PaperExchange::new(dec!(10000));
        venue.set_price("ETHUSDT", dec!(2000)).await;

        let first = venue
            .place_market_order(&buy("ETHUSDT", dec!(0.1)))
            .await
            .unwrap();
        let second = venue
            .place_market_order(&buy("ETHUSDT", dec!(0.1)))
            .await
            .unwrap();

        assert_eq!(second.order_id, first.order_id + 1);
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip_charges_fees() {
        let venue = PaperExchange::new(dec!(1000));
        venue.set_price("SOLUSDT", dec!(100)).await;

        venue
            .place_market_order(&buy("SOLUSDT", dec!(1)))
            .await
            .unwrap();
        venue
            .place_market_order(&OrderRequest {
                symbol: "SOLUSDT".to_string(),
                side: OrderSide::Sell,
                quantity: dec!(1),
            })
            .await
            .unwrap();

        // Flat price round trip loses exactly the two 0.1% fees.
        assert_eq!(venue.balance().await, dec!(999.8));
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    #[tokio::test]
    async fn test_offline_handshake_and_submission() {
        let venue = PaperExchange::new(dec!(1000));
        venue.set_price("BTCUSDT", dec!(40000)).await;
        venue.set_offline(true);

        assert!(!venue.status().await.online);
        let err = venue
            .place_market_order(&buy("BTCUSDT", dec!(0.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Offline(_)));

        venue.set_offline(false);
        assert!(venue.status().await.online);
    }

    #[tokio::test]
    async fn test_fail_next_consumes_then_recovers() {
        let venue = PaperExchange::new(dec!(1000));
        venue.set_price("BTCUSDT", dec!(40000)).await;
        venue.fail_next_submissions(2);

        for _ in 0..2 {
            let err = venue
                .place_market_order(&buy("BTCUSDT", dec!(0.01)))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }

        assert!(venue
            .place_market_order(&buy("BTCUSDT", dec!(0.01)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rejected_symbol_is_non_retryable() {
        let venue = PaperExchange::new(dec!(1000));
        venue.set_price("DEADUSDT", dec!(1)).await;
        venue.reject_symbol("DEADUSDT").await;

        let err = venue
            .place_market_order(&buy("DEADUSDT", dec!(10)))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_symbol_rejected() {
        let venue = PaperExchange::new(dec!(1000));
        let err = venue
            .place_market_order(&buy("GHOSTUSDT", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidSymbol(_)));
    }

    // =========================================================================
    // Market Sync
    // =========================================================================

    #[tokio::test]
    async fn test_sync_market_updates_fill_prices() {
        let venue = PaperExchange::new(dec!(1000));
        venue
            .sync_market(&[MarketSnapshot {
                symbol: "BTCUSDT".to_string(),
                last_price: dec!(42000),
                high_24h: dec!(43000),
                low_24h: dec!(41000),
                change_pct_24h: dec!(1.0),
                quote_volume_24h: dec!(1_000_000),
            }])
            .await;

        let receipt = venue
            .place_market_order(&buy("BTCUSDT", dec!(0.01)))
            .await
            .unwrap();
        assert_eq!(receipt.fill_price, dec!(42000));
    }
}

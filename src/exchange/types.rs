//! Type definitions for the exchange contract and Binance spot API responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One market's 24h snapshot, the unit of input for a refresh cycle.
///
/// Snapshots are immutable within a cycle and replaced wholesale on the
/// next fetch; nothing in the engine mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub change_pct_24h: Decimal,
    pub quote_volume_24h: Decimal,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Wire representation used in signed query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// A market-order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

/// Confirmed fill returned by a venue.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub executed_qty: Decimal,
    pub fill_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Result of the connectivity/balance handshake.
///
/// The handshake never errors: an unreachable venue is reported as
/// `online: false` so callers can fail fast without a retry slot burned.
#[derive(Debug, Clone)]
pub struct ExchangeStatus {
    pub online: bool,
    pub latency_ms: u64,
    pub balance: Option<Decimal>,
}

// =============================================================================
// Binance spot wire types
// =============================================================================

/// 24-hour ticker statistics (`GET /api/v3/ticker/24hr`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotTicker24h {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    pub close_time: i64,
}

impl From<SpotTicker24h> for MarketSnapshot {
    fn from(t: SpotTicker24h) -> Self {
        Self {
            symbol: t.symbol,
            last_price: t.last_price,
            high_24h: t.high_price,
            low_24h: t.low_price,
            change_pct_24h: t.price_change_percent,
            quote_volume_24h: t.quote_volume,
        }
    }
}

/// Spot account information (`GET /api/v3/account`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAccountInfo {
    pub balances: Vec<SpotBalance>,
}

/// One asset's balance within the spot account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// Order acknowledgement (`POST /api/v3/order`, FULL response).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotOrderAck {
    pub symbol: String,
    pub order_id: u64,
    pub status: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty", with = "rust_decimal::serde::str")]
    pub cumulative_quote_qty: Decimal,
    #[serde(default)]
    pub fills: Vec<SpotOrderFill>,
}

/// Individual fill within an order acknowledgement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotOrderFill {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
}

/// Error body returned by the Binance REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

//! Binance spot REST API client.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::ExchangeApi;
use crate::exchange::types::{
    ApiErrorBody, ExchangeStatus, MarketSnapshot, OrderReceipt, OrderRequest, SpotAccountInfo,
    SpotOrderAck, SpotTicker24h,
};
use crate::utils::decimal::{round_down_to_lot, safe_div};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";

/// Binance spot API client.
pub struct BinanceSpotClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    /// Quantity step orders are floored to before submission.
    lot_size: Decimal,
}

impl BinanceSpotClient {
    /// Create a new spot client from configuration.
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let base_url = if config.testnet {
            SPOT_TESTNET_URL.to_string()
        } else {
            SPOT_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url,
            lot_size: config.lot_size,
        })
    }

    /// Override the base URL (testing against a local mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// Parse a non-success response body into the error taxonomy.
    async fn map_api_error(response: reqwest::Response, symbol: &str) -> ExchangeError {
        let status = response.status();
        match response.json::<ApiErrorBody>().await {
            Ok(body) => ExchangeError::from_api_code(body.code, body.msg, symbol),
            Err(_) => ExchangeError::Venue {
                code: status.as_u16() as i64,
                msg: format!("HTTP {status} with unparseable body"),
            },
        }
    }

    // ==================== Market Data (Public) ====================

    /// Fetch 24h ticker statistics for all spot symbols.
    #[instrument(skip(self))]
    pub async fn get_24h_tickers(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Self::map_api_error(response, "").await);
        }

        let tickers: Vec<SpotTicker24h> = response.json().await?;
        Ok(tickers.into_iter().map(MarketSnapshot::from).collect())
    }

    /// Ping the REST endpoint, returning round-trip latency.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<u64, ExchangeError> {
        let url = format!("{}/api/v3/ping", self.base_url);
        let started = Instant::now();
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ExchangeError::Offline(format!(
                "ping returned HTTP {}",
                response.status()
            )));
        }

        Ok(started.elapsed().as_millis() as u64)
    }

    // ==================== Account (Authenticated) ====================

    /// Free USDT balance of the spot account.
    #[instrument(skip(self))]
    pub async fn get_quote_balance(&self, quote_asset: &str) -> Result<Decimal, ExchangeError> {
        let query = format!("timestamp={}", Self::timestamp());
        let signature = self.sign(&query);
        let url = format!(
            "{}/api/v3/account?{}&signature={}",
            self.base_url, query, signature
        );

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::map_api_error(response, "").await);
        }

        let account: SpotAccountInfo = response.json().await?;
        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset == quote_asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    // ==================== Orders (Authenticated) ====================

    /// Place a spot market order and return the fill receipt.
    #[instrument(skip(self))]
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt, ExchangeError> {
        let quantity = round_down_to_lot(order.quantity, self.lot_size);
        let params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), order.side.as_str().to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), quantity.to_string()),
            ("newOrderRespType".to_string(), "FULL".to_string()),
            ("timestamp".to_string(), Self::timestamp().to_string()),
        ];

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query_string, signature
        );

        debug!(symbol = %order.symbol, side = ?order.side, %quantity, "Submitting market order");

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::map_api_error(response, &order.symbol).await);
        }

        let ack: SpotOrderAck = response.json().await?;
        if ack.executed_qty == Decimal::ZERO {
            return Err(ExchangeError::Venue {
                code: 0,
                msg: format!("order {} accepted but nothing filled", ack.order_id),
            });
        }

        Ok(OrderReceipt {
            order_id: ack.order_id,
            symbol: ack.symbol,
            side: order.side,
            executed_qty: ack.executed_qty,
            fill_price: safe_div(ack.cumulative_quote_qty, ack.executed_qty),
            filled_at: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeApi for BinanceSpotClient {
    fn venue_name(&self) -> &'static str {
        "Binance"
    }

    async fn status(&self) -> ExchangeStatus {
        let latency_ms = match self.ping().await {
            Ok(latency) => latency,
            Err(e) => {
                warn!("Exchange handshake failed: {e}");
                return ExchangeStatus {
                    online: false,
                    latency_ms: 0,
                    balance: None,
                };
            }
        };

        // Balance is best-effort: a public-data-only deployment has no keys.
        let balance = if self.api_key.is_empty() {
            None
        } else {
            match self.get_quote_balance("USDT").await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!("Balance query failed during handshake: {e}");
                    None
                }
            }
        };

        ExchangeStatus {
            online: true,
            latency_ms,
            balance,
        }
    }

    async fn place_market_order(
        &self,
        order: &OrderRequest,
    ) -> Result<OrderReceipt, ExchangeError> {
        self.place_order(order).await
    }

    async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
        self.get_24h_tickers().await
    }
}

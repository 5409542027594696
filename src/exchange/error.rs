//! Typed exchange errors.
//!
//! The executor's retry policy hangs off `is_retryable`: symbol-level
//! rejections are terminal and feed the market feed's exclusion list,
//! while transport and unknown venue failures are retried with backoff.

use thiserror::Error;

/// Binance error code for an unknown/invalid symbol.
const CODE_INVALID_SYMBOL: i64 = -1121;
/// Binance error codes for filter failures (lot size, min notional, precision).
const CODE_FILTER_FAILURE: i64 = -1013;
const CODE_PRECISION_OVER_MAX: i64 = -1111;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange offline: {0}")]
    Offline(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("lot size / notional filter rejected {symbol}: {msg}")]
    LotSize { symbol: String, msg: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("venue error {code}: {msg}")]
    Venue { code: i64, msg: String },
}

impl ExchangeError {
    /// Map a Binance REST error body to the taxonomy.
    pub fn from_api_code(code: i64, msg: String, symbol: &str) -> Self {
        match code {
            CODE_INVALID_SYMBOL => ExchangeError::InvalidSymbol(symbol.to_string()),
            CODE_FILTER_FAILURE | CODE_PRECISION_OVER_MAX => ExchangeError::LotSize {
                symbol: symbol.to_string(),
                msg,
            },
            _ => ExchangeError::Venue { code, msg },
        }
    }

    /// Whether a failed submission may be retried.
    ///
    /// `InvalidSymbol` and `LotSize` are properties of the symbol, not the
    /// attempt; retrying cannot succeed and the symbol should be excluded
    /// from future cycles instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExchangeError::InvalidSymbol(_) | ExchangeError::LotSize { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_faults_are_not_retryable() {
        assert!(!ExchangeError::InvalidSymbol("NOPEUSDT".into()).is_retryable());
        assert!(!ExchangeError::LotSize {
            symbol: "BTCUSDT".into(),
            msg: "MIN_NOTIONAL".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_and_venue_errors_are_retryable() {
        assert!(ExchangeError::Offline("ping failed".into()).is_retryable());
        assert!(ExchangeError::Venue {
            code: -1001,
            msg: "Internal error".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_api_code_mapping() {
        let err = ExchangeError::from_api_code(-1121, "Invalid symbol.".into(), "NOPEUSDT");
        assert!(matches!(err, ExchangeError::InvalidSymbol(s) if s == "NOPEUSDT"));

        let err = ExchangeError::from_api_code(-1013, "Filter failure: MIN_NOTIONAL".into(), "XUSDT");
        assert!(matches!(err, ExchangeError::LotSize { .. }));

        let err = ExchangeError::from_api_code(-2010, "Account has insufficient balance".into(), "XUSDT");
        assert!(matches!(err, ExchangeError::Venue { code: -2010, .. }));
    }
}

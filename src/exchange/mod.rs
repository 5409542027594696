//! Exchange connectivity.
//!
//! The engine depends only on the `ExchangeApi` contract:
//! - `BinanceSpotClient`: live REST client (market data + signed orders)
//! - `PaperExchange`: in-process fill simulator for paper mode and tests
//!
//! Market data always comes from the live public API; only order flow is
//! switched between venues by the trading mode.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceSpotClient;
pub use error::ExchangeError;
pub use mock::PaperExchange;
pub use traits::ExchangeApi;
pub use types::*;

//! # Pulse Trader
//!
//! A multi-strategy spot momentum trading engine for Binance. Three
//! strategies trade out of isolated capital pools; each cycle classifies
//! the market, ranks every opportunity, and executes the single best pick
//! with a volatility-sized trailing stop.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Binance spot API client and the paper-trading venue
//! - `market`: Ticker feed with symbol filtering and exclusion feedback
//! - `strategy`: Opportunity classification and ranking
//! - `engine`: Capital pools, order execution, positions, orchestration
//! - `persistence`: SQLite state checkpoints and activity log
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod engine;
pub mod exchange;
pub mod market;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;

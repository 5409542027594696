//! Configuration management for the trading engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where orders go. Market data always comes from the live public API;
/// paper mode only swaps the order flow for the fill simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live)
    }
}

impl Default for TradingMode {
    fn default() -> Self {
        TradingMode::Paper
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange connection and credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Market feed filtering
    #[serde(default)]
    pub market: MarketConfig,
    /// Opportunity classification thresholds
    #[serde(default)]
    pub signals: SignalConfig,
    /// Scoring weights and stop sizing
    #[serde(default)]
    pub ranker: RankerConfig,
    /// Engine cycle cadence and position management
    #[serde(default)]
    pub engine: EngineConfig,
    /// Capital pools and order execution
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// State database
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub api_secret: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// paper = simulated fills, live = real orders
    #[serde(default)]
    pub mode: TradingMode,
    /// Taker fee per fill (0.0-1.0)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Quantity step for order sizing
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Quote asset every tradeable symbol must settle in
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Base assets eligible for trading; empty means all
    #[serde(default = "default_allowed_bases")]
    pub allowed_bases: Vec<String>,
    /// Minimum 24h quote volume to consider a symbol liquid
    #[serde(default = "default_min_quote_volume")]
    pub min_quote_volume_24h: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Hourly quote volume considered "normal" for the watched universe
    #[serde(default = "default_baseline_hourly_volume")]
    pub baseline_hourly_volume: Decimal,
    /// Volume multiplier that qualifies as a surge
    #[serde(default = "default_surge_min_volume_multiplier")]
    pub surge_min_volume_multiplier: Decimal,
    /// 24h change band for surge entries (blow-offs above the cap are skipped)
    #[serde(default = "default_surge_min_change_pct")]
    pub surge_min_change_pct: Decimal,
    #[serde(default = "default_surge_max_change_pct")]
    pub surge_max_change_pct: Decimal,
    /// How close to the 24h high still counts as a breakout (percent)
    #[serde(default = "default_breakout_proximity_pct")]
    pub breakout_proximity_pct: Decimal,
    /// Minimum 24h change for a breakout entry
    #[serde(default = "default_breakout_min_change_pct")]
    pub breakout_min_change_pct: Decimal,
    /// Volume floor for breakout entries
    #[serde(default = "default_breakout_min_volume_multiplier")]
    pub breakout_min_volume_multiplier: Decimal,
    /// Momentum index below which a symbol is oversold
    #[serde(default = "default_rebound_oversold_index")]
    pub rebound_oversold_index: Decimal,
    /// Momentum samples kept per symbol
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Cycles a symbol may be absent from the feed before its history drops
    #[serde(default = "default_history_max_idle_cycles")]
    pub history_max_idle_cycles: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankerConfig {
    /// Volume multiplier that earns a full volume sub-score
    #[serde(default = "default_target_volume_multiplier")]
    pub target_volume_multiplier: Decimal,
    /// Trailing stop distance as a fraction of 24h volatility
    #[serde(default = "default_trailing_stop_volatility_factor")]
    pub trailing_stop_volatility_factor: Decimal,
    /// Bounds for the sized trailing stop (percent)
    #[serde(default = "default_min_trailing_stop_pct")]
    pub min_trailing_stop_pct: Decimal,
    #[serde(default = "default_max_trailing_stop_pct")]
    pub max_trailing_stop_pct: Decimal,
    /// Stop distance used when the ticker reports no usable range
    #[serde(default = "default_trailing_stop_pct")]
    pub default_trailing_stop_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between market scans
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Unrealized P&L percent that arms the profit lock
    #[serde(default = "default_profit_lock_threshold_pct")]
    pub profit_lock_threshold_pct: Decimal,
    /// Locked-in gain above entry once armed (percent)
    #[serde(default = "default_profit_lock_level_pct")]
    pub profit_lock_level_pct: Decimal,
    /// Cycles between full status reports
    #[serde(default = "default_report_every_cycles")]
    pub report_every_cycles: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Starting quote balance of each strategy pool
    #[serde(default = "default_initial_pool_balance")]
    pub initial_pool_balance: Decimal,
    /// Venue minimum notional per order
    #[serde(default = "default_min_trade_amount")]
    pub min_trade_amount: Decimal,
    /// Quote amount each pool keeps untouched
    #[serde(default = "default_reserve_buffer")]
    pub reserve_buffer: Decimal,
    /// Fraction of spare capital committed per entry (0.0-1.0)
    #[serde(default = "default_trade_fraction")]
    pub trade_fraction: Decimal,
    /// Maximum open plus in-flight positions per pool
    #[serde(default = "default_max_positions_per_pool")]
    pub max_positions_per_pool: usize,
    /// Order submissions after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between submissions
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Re-entry cool-down per (symbol, strategy)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Park entries for operator confirmation instead of buying directly
    #[serde(default)]
    pub manual_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1% taker)
}

fn default_lot_size() -> Decimal {
    Decimal::new(1, 5) // 0.00001
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_allowed_bases() -> Vec<String> {
    ["BTC", "ETH", "BNB", "SOL", "XRP", "ADA", "DOGE", "AVAX", "LINK", "DOT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_quote_volume() -> Decimal {
    Decimal::new(1_000_000, 0) // $1M over 24h
}

fn default_baseline_hourly_volume() -> Decimal {
    Decimal::new(50_000, 0) // $50k/h
}

fn default_surge_min_volume_multiplier() -> Decimal {
    Decimal::new(3, 0) // 3x baseline
}

fn default_surge_min_change_pct() -> Decimal {
    Decimal::new(2, 0) // +2%
}

fn default_surge_max_change_pct() -> Decimal {
    Decimal::new(15, 0) // +15%; beyond this the move is likely spent
}

fn default_breakout_proximity_pct() -> Decimal {
    Decimal::new(3, 1) // 0.3% below the 24h high
}

fn default_breakout_min_change_pct() -> Decimal {
    Decimal::new(5, 1) // +0.5%
}

fn default_breakout_min_volume_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5x baseline
}

fn default_rebound_oversold_index() -> Decimal {
    Decimal::new(35, 0) // index 35 on the 0-100 scale
}

fn default_history_len() -> usize {
    12
}

fn default_history_max_idle_cycles() -> u32 {
    10
}

fn default_target_volume_multiplier() -> Decimal {
    Decimal::new(5, 0) // 5x baseline earns the full volume score
}

fn default_trailing_stop_volatility_factor() -> Decimal {
    Decimal::new(3, 1) // 0.3 of 24h volatility
}

fn default_min_trailing_stop_pct() -> Decimal {
    Decimal::new(1, 0) // 1%
}

fn default_max_trailing_stop_pct() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_trailing_stop_pct() -> Decimal {
    Decimal::new(2, 0) // 2% fallback
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_profit_lock_threshold_pct() -> Decimal {
    Decimal::new(3, 0) // arm once up 3%
}

fn default_profit_lock_level_pct() -> Decimal {
    Decimal::new(2, 0) // then never give back below +2%
}

fn default_report_every_cycles() -> u32 {
    10
}

fn default_initial_pool_balance() -> Decimal {
    Decimal::new(1000, 0) // 1000 USDT per strategy
}

fn default_min_trade_amount() -> Decimal {
    Decimal::new(10, 0) // Binance spot minimum notional
}

fn default_reserve_buffer() -> Decimal {
    Decimal::new(5, 0) // 5 USDT stays in the pool
}

fn default_trade_fraction() -> Decimal {
    Decimal::new(40, 2) // 0.40 of spare capital per entry
}

fn default_max_positions_per_pool() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_cooldown() -> u64 {
    300 // 5 minutes
}

fn default_db_path() -> String {
    "pulse_trader.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PULSE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.execution.trade_fraction > Decimal::ZERO
                && self.execution.trade_fraction <= Decimal::ONE,
            "trade_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.execution.initial_pool_balance > self.execution.reserve_buffer,
            "initial_pool_balance must exceed reserve_buffer"
        );

        anyhow::ensure!(
            self.ranker.min_trailing_stop_pct > Decimal::ZERO
                && self.ranker.min_trailing_stop_pct <= self.ranker.max_trailing_stop_pct,
            "trailing stop bounds must satisfy 0 < min <= max"
        );

        anyhow::ensure!(
            self.signals.surge_min_change_pct < self.signals.surge_max_change_pct,
            "surge change band must satisfy min < max"
        );

        anyhow::ensure!(
            self.exchange.fee_rate >= Decimal::ZERO && self.exchange.fee_rate < Decimal::ONE,
            "fee_rate must be between 0 and 1"
        );

        anyhow::ensure!(
            !self.exchange.mode.is_live() || !self.exchange.api_key.is_empty(),
            "live mode requires API credentials"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            market: MarketConfig::default(),
            signals: SignalConfig::default(),
            ranker: RankerConfig::default(),
            engine: EngineConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            mode: TradingMode::default(),
            fee_rate: default_fee_rate(),
            lot_size: default_lot_size(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            quote_asset: default_quote_asset(),
            allowed_bases: default_allowed_bases(),
            min_quote_volume_24h: default_min_quote_volume(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            baseline_hourly_volume: default_baseline_hourly_volume(),
            surge_min_volume_multiplier: default_surge_min_volume_multiplier(),
            surge_min_change_pct: default_surge_min_change_pct(),
            surge_max_change_pct: default_surge_max_change_pct(),
            breakout_proximity_pct: default_breakout_proximity_pct(),
            breakout_min_change_pct: default_breakout_min_change_pct(),
            breakout_min_volume_multiplier: default_breakout_min_volume_multiplier(),
            rebound_oversold_index: default_rebound_oversold_index(),
            history_len: default_history_len(),
            history_max_idle_cycles: default_history_max_idle_cycles(),
        }
    }
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            target_volume_multiplier: default_target_volume_multiplier(),
            trailing_stop_volatility_factor: default_trailing_stop_volatility_factor(),
            min_trailing_stop_pct: default_min_trailing_stop_pct(),
            max_trailing_stop_pct: default_max_trailing_stop_pct(),
            default_trailing_stop_pct: default_trailing_stop_pct(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            profit_lock_threshold_pct: default_profit_lock_threshold_pct(),
            profit_lock_level_pct: default_profit_lock_level_pct(),
            report_every_cycles: default_report_every_cycles(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            initial_pool_balance: default_initial_pool_balance(),
            min_trade_amount: default_min_trade_amount(),
            reserve_buffer: default_reserve_buffer(),
            trade_fraction: default_trade_fraction(),
            max_positions_per_pool: default_max_positions_per_pool(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            cooldown_secs: default_cooldown(),
            manual_confirmation: false,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

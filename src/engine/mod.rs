//! Engine orchestration.
//!
//! One cycle: fetch the market, manage open positions against fresh prices,
//! classify and rank opportunities, execute the single best pick, then
//! checkpoint the pools. Entries run detached; exits settle inline within
//! the cycle. The market feed and the order flow are separate venue
//! handles, so paper mode can fill simulated orders against live data.

mod accounts;
mod cooldown;
mod executor;
mod ledger;

pub use accounts::{
    BalancePool, CombinedMetrics, PoolMetrics, PoolPosition, RouteRejection, StrategyAccounts,
};
pub use cooldown::CooldownTracker;
pub use executor::{
    CommandError, ExecutionRecord, ExecutionState, OrderExecutor, PendingConfirmation,
};
pub use ledger::{
    CloseCandidate, ClosedTrade, CloseReason, LedgerError, LedgerSettings, Position,
    PositionLedger,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::exchange::{ExchangeApi, OrderRequest, OrderSide};
use crate::market::MarketFeed;
use crate::persistence::{PoolCheckpoint, StateStore};
use crate::strategy::{OpportunityRanker, SignalClassifier, StrategyKind};

/// What one cycle did, for the run loop's log line.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub snapshots: usize,
    pub opportunities: usize,
    pub golden: Option<(String, StrategyKind)>,
    pub execution_started: Option<u64>,
    pub closes_settled: usize,
    pub paused: bool,
}

/// Point-in-time engine health for status displays.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub paused: bool,
    pub cycles: u64,
    pub active_executions: usize,
    pub pending_confirmations: usize,
    pub excluded_symbols: usize,
    pub combined: CombinedMetrics,
}

pub struct TradeEngine {
    feed: Arc<MarketFeed>,
    order_venue: Arc<dyn ExchangeApi>,
    accounts: Arc<StrategyAccounts>,
    executor: OrderExecutor,
    classifier: Mutex<SignalClassifier>,
    ranker: OpportunityRanker,
    cooldown: Arc<Mutex<CooldownTracker>>,
    store: Arc<StateStore>,
    paused: AtomicBool,
    cycle_count: AtomicU64,
    last_prices: RwLock<HashMap<String, Decimal>>,
}

impl TradeEngine {
    pub fn new(
        config: &Config,
        market_venue: Arc<dyn ExchangeApi>,
        order_venue: Arc<dyn ExchangeApi>,
        store: Arc<StateStore>,
    ) -> Self {
        let ledger_settings = LedgerSettings {
            exit_fee_rate: config.exchange.fee_rate,
            profit_lock_threshold_pct: config.engine.profit_lock_threshold_pct,
            profit_lock_level_pct: config.engine.profit_lock_level_pct,
        };

        let feed = Arc::new(MarketFeed::new(market_venue, config.market.clone()));
        let accounts = Arc::new(StrategyAccounts::new(&config.execution, &ledger_settings));
        let cooldown = Arc::new(Mutex::new(CooldownTracker::new(Duration::from_secs(
            config.execution.cooldown_secs,
        ))));
        let executor = OrderExecutor::new(
            order_venue.clone(),
            accounts.clone(),
            feed.clone(),
            cooldown.clone(),
            config.execution.clone(),
            config.exchange.fee_rate,
        );

        Self {
            feed,
            order_venue,
            accounts,
            executor,
            classifier: Mutex::new(SignalClassifier::new(config.signals.clone())),
            ranker: OpportunityRanker::new(config.ranker.clone()),
            cooldown,
            store,
            paused: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            last_prices: RwLock::new(HashMap::new()),
        }
    }

    /// Fold saved checkpoints back into the pools. Reservations that were
    /// in flight when the last run stopped return to available; the epoch
    /// continues where it left off.
    pub async fn restore(&self) -> Result<()> {
        let checkpoints = self.store.load_checkpoints()?;
        for (kind, cp) in checkpoints {
            let pool = self.accounts.pool(kind);
            let mut guard = pool.write().await;
            guard.available = cp.available + cp.reserved;
            guard.reserved = Decimal::ZERO;
            guard.epoch = cp.epoch;
            info!(
                strategy = %kind,
                available = %guard.available,
                epoch = guard.epoch,
                "Pool restored from checkpoint"
            );
        }
        Ok(())
    }

    /// One full scan-manage-execute pass.
    #[instrument(skip(self))]
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;
        let paused = self.paused.load(Ordering::Relaxed);
        for done in self.executor.prune_terminal().await {
            match done.state {
                ExecutionState::Executed { position_id } => self.log_event(
                    Some(done.strategy),
                    Some(&done.symbol),
                    "execution_filled",
                    &format!("position {position_id}"),
                ),
                ExecutionState::Failed { reason } => {
                    self.log_event(Some(done.strategy), Some(&done.symbol), "execution_failed", &reason)
                }
                _ => {}
            }
        }

        let snapshots = self.feed.fetch_cycle().await?;
        self.order_venue.sync_market(&snapshots).await;

        let prices: HashMap<String, Decimal> = snapshots
            .iter()
            .map(|s| (s.symbol.clone(), s.last_price))
            .collect();
        *self.last_prices.write().await = prices.clone();

        // Exits come before entries so freed capital is usable this cycle.
        let closes_settled = self.manage_positions(&prices).await;

        let mut outcome = CycleOutcome {
            snapshots: snapshots.len(),
            closes_settled,
            paused,
            ..CycleOutcome::default()
        };

        if paused {
            debug!(cycle, "Paused; entry pipeline skipped");
            self.checkpoint().await;
            return Ok(outcome);
        }

        let opportunities = self.classifier.lock().await.classify_batch(&snapshots);
        outcome.opportunities = opportunities.len();
        let ranked = self.ranker.rank(opportunities);

        if let Some(golden) = ranked.first() {
            info!(
                symbol = %golden.opportunity.symbol,
                strategy = %golden.opportunity.strategy,
                score = %golden.score,
                breakdown = %golden.rank_reason,
                stop_pct = %golden.trailing_stop_pct,
                candidates = ranked.len(),
                "Golden pick"
            );
            outcome.golden = Some((
                golden.opportunity.symbol.clone(),
                golden.opportunity.strategy,
            ));

            match self.executor.accept(golden.clone()).await {
                Ok(id) => {
                    outcome.execution_started = Some(id);
                    self.log_event(
                        Some(golden.opportunity.strategy),
                        Some(&golden.opportunity.symbol),
                        "execution_started",
                        &golden.opportunity.rationale,
                    );
                }
                Err(rejection) => {
                    debug!(
                        symbol = %golden.opportunity.symbol,
                        strategy = %golden.opportunity.strategy,
                        reason = %rejection,
                        "Entry rejected"
                    );
                    self.log_event(
                        Some(golden.opportunity.strategy),
                        Some(&golden.opportunity.symbol),
                        "entry_rejected",
                        &rejection.to_string(),
                    );
                }
            }
        }

        self.checkpoint().await;
        debug!(
            cycle,
            snapshots = outcome.snapshots,
            opportunities = outcome.opportunities,
            closes = outcome.closes_settled,
            "Cycle complete"
        );
        Ok(outcome)
    }

    /// Ratchet stops against fresh prices and settle every breach.
    async fn manage_positions(&self, prices: &HashMap<String, Decimal>) -> usize {
        let mut settled = 0;
        for &kind in StrategyKind::ALL.iter() {
            let pool = self.accounts.pool(kind);
            let candidates = pool.write().await.ledger.refresh(prices);

            for candidate in candidates {
                info!(
                    symbol = %candidate.symbol,
                    strategy = %kind,
                    position_id = candidate.position_id,
                    price = %candidate.price,
                    stop = %candidate.stop_price,
                    "Trailing stop hit"
                );
                match self
                    .close_position(kind, candidate.position_id, CloseReason::TrailingStop)
                    .await
                {
                    Ok(_) => settled += 1,
                    Err(error) => {
                        warn!(
                            symbol = %candidate.symbol,
                            position_id = candidate.position_id,
                            error = %error,
                            "Stop close failed; will retry next cycle"
                        );
                    }
                }
            }
        }
        settled
    }

    /// Sell a position at market and settle it. Used by the trailing-stop
    /// path and the manual close command alike; a failed sell leaves the
    /// position open for the next cycle.
    #[instrument(skip(self), fields(strategy = %strategy, position_id))]
    pub async fn close_position(
        &self,
        strategy: StrategyKind,
        position_id: u64,
        reason: CloseReason,
    ) -> Result<ClosedTrade> {
        let pool = self.accounts.pool(strategy);

        let (symbol, quantity, epoch) = {
            let mut guard = pool.write().await;
            let (symbol, quantity) = {
                let position = guard.ledger.mark_closing(position_id)?;
                (position.symbol.clone(), position.quantity)
            };
            (symbol, quantity, guard.epoch)
        };

        let order = OrderRequest {
            symbol: symbol.clone(),
            side: OrderSide::Sell,
            quantity,
        };
        let receipt = match self.order_venue.place_market_order(&order).await {
            Ok(receipt) => receipt,
            Err(error) => {
                pool.write().await.ledger.clear_closing(position_id);
                return Err(error.into());
            }
        };

        let trade = {
            let mut guard = pool.write().await;
            if guard.epoch != epoch {
                warn!(symbol = %symbol, position_id, "Discarding close settlement after pool reset");
                anyhow::bail!("pool reset while close was in flight");
            }
            let trade = guard.ledger.settle(position_id, receipt.fill_price, reason)?;
            guard.credit(trade.proceeds);
            trade
        };

        if let Err(error) = self.store.record_closed_trade(&trade) {
            warn!(error = %error, "Failed to persist closed trade");
        }
        self.log_event(
            Some(strategy),
            Some(&symbol),
            "position_closed",
            &format!("pnl {} ({})", trade.realized_pnl, reason.as_str()),
        );
        Ok(trade)
    }

    /// Halt new entries. Open positions keep their trailing-stop protection.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("Engine paused");
        self.log_event(None, None, "engine_paused", "");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("Engine resumed");
        self.log_event(None, None, "engine_resumed", "");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Hard reset one pool: initial balance back, book wiped, cool-downs
    /// cleared. In-flight executions self-discard via the epoch bump.
    pub async fn reset_pool(&self, strategy: StrategyKind) {
        self.accounts.reset_pool(strategy).await;
        self.cooldown.lock().await.clear_strategy(strategy);
        self.log_event(Some(strategy), None, "pool_reset", "");
        self.checkpoint().await;
    }

    pub async fn confirm_execution(&self, id: u64) -> Result<(), CommandError> {
        self.executor.confirm(id).await
    }

    pub async fn dismiss_execution(&self, id: u64) -> Result<(), CommandError> {
        self.executor.dismiss(id).await
    }

    pub async fn pending_confirmations(&self) -> Vec<PendingConfirmation> {
        self.executor.pending_confirmations().await
    }

    pub async fn positions(&self) -> Vec<PoolPosition> {
        self.accounts.positions_snapshot().await
    }

    pub async fn status(&self) -> EngineStatus {
        let prices = self.last_prices.read().await.clone();
        EngineStatus {
            paused: self.is_paused(),
            cycles: self.cycle_count.load(Ordering::Relaxed),
            active_executions: self.executor.active_count().await,
            pending_confirmations: self.executor.pending_confirmations().await.len(),
            excluded_symbols: self.feed.excluded_count().await,
            combined: self.accounts.combined_metrics(&prices).await,
        }
    }

    /// Final checkpoint before the process exits. Fills that landed after
    /// the last cycle's save are captured here.
    pub async fn shutdown(&self) {
        self.checkpoint().await;
        self.log_event(None, None, "engine_shutdown", "");
        info!("Engine state saved");
    }

    /// Write every pool's balance checkpoint; failures are logged, never
    /// fatal to the cycle.
    async fn checkpoint(&self) {
        let mut checkpoints = Vec::with_capacity(StrategyKind::ALL.len());
        for &kind in StrategyKind::ALL.iter() {
            let pool = self.accounts.pool(kind);
            let guard = pool.read().await;
            checkpoints.push(PoolCheckpoint {
                strategy: kind,
                initial_balance: guard.initial_balance,
                available: guard.available,
                reserved: guard.reserved,
                epoch: guard.epoch,
                last_saved: chrono::Utc::now(),
            });
        }

        if let Err(error) = self.store.save_checkpoints(&checkpoints) {
            warn!(error = %error, "Checkpoint save failed");
        }
    }

    fn log_event(&self, strategy: Option<StrategyKind>, symbol: Option<&str>, event: &str, detail: &str) {
        if let Err(error) =
            self.store
                .log_event(strategy.map(|s| s.as_str()), symbol, event, detail)
        {
            warn!(error = %error, event, "Activity log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::PaperExchange;
    use crate::exchange::{ExchangeError, ExchangeStatus, MarketSnapshot, OrderReceipt};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    /// Serves canned ticker batches; order flow goes to the paper venue.
    struct CannedMarket {
        snapshots: std::sync::RwLock<Vec<MarketSnapshot>>,
    }

    impl CannedMarket {
        fn new() -> Self {
            Self {
                snapshots: std::sync::RwLock::new(Vec::new()),
            }
        }

        fn set(&self, snapshots: Vec<MarketSnapshot>) {
            *self.snapshots.write().unwrap() = snapshots;
        }
    }

    #[async_trait]
    impl ExchangeApi for CannedMarket {
        fn venue_name(&self) -> &'static str {
            "canned"
        }

        async fn status(&self) -> ExchangeStatus {
            ExchangeStatus {
                online: true,
                latency_ms: 0,
                balance: None,
            }
        }

        async fn place_market_order(
            &self,
            order: &OrderRequest,
        ) -> Result<OrderReceipt, ExchangeError> {
            Err(ExchangeError::Offline(format!(
                "canned market cannot fill {}",
                order.symbol
            )))
        }

        async fn ticker_24h(&self) -> Result<Vec<MarketSnapshot>, ExchangeError> {
            Ok(self.snapshots.read().unwrap().clone())
        }
    }

    /// Tight 3% range keeps the sized trailing stop on its 1% floor, so the
    /// exit tests can reason about exact stop prices.
    fn surge_snapshot(symbol: &str, price: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: price,
            high_24h: price * dec!(1.02),
            low_24h: price * dec!(0.99),
            change_pct_24h: dec!(5),
            quote_volume_24h: dec!(4_800_000),
        }
    }

    fn flat_snapshot(symbol: &str, price: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            last_price: price,
            high_24h: price * dec!(1.02),
            low_24h: price * dec!(0.99),
            change_pct_24h: dec!(0.1),
            quote_volume_24h: dec!(4_800_000),
        }
    }

    struct Rig {
        market: Arc<CannedMarket>,
        paper: Arc<PaperExchange>,
        engine: TradeEngine,
    }

    fn rig() -> Rig {
        let mut config = Config::default();
        config.execution.initial_pool_balance = dec!(100);
        config.execution.retry_delay_secs = 1;

        let market = Arc::new(CannedMarket::new());
        let paper = Arc::new(PaperExchange::new(dec!(100_000)));
        let store = Arc::new(StateStore::new(":memory:").unwrap());
        let engine = TradeEngine::new(
            &config,
            market.clone() as Arc<dyn ExchangeApi>,
            paper.clone() as Arc<dyn ExchangeApi>,
            store,
        );
        Rig {
            market,
            paper,
            engine,
        }
    }

    async fn wait_open_count(engine: &TradeEngine, kind: StrategyKind, expected: usize) {
        for _ in 0..10_000 {
            if engine
                .accounts
                .pool(kind)
                .read()
                .await
                .ledger
                .open_count()
                == expected
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached {expected} open positions");
    }

    // =========================================================================
    // Entry Flow
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_cycle_executes_the_golden_pick() {
        let r = rig();
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);

        let outcome = r.engine.cycle().await.unwrap();
        assert_eq!(outcome.snapshots, 1);
        assert_eq!(outcome.opportunities, 1);
        assert_eq!(
            outcome.golden,
            Some(("BTCUSDT".to_string(), StrategyKind::Surge))
        );
        assert!(outcome.execution_started.is_some());

        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;
        assert_eq!(r.paper.fills().await.len(), 1);

        let pool = r.engine.accounts.pool(StrategyKind::Surge);
        let guard = pool.read().await;
        assert_eq!(guard.available.round_dp(8), dec!(62));
        assert_eq!(guard.reserved, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_best_candidate_is_bought() {
        let r = rig();
        // ETH carries far more volume, so it outranks BTC.
        let mut eth = surge_snapshot("ETHUSDT", dec!(100));
        eth.quote_volume_24h = dec!(6_000_000);
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100)), eth]);

        let outcome = r.engine.cycle().await.unwrap();
        assert_eq!(outcome.opportunities, 2);
        assert_eq!(
            outcome.golden,
            Some(("ETHUSDT".to_string(), StrategyKind::Surge))
        );

        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;
        assert_eq!(r.paper.fills().await.len(), 1);
        assert_eq!(r.paper.fills().await[0].symbol, "ETHUSDT");
    }

    // =========================================================================
    // Exit Flow
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_trailing_stop_closes_and_credits_the_pool() {
        let r = rig();
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);
        r.engine.cycle().await.unwrap();
        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;

        // Ratchet: 110 lifts the stop to 108.9.
        r.market.set(vec![flat_snapshot("BTCUSDT", dec!(110))]);
        let outcome = r.engine.cycle().await.unwrap();
        assert_eq!(outcome.closes_settled, 0);

        // 108 breaches the stop and the sell settles inline.
        r.market.set(vec![flat_snapshot("BTCUSDT", dec!(108))]);
        let outcome = r.engine.cycle().await.unwrap();
        assert_eq!(outcome.closes_settled, 1);

        let pool = r.engine.accounts.pool(StrategyKind::Surge);
        let guard = pool.read().await;
        assert_eq!(guard.ledger.open_count(), 0);
        let trades = guard.ledger.closed_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, dec!(108));
        assert!(trades[0].realized_pnl > Decimal::ZERO);
        // Proceeds landed back in available: 62 plus roughly 40.96.
        assert!(guard.available > dec!(102.9) && guard.available < dec!(103));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_close_settles_like_a_stop() {
        let r = rig();
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);
        r.engine.cycle().await.unwrap();
        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;

        let positions = r.engine.positions().await;
        assert_eq!(positions.len(), 1);
        let id = positions[0].position.id;

        let trade = r
            .engine
            .close_position(StrategyKind::Surge, id, CloseReason::Manual)
            .await
            .unwrap();
        assert_eq!(trade.reason, CloseReason::Manual);
        assert_eq!(r.engine.positions().await.len(), 0);

        // Same settlement path as the stop: proceeds credited, idempotent.
        let again = r
            .engine
            .close_position(StrategyKind::Surge, id, CloseReason::Manual)
            .await;
        assert!(again.is_err());
    }

    // =========================================================================
    // Pause Semantics
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_entries_but_not_stops() {
        let r = rig();
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);
        r.engine.cycle().await.unwrap();
        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;

        r.engine.pause();
        assert!(r.engine.is_paused());

        // A paused cycle with a crashing price still fires the stop...
        let mut crash = flat_snapshot("BTCUSDT", dec!(90));
        crash.change_pct_24h = dec!(-8);
        // ...and a fresh opportunity in the same batch is ignored.
        r.market.set(vec![crash, surge_snapshot("ETHUSDT", dec!(50))]);

        let outcome = r.engine.cycle().await.unwrap();
        assert!(outcome.paused);
        assert_eq!(outcome.closes_settled, 1);
        assert_eq!(outcome.opportunities, 0);
        assert!(outcome.execution_started.is_none());

        r.engine.resume();
        let outcome = r.engine.cycle().await.unwrap();
        assert!(!outcome.paused);
        assert!(outcome.opportunities > 0);
    }

    // =========================================================================
    // Pool Reset
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_reset_pool_returns_to_initial_state() {
        let r = rig();
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);
        r.engine.cycle().await.unwrap();
        wait_open_count(&r.engine, StrategyKind::Surge, 1).await;

        r.engine.reset_pool(StrategyKind::Surge).await;

        let pool = r.engine.accounts.pool(StrategyKind::Surge);
        let guard = pool.read().await;
        assert_eq!(guard.available, dec!(100));
        assert_eq!(guard.epoch, 1);
        assert_eq!(guard.ledger.open_count(), 0);

        // The cool-down cleared with the reset, so the symbol is
        // immediately eligible again.
        drop(guard);
        r.market.set(vec![surge_snapshot("BTCUSDT", dec!(100))]);
        let outcome = r.engine.cycle().await.unwrap();
        assert!(outcome.execution_started.is_some());
    }

    // =========================================================================
    // Restore
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_restore_folds_reserved_back_into_available() {
        let store = Arc::new(StateStore::new(":memory:").unwrap());
        store
            .save_checkpoints(&[PoolCheckpoint {
                strategy: StrategyKind::Surge,
                initial_balance: dec!(100),
                available: dec!(62),
                reserved: dec!(38),
                epoch: 3,
                last_saved: chrono::Utc::now(),
            }])
            .unwrap();

        let mut config = Config::default();
        config.execution.initial_pool_balance = dec!(100);
        let market = Arc::new(CannedMarket::new());
        let paper = Arc::new(PaperExchange::new(dec!(100_000)));
        let engine = TradeEngine::new(
            &config,
            market as Arc<dyn ExchangeApi>,
            paper as Arc<dyn ExchangeApi>,
            store,
        );
        engine.restore().await.unwrap();

        let pool = engine.accounts.pool(StrategyKind::Surge);
        let guard = pool.read().await;
        assert_eq!(guard.available, dec!(100));
        assert_eq!(guard.reserved, Decimal::ZERO);
        assert_eq!(guard.epoch, 3);
    }
}

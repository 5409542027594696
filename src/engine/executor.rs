//! Order execution state machine.
//!
//! An accepted opportunity reserves its funds up front, then runs in a
//! spawned task: one venue handshake, then up to `1 + max_retries` order
//! submissions with a fixed delay between them. Non-retryable venue errors
//! fail immediately and feed the symbol back to the market-feed exclusion
//! list. Every task ends in exactly one terminal state, and a failed one
//! returns the reservation to the pool it came from.
//!
//! Pools can be hard-reset while a task is mid-flight. The task carries the
//! pool epoch it reserved under and compares before touching balances; on a
//! mismatch the result is discarded instead of corrupting the fresh pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::engine::accounts::{RouteRejection, StrategyAccounts};
use crate::engine::cooldown::CooldownTracker;
use crate::exchange::{ExchangeApi, ExchangeError, OrderRequest, OrderSide};
use crate::market::MarketFeed;
use crate::strategy::{RankedOpportunity, StrategyKind};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no pending execution {0}")]
    UnknownExecution(u64),
    #[error(transparent)]
    Rejected(#[from] RouteRejection),
}

/// Lifecycle of one accepted opportunity. Exactly one of `Executed` or
/// `Failed` terminates it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    AwaitingConfirmation,
    Buying,
    Retrying { attempt: u32 },
    Executed { position_id: u64 },
    Failed { reason: String },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Executed { .. } | ExecutionState::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: u64,
    pub symbol: String,
    pub strategy: StrategyKind,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
}

/// An opportunity parked until the operator confirms or dismisses it.
/// No funds are reserved while parked; the reservation happens on confirm
/// against the pool state of that moment.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub id: u64,
    pub pick: RankedOpportunity,
    pub queued_at: DateTime<Utc>,
}

struct ExecutionJob {
    id: u64,
    symbol: String,
    strategy: StrategyKind,
    price_hint: Decimal,
    trailing_stop_pct: Decimal,
    reserve: Decimal,
    epoch: u64,
}

#[derive(Clone)]
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    accounts: Arc<StrategyAccounts>,
    feed: Arc<MarketFeed>,
    cooldown: Arc<Mutex<CooldownTracker>>,
    config: ExecutionConfig,
    fee_rate: Decimal,
    registry: Arc<RwLock<HashMap<u64, ExecutionRecord>>>,
    pending: Arc<RwLock<HashMap<u64, PendingConfirmation>>>,
    next_id: Arc<AtomicU64>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        accounts: Arc<StrategyAccounts>,
        feed: Arc<MarketFeed>,
        cooldown: Arc<Mutex<CooldownTracker>>,
        config: ExecutionConfig,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            exchange,
            accounts,
            feed,
            cooldown,
            config,
            fee_rate,
            registry: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Route an opportunity into execution (or the confirmation queue).
    /// Rejections leave every balance untouched.
    pub async fn accept(&self, pick: RankedOpportunity) -> Result<u64, RouteRejection> {
        let symbol = pick.opportunity.symbol.clone();
        let strategy = pick.opportunity.strategy;

        if self.cooldown.lock().await.is_active(&symbol, strategy) {
            return Err(RouteRejection::CoolingDown);
        }

        if self.config.manual_confirmation {
            if self.pending_holds(&symbol, strategy).await {
                return Err(RouteRejection::DuplicateSymbol);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.insert_record(id, &symbol, strategy, ExecutionState::AwaitingConfirmation)
                .await;
            self.pending.write().await.insert(
                id,
                PendingConfirmation {
                    id,
                    pick,
                    queued_at: Utc::now(),
                },
            );
            info!(symbol = %symbol, strategy = %strategy, execution_id = id, "Awaiting confirmation");
            return Ok(id);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert_record(id, &symbol, strategy, ExecutionState::Buying).await;
        if let Err(rejection) = self.reserve_and_spawn(id, pick).await {
            self.registry.write().await.remove(&id);
            return Err(rejection);
        }
        Ok(id)
    }

    /// Operator approves a parked opportunity. The reservation happens now,
    /// so a queue entry that outlived its pool's funds rejects here.
    pub async fn confirm(&self, id: u64) -> Result<(), CommandError> {
        let parked = self
            .pending
            .write()
            .await
            .remove(&id)
            .ok_or(CommandError::UnknownExecution(id))?;

        self.set_state(id, ExecutionState::Buying).await;
        if let Err(rejection) = self.reserve_and_spawn(id, parked.pick).await {
            self.set_state(
                id,
                ExecutionState::Failed {
                    reason: rejection.to_string(),
                },
            )
            .await;
            return Err(rejection.into());
        }
        Ok(())
    }

    /// Operator declines a parked opportunity. The pair cools down so the
    /// next cycle does not immediately re-queue it.
    pub async fn dismiss(&self, id: u64) -> Result<(), CommandError> {
        let parked = self
            .pending
            .write()
            .await
            .remove(&id)
            .ok_or(CommandError::UnknownExecution(id))?;

        let symbol = &parked.pick.opportunity.symbol;
        let strategy = parked.pick.opportunity.strategy;
        self.cooldown.lock().await.mark(symbol, strategy);
        self.set_state(
            id,
            ExecutionState::Failed {
                reason: "dismissed by operator".to_string(),
            },
        )
        .await;
        info!(symbol = %symbol, strategy = %strategy, execution_id = id, "Dismissed");
        Ok(())
    }

    pub async fn execution(&self, id: u64) -> Option<ExecutionRecord> {
        self.registry.read().await.get(&id).cloned()
    }

    pub async fn pending_confirmations(&self) -> Vec<PendingConfirmation> {
        let mut parked: Vec<_> = self.pending.read().await.values().cloned().collect();
        parked.sort_by_key(|p| p.id);
        parked
    }

    /// Executions still moving through the pipeline.
    pub async fn active_count(&self) -> usize {
        self.registry
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Drop terminal records, handing them back so the caller can log the
    /// outcomes; called once per cycle to keep the registry bounded.
    pub async fn prune_terminal(&self) -> Vec<ExecutionRecord> {
        let mut pruned = Vec::new();
        self.registry.write().await.retain(|_, r| {
            if r.state.is_terminal() {
                pruned.push(r.clone());
                false
            } else {
                true
            }
        });
        pruned.sort_by_key(|r| r.id);
        pruned
    }

    async fn pending_holds(&self, symbol: &str, strategy: StrategyKind) -> bool {
        self.pending.read().await.values().any(|p| {
            p.pick.opportunity.symbol == symbol && p.pick.opportunity.strategy == strategy
        })
    }

    async fn insert_record(
        &self,
        id: u64,
        symbol: &str,
        strategy: StrategyKind,
        state: ExecutionState,
    ) {
        self.registry.write().await.insert(
            id,
            ExecutionRecord {
                id,
                symbol: symbol.to_string(),
                strategy,
                state,
                started_at: Utc::now(),
            },
        );
    }

    async fn set_state(&self, id: u64, state: ExecutionState) {
        if let Some(record) = self.registry.write().await.get_mut(&id) {
            record.state = state;
        }
    }

    /// Reserve under the pool lock and detach the buy task.
    async fn reserve_and_spawn(&self, id: u64, pick: RankedOpportunity) -> Result<(), RouteRejection> {
        let symbol = pick.opportunity.symbol.clone();
        let strategy = pick.opportunity.strategy;
        let pool = self.accounts.pool(strategy);

        let (reserve, epoch) = {
            let mut guard = pool.write().await;
            let reserve = guard.try_reserve(&symbol)?;
            (reserve, guard.epoch)
        };

        info!(
            symbol = %symbol,
            strategy = %strategy,
            execution_id = id,
            reserve = %reserve,
            score = %pick.score,
            "Entry reserved"
        );

        let job = ExecutionJob {
            id,
            symbol,
            strategy,
            price_hint: pick.opportunity.price,
            trailing_stop_pct: pick.trailing_stop_pct,
            reserve,
            epoch,
        };
        let this = self.clone();
        tokio::spawn(async move { this.run(job).await });
        Ok(())
    }

    /// The buy pipeline: handshake, then the submission loop.
    async fn run(self, job: ExecutionJob) {
        let status = self.exchange.status().await;
        if !status.online {
            // The handshake guards the retry budget: an unreachable venue
            // fails the execution without burning submission attempts.
            self.fail(&job, "venue offline at handshake".to_string()).await;
            return;
        }

        let quantity = job.reserve / (Decimal::ONE + self.fee_rate) / job.price_hint;
        let order = OrderRequest {
            symbol: job.symbol.clone(),
            side: OrderSide::Buy,
            quantity,
        };

        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.set_state(job.id, ExecutionState::Retrying { attempt }).await;
                tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
            }

            match self.exchange.place_market_order(&order).await {
                Ok(receipt) => {
                    let spent = receipt.fill_price * receipt.executed_qty
                        * (Decimal::ONE + self.fee_rate);
                    self.book_fill(&job, receipt.executed_qty, receipt.fill_price, spent)
                        .await;
                    return;
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        symbol = %job.symbol,
                        execution_id = job.id,
                        attempt,
                        error = %error,
                        "Order submission failed"
                    );
                    last_error = error.to_string();
                }
                Err(error) => {
                    if matches!(
                        error,
                        ExchangeError::InvalidSymbol(_) | ExchangeError::LotSize { .. }
                    ) {
                        self.feed.exclude(&job.symbol, &error.to_string()).await;
                    }
                    self.fail(&job, format!("rejected by venue: {error}")).await;
                    return;
                }
            }
        }

        self.fail(&job, format!("retry budget exhausted: {last_error}")).await;
    }

    /// Convert the reservation into a booked position, unless the pool was
    /// reset underneath us.
    async fn book_fill(&self, job: &ExecutionJob, quantity: Decimal, fill_price: Decimal, spent: Decimal) {
        let pool = self.accounts.pool(job.strategy);
        let mut guard = pool.write().await;

        if guard.epoch != job.epoch {
            warn!(
                symbol = %job.symbol,
                execution_id = job.id,
                "Discarding fill after pool reset"
            );
            self.set_state(
                job.id,
                ExecutionState::Failed {
                    reason: "pool reset during execution".to_string(),
                },
            )
            .await;
            return;
        }

        guard.commit_entry(&job.symbol, job.reserve, spent);
        match guard.ledger.open(
            &job.symbol,
            job.strategy,
            quantity,
            fill_price,
            spent,
            job.trailing_stop_pct,
        ) {
            Ok(position_id) => {
                drop(guard);
                self.cooldown.lock().await.mark(&job.symbol, job.strategy);
                self.set_state(job.id, ExecutionState::Executed { position_id }).await;
            }
            Err(error) => {
                // Cannot happen while the pending-symbol guard holds, but a
                // booking failure must still return the funds.
                guard.credit(spent);
                drop(guard);
                warn!(symbol = %job.symbol, execution_id = job.id, error = %error, "Booking failed");
                self.set_state(
                    job.id,
                    ExecutionState::Failed {
                        reason: error.to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Terminal failure: restore the reservation (epoch permitting) and
    /// start the cool-down.
    async fn fail(&self, job: &ExecutionJob, reason: String) {
        let pool = self.accounts.pool(job.strategy);
        {
            let mut guard = pool.write().await;
            if guard.epoch == job.epoch {
                guard.release(&job.symbol, job.reserve);
            }
        }

        self.cooldown.lock().await.mark(&job.symbol, job.strategy);
        warn!(
            symbol = %job.symbol,
            strategy = %job.strategy,
            execution_id = job.id,
            reason = %reason,
            "Execution failed"
        );
        self.set_state(job.id, ExecutionState::Failed { reason }).await;
    }
}

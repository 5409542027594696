//! Pulse Trader - Main Entry Point
//!
//! Runs the scan/rank/execute loop against Binance spot, with paper trading
//! as the default mode and a small stdin command surface for the operator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pulse_trader::engine::{CloseReason, CycleOutcome, EngineStatus, PoolPosition, TradeEngine};
use pulse_trader::exchange::{BinanceSpotClient, ExchangeApi, PaperExchange};
use pulse_trader::persistence::StateStore;
use pulse_trader::strategy::StrategyKind;
use pulse_trader::utils::decimal::safe_div;
use pulse_trader::Config;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Pulse Trader CLI
#[derive(Parser)]
#[command(name = "pulse-trader")]
#[command(version, about = "Momentum trading engine for Binance spot markets")]
struct Cli {
    /// Wipe persisted checkpoints and history before starting
    #[arg(long)]
    fresh: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lifetime statistics from persisted state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "pulse_trader.db")]
        db: String,

        /// Include the recent activity log
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Counters for the run loop's periodic report.
#[derive(Debug)]
struct RunStats {
    start_time: DateTime<Utc>,
    cycles: u64,
    entries_started: u64,
    exits_settled: u64,
    errors: u64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            cycles: 0,
            entries_started: 0,
            exits_settled: 0,
            errors: 0,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    if let Some(Commands::Status { db, verbose }) = cli.command {
        return show_status(&db, verbose);
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Pulse Trader v{} - Spot Momentum Engine        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;

    if config.exchange.mode.is_live() {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
    } else {
        info!("📝 PAPER TRADING MODE - Simulated fills against live market data");
    }
    log_config(&config);

    let store = Arc::new(StateStore::new(&config.persistence.db_path)?);
    if cli.fresh {
        store.clear_all()?;
        info!("🧹 [INIT] Persisted state cleared, starting fresh");
    }

    // Market data always comes from the live public API. Order flow goes to
    // the same client in live mode, or to the in-process simulator in paper
    // mode.
    let client = Arc::new(BinanceSpotClient::new(&config.exchange)?);
    let market_venue: Arc<dyn ExchangeApi> = client.clone();
    let order_venue: Arc<dyn ExchangeApi> = if config.exchange.mode.is_live() {
        client
    } else {
        let paper_funds =
            config.execution.initial_pool_balance * Decimal::from(StrategyKind::ALL.len());
        Arc::new(PaperExchange::new(paper_funds))
    };

    let probe = order_venue.status().await;
    if probe.online {
        info!(
            "✅ [INIT] {} reachable ({}ms{})",
            order_venue.venue_name(),
            probe.latency_ms,
            probe
                .balance
                .map(|b| format!(", balance ${b:.2}"))
                .unwrap_or_default()
        );
    } else {
        warn!(
            "⚠️  [INIT] {} unreachable; executions will fail fast until it recovers",
            order_venue.venue_name()
        );
    }

    let engine = Arc::new(TradeEngine::new(
        &config,
        market_venue,
        order_venue,
        Arc::clone(&store),
    ));
    engine.restore().await?;

    let lifetime = store.lifetime_stats()?;
    if !lifetime.is_empty() {
        let trades: u64 = lifetime.iter().map(|row| row.trades).sum();
        let pnl: Decimal = lifetime.iter().map(|row| row.realized_pnl).sum();
        info!("📒 [INIT] Prior sessions: {trades} closed trades, PnL ${pnl:.4}");
    }

    // Operator commands arrive as stdin lines.
    let (command_tx, mut command_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if command_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut cycle_timer =
        tokio::time::interval(Duration::from_secs(config.engine.cycle_interval_secs));
    cycle_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let report_every = u64::from(config.engine.report_every_cycles.max(1));

    info!(
        "🚀 Starting trading loop (one cycle every {}s)",
        config.engine.cycle_interval_secs
    );
    info!("   Commands: pause, resume, status, confirm <id>, dismiss <id>, close <strategy> <id>, reset <strategy>, quit");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut stats = RunStats::default();

    loop {
        tokio::select! {
            _ = cycle_timer.tick() => {
                stats.cycles += 1;
                match engine.cycle().await {
                    Ok(outcome) => {
                        stats.exits_settled += outcome.closes_settled as u64;
                        if outcome.execution_started.is_some() {
                            stats.entries_started += 1;
                        }
                        log_cycle(&stats, &outcome);
                    }
                    Err(e) => {
                        stats.errors += 1;
                        error!("❌ [CYCLE {}] Failed: {e:#}", stats.cycles);
                    }
                }

                for pending in engine.pending_confirmations().await {
                    info!(
                        "⏳ [CONFIRM] #{} {} via {} (score {}) - type 'confirm {}' or 'dismiss {}'",
                        pending.id,
                        pending.pick.opportunity.symbol,
                        pending.pick.opportunity.strategy,
                        pending.pick.score,
                        pending.id,
                        pending.id
                    );
                }

                if stats.cycles % report_every == 0 {
                    log_report(&stats, &engine.status().await, &engine.positions().await);
                }
            }
            Some(line) = command_rx.recv() => {
                if !handle_command(&engine, &stats, line.trim()).await {
                    info!("🛑 Quit requested");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
        }
    }

    engine.shutdown().await;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🏁 Final Statistics:");
    log_report(&stats, &engine.status().await, &engine.positions().await);

    info!("👋 Pulse Trader shutdown complete");
    Ok(())
}

/// One operator command line. Returns false when the loop should exit.
async fn handle_command(engine: &TradeEngine, stats: &RunStats, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return true;
    };

    match verb {
        "pause" => engine.pause(),
        "resume" => engine.resume(),
        "status" => {
            log_report(stats, &engine.status().await, &engine.positions().await);
            for pending in engine.pending_confirmations().await {
                info!(
                    "⏳ [CONFIRM] #{} {} via {} queued at {}",
                    pending.id,
                    pending.pick.opportunity.symbol,
                    pending.pick.opportunity.strategy,
                    pending.queued_at.format("%H:%M:%S")
                );
            }
        }
        "confirm" => match parts.next().and_then(|s| s.parse::<u64>().ok()) {
            Some(id) => match engine.confirm_execution(id).await {
                Ok(()) => info!("✅ [CONFIRM] Execution #{id} released to the venue"),
                Err(e) => warn!("⚠️  [CONFIRM] {e}"),
            },
            None => warn!("⚠️  Usage: confirm <id>"),
        },
        "dismiss" => match parts.next().and_then(|s| s.parse::<u64>().ok()) {
            Some(id) => match engine.dismiss_execution(id).await {
                Ok(()) => info!("✅ [DISMISS] Execution #{id} dropped, symbol cooling down"),
                Err(e) => warn!("⚠️  [DISMISS] {e}"),
            },
            None => warn!("⚠️  Usage: dismiss <id>"),
        },
        "close" => {
            let strategy = parts
                .next()
                .and_then(|s| s.to_lowercase().parse::<StrategyKind>().ok());
            let id = parts.next().and_then(|s| s.parse::<u64>().ok());
            match (strategy, id) {
                (Some(strategy), Some(id)) => {
                    match engine.close_position(strategy, id, CloseReason::Manual).await {
                        Ok(trade) => info!(
                            "✅ [CLOSE] {} settled at ${}: {:+.4} ({:+.2}%)",
                            trade.symbol, trade.exit_price, trade.realized_pnl, trade.pnl_pct
                        ),
                        Err(e) => warn!("⚠️  [CLOSE] {e:#}"),
                    }
                }
                _ => warn!("⚠️  Usage: close <surge|breakout|rebound> <position-id>"),
            }
        }
        "reset" => match parts
            .next()
            .and_then(|s| s.to_lowercase().parse::<StrategyKind>().ok())
        {
            Some(strategy) => {
                engine.reset_pool(strategy).await;
                info!("✅ [RESET] {strategy} pool restored to its initial balance");
            }
            None => warn!("⚠️  Usage: reset <surge|breakout|rebound>"),
        },
        "quit" | "exit" => return false,
        "help" => {
            info!("Commands:");
            info!("   pause / resume            - halt or restart new entries");
            info!("   status                    - print the status report now");
            info!("   confirm <id>              - release a parked execution");
            info!("   dismiss <id>              - drop a parked execution");
            info!("   close <strategy> <id>     - sell a position at market");
            info!("   reset <strategy>          - restore a pool to its initial balance");
            info!("   quit                      - save and exit");
        }
        other => warn!("⚠️  Unknown command '{other}' (try 'help')"),
    }
    true
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // File appender for detailed logs
    let file_appender = tracing_appender::rolling::hourly("logs", "pulse-trader.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pulse_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Pool Balance: ${} per strategy",
        config.execution.initial_pool_balance
    );
    info!(
        "   Trade Fraction: {:.0}% (buffer ${}, min ${})",
        config.execution.trade_fraction * dec!(100),
        config.execution.reserve_buffer,
        config.execution.min_trade_amount
    );
    info!(
        "   Max Positions/Pool: {}",
        config.execution.max_positions_per_pool
    );
    info!(
        "   Retry Budget: {} (delay {}s)",
        config.execution.max_retries, config.execution.retry_delay_secs
    );
    info!("   Cool-down: {}s", config.execution.cooldown_secs);
    info!(
        "   Manual Confirmation: {}",
        if config.execution.manual_confirmation {
            "on"
        } else {
            "off"
        }
    );
    info!(
        "   Profit Lock: arms above {:.1}%, floors at {:.1}%",
        config.engine.profit_lock_threshold_pct, config.engine.profit_lock_level_pct
    );
    info!(
        "   Min Quote Volume 24h: ${:.0}M",
        config.market.min_quote_volume_24h / dec!(1_000_000)
    );
}

/// One line per cycle so the log tells the story at a glance.
fn log_cycle(stats: &RunStats, outcome: &CycleOutcome) {
    if outcome.paused {
        info!(
            "⏸️  [CYCLE {}] Paused | {} symbols | {} stops settled",
            stats.cycles, outcome.snapshots, outcome.closes_settled
        );
    } else if let Some((symbol, strategy)) = &outcome.golden {
        info!(
            "📡 [CYCLE {}] {} symbols, {} opportunities | golden: {} via {}{}",
            stats.cycles,
            outcome.snapshots,
            outcome.opportunities,
            symbol,
            strategy,
            if outcome.execution_started.is_some() {
                ""
            } else {
                " (rejected)"
            }
        );
    } else {
        info!(
            "📡 [CYCLE {}] {} symbols scanned, no qualifying opportunities",
            stats.cycles, outcome.snapshots
        );
    }
}

/// Log the full status report across all pools.
fn log_report(stats: &RunStats, status: &EngineStatus, positions: &[PoolPosition]) {
    let runtime = Utc::now() - stats.start_time;
    let hours = runtime.num_hours();
    let minutes = runtime.num_minutes() % 60;
    let combined = &status.combined;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                    STATUS REPORT                           ║");
    info!("╠════════════════════════════════════════════════════════════╣");
    info!(
        "║ Runtime: {}h {}m | Cycles: {} | Paused: {}",
        hours,
        minutes,
        status.cycles,
        if status.paused { "yes" } else { "no" }
    );
    info!("╠════════════════════════════════════════════════════════════╣");
    info!("║ 💰 POOLS                                                   ║");
    for pool in &combined.pools {
        info!(
            "║    {:<9} equity ${:>10.2} ({:+.2}%) | avail ${:>9.2} | {} open | {} closed | win {:>5.1}%",
            pool.strategy.to_string(),
            pool.equity,
            pool.roi_pct,
            pool.available,
            pool.open_positions,
            pool.trades_closed,
            pool.win_rate_pct
        );
    }
    info!("╠════════════════════════════════════════════════════════════╣");
    info!("║ 📊 COMBINED                                                ║");
    info!(
        "║    Total Equity:        ${:>12.2} ({:+.2}%)",
        combined.total_equity, combined.roi_pct
    );
    info!(
        "║    Available:           ${:>12.2}",
        combined.total_available
    );
    info!(
        "║    Realized PnL:        ${:>12.4}",
        combined.total_realized_pnl
    );
    info!(
        "║    Unrealized PnL:      ${:>12.4}",
        combined.total_unrealized_pnl
    );
    info!("╠════════════════════════════════════════════════════════════╣");
    info!("║ 📈 ACTIVITY                                                ║");
    info!("║    Entries Started:    {:>6}", stats.entries_started);
    info!("║    Exits Settled:      {:>6}", stats.exits_settled);
    info!("║    Executions Active:  {:>6}", status.active_executions);
    info!("║    Awaiting Confirm:   {:>6}", status.pending_confirmations);
    info!("║    Excluded Symbols:   {:>6}", status.excluded_symbols);
    info!("║    Cycle Errors:       {:>6}", stats.errors);
    info!("╚════════════════════════════════════════════════════════════╝");

    if !positions.is_empty() {
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║                   OPEN POSITIONS                           ║");
        info!("╠════════════════════════════════════════════════════════════╣");
        for entry in positions {
            let p = &entry.position;
            info!(
                "║ #{:<3} {:<10} [{:<8}] qty {} @ ${} | stop ${:.4}{}",
                p.id,
                p.symbol,
                entry.strategy.to_string(),
                p.quantity,
                p.entry_price,
                p.stop_price,
                if p.profit_locked { " 🔒" } else { "" }
            );
        }
        info!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Show lifetime statistics from persisted state, without starting the engine.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                  PULSE TRADER STATUS                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {db_path}");
        println!("   The engine has not run yet, or the database path is wrong.");
        return Ok(());
    }

    let store = StateStore::new(db_path)?;

    let lifetime = store.lifetime_stats()?;
    if lifetime.is_empty() {
        println!("\n📊 No closed trades recorded yet.");
    } else {
        println!("\n📊 Lifetime by Strategy");
        let mut total_pnl = Decimal::ZERO;
        let mut total_trades = 0u64;
        for row in &lifetime {
            let win_rate = safe_div(
                Decimal::from(row.wins) * dec!(100),
                Decimal::from(row.trades),
            );
            println!(
                "   ├─ {:<10} {:>4} trades | {:>3} wins ({:>5.1}%) | PnL ${:.4}",
                row.strategy, row.trades, row.wins, win_rate, row.realized_pnl
            );
            total_pnl += row.realized_pnl;
            total_trades += row.trades;
        }
        println!(
            "   └─ TOTAL      {total_trades:>4} trades | PnL ${total_pnl:.4}"
        );
    }

    let trades = store.recent_trades(10)?;
    if !trades.is_empty() {
        println!("\n📜 Recent Trades");
        for (closed_at, strategy, symbol, pnl, reason) in &trades {
            println!(
                "   ├─ {} {:<10} [{:<8}] {:+.4} ({})",
                closed_at.format("%Y-%m-%d %H:%M"),
                symbol,
                strategy,
                pnl,
                reason
            );
        }
    }

    if verbose {
        let activity = store.recent_activity(20)?;
        if !activity.is_empty() {
            println!("\n🗒  Recent Activity");
            for entry in &activity {
                let scope = match (&entry.strategy, &entry.symbol) {
                    (Some(s), Some(sym)) => format!("{s}/{sym}"),
                    (Some(s), None) => s.clone(),
                    (None, Some(sym)) => sym.clone(),
                    (None, None) => String::from("-"),
                };
                println!(
                    "   ├─ {} [{:<16}] {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    scope,
                    entry.event,
                    entry.detail
                );
            }
        }
    }

    println!();
    Ok(())
}

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use helmsman_bot::{
    api_server::{ApiServer, OperatorState},
    config::AppConfig,
    events::{EventLog, EventType},
    exchange::PaperExchangeAdapter,
    execution::{
        EntryEvaluator, ExitEvaluator, OperationModeController, OrderRouter,
        PortfolioRiskEnforcer, PositionRegistry, SafeModeController,
    },
    market_data::MarketDataHub,
    models::TradeMode,
    strategy::StrategyService,
    utils::logging,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Strategy execution engine", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level override
    #[arg(short, long)]
    log_level: Option<String>,

    /// Operator API port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Strategy file path override
    #[arg(long)]
    strategy_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_from_path(&args.config)
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;
    // CLI overrides sit above env and file.
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(path) = args.strategy_path {
        config.strategy.watch_path = path;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let _log_guard = logging::init_logging(&config.logging.level, &config.logging.dir, "engine")?;
    info!("🎯 Helmsman execution engine starting (v{})", helmsman_bot::VERSION);
    info!("Config file: {}", args.config);

    let state_dir = std::path::PathBuf::from(&config.execution.state_dir);
    let events = Arc::new(EventLog::open(state_dir.join("events.log"))?);
    let registry = Arc::new(PositionRegistry::open(&state_dir)?);
    let safe_mode = Arc::new(SafeModeController::new(events.clone()));
    let mode = Arc::new(OperationModeController::new(TradeMode::Paper, events.clone()));
    let risk = Arc::new(PortfolioRiskEnforcer::new(
        registry.clone(),
        safe_mode.clone(),
        events.clone(),
    ));

    let paper = Arc::new(PaperExchangeAdapter::new(
        config.execution.initial_paper_balance_usd,
        config.execution.paper_fee_bps,
        config.execution.min_order_quantity,
    ));
    // Live adapter wiring is a deployment concern; until one is configured
    // the router refuses live dispatch.
    let router = Arc::new(OrderRouter::new(
        paper.clone(),
        None,
        mode.clone(),
        registry.clone(),
        events.clone(),
    ));

    let strategy = Arc::new(StrategyService::new(
        &config.strategy.watch_path,
        config.strategy.reload_latency_ms,
        config.strategy.validity_check_interval_ms,
        events.clone(),
    ));
    let hub = Arc::new(MarketDataHub::new(paper.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe everything before the initial load so the first swap
    // notification is never missed.
    let hub_swaps = strategy.subscribe_swaps();
    let entry_swaps = strategy.subscribe_swaps();
    let exit_swaps = strategy.subscribe_swaps();

    tokio::spawn(strategy.clone().run(shutdown_rx.clone()));
    tokio::spawn(hub.clone().run(hub_swaps, shutdown_rx.clone()));

    // Entry evaluator task: one short evaluation per tick.
    {
        let mut evaluator = EntryEvaluator::new(
            strategy.clone(),
            registry.clone(),
            risk.clone(),
            safe_mode.clone(),
            router.clone(),
            events.clone(),
        );
        let hub = hub.clone();
        let mut ticks = hub.subscribe();
        let mut swaps = entry_swaps;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    swap = swaps.recv() => {
                        if let Ok(document) = swap {
                            evaluator.on_strategy_swap(&document);
                        }
                    }
                    tick = ticks.recv() => {
                        match tick {
                            Ok(_) => evaluator.evaluate_tick(&hub.snapshot_map()).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Entry evaluator lagged {} ticks", n);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    // Exit evaluator task.
    {
        let mut evaluator = ExitEvaluator::new(
            strategy.clone(),
            registry.clone(),
            safe_mode.clone(),
            router.clone(),
            events.clone(),
        );
        let hub = hub.clone();
        let mut ticks = hub.subscribe();
        let mut swaps = exit_swaps;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    swap = swaps.recv() => {
                        if let Ok(document) = swap {
                            evaluator.on_strategy_swap(&document);
                        }
                    }
                    tick = ticks.recv() => {
                        match tick {
                            Ok(_) => evaluator.evaluate_tick(&hub.snapshot_map()).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Exit evaluator lagged {} ticks", n);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    // Risk enforcer: recomputed after each fill and periodically.
    {
        let strategy = strategy.clone();
        let risk = risk.clone();
        let router = router.clone();
        let hub = hub.clone();
        let mut fills = events.subscribe();
        let mut shutdown = shutdown_rx.clone();
        let interval = config.execution.risk_check_interval_seconds.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            loop {
                let recompute = tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                        false
                    }
                    _ = ticker.tick() => true,
                    event = fills.recv() => matches!(
                        event,
                        Ok(e) if e.event_type == EventType::OrderFilled
                    ),
                };
                if !recompute {
                    continue;
                }
                let Some(document) = strategy.snapshot().await.document else {
                    continue;
                };
                let cash = match router.available_cash().await {
                    Ok(cash) => cash,
                    Err(e) => {
                        warn!("Risk recompute skipped, balances unavailable: {}", e);
                        continue;
                    }
                };
                let marks: HashMap<String, f64> = hub
                    .snapshot_map()
                    .into_iter()
                    .map(|(symbol, tick)| (symbol, tick.mid()))
                    .collect();
                risk.recompute(&document.portfolio_risk, cash, &marks).await;
            }
        });
    }

    // Operator API.
    let api = ApiServer::new(
        OperatorState {
            strategy: strategy.clone(),
            registry: registry.clone(),
            safe_mode: safe_mode.clone(),
            mode: mode.clone(),
            api_key: config.api.api_key.clone(),
        },
        config.api.host.clone(),
        config.api.port,
    );
    tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            error!("Operator API exited: {}", e);
        }
    });

    // Initial load: an existing strategy file becomes active immediately.
    if let Err(e) = strategy.try_load().await {
        warn!("Initial strategy load rejected: {}", e);
    }

    info!("✅ Execution engine ready (mode: {})", mode.mode());

    tokio::signal::ctrl_c().await?;
    info!("Caught interrupt, shutting down");
    let _ = shutdown_tx.send(true);
    // Give tasks a moment to persist and unwind.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

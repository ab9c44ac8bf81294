use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use helmsman_bot::{
    agents::{
        tools::{LatestStrategyTool, MarketDataTool, PortfolioTool, ReadArtifactTool},
        AgentApiServer, AgentApiState, AgentInvoker, ArtifactManager, HealthMonitor,
        LearningLoopRunner, MailboxStore, OllamaClient, RunnerShared, Scheduler, ToolExecutor,
    },
    config::AppConfig,
    utils::logging,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Agent learning-loop runner", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level override
    #[arg(short, long)]
    log_level: Option<String>,

    /// Runner API port override
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_from_path(&args.config)
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let _log_guard = logging::init_logging(&config.logging.level, &config.logging.dir, "agent-runner")?;
    info!("🧠 Helmsman agent runner starting (v{})", helmsman_bot::VERSION);
    info!("LLM endpoint: {}", config.ollama.base_url);

    let artifacts = Arc::new(ArtifactManager::new(&config.storage)?);
    let mailboxes = Arc::new(MailboxStore::new(&config.storage.base_path, 5)?);

    let mut executor = ToolExecutor::new(config.tools.clone());
    executor.register(Arc::new(MarketDataTool::new(
        &config.tools.market_data_url,
        config.tools.default_timeout_seconds,
    )?));
    executor.register(Arc::new(PortfolioTool::new(
        &config.tools.execution_api_url,
        config.tools.default_timeout_seconds,
    )?));
    executor.register(Arc::new(ReadArtifactTool::new(artifacts.clone())));
    executor.register(Arc::new(LatestStrategyTool::new(artifacts.clone())));
    let executor = Arc::new(executor);
    info!("🔧 Tools registered: {:?}", executor.tool_names());

    let llm = Arc::new(OllamaClient::new(&config.ollama)?);
    let invoker = AgentInvoker::new(llm, executor);

    let shared = Arc::new(RunnerShared::new());
    let runner = Arc::new(LearningLoopRunner::new(
        config.clone(),
        invoker,
        artifacts.clone(),
        mailboxes.clone(),
        shared.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(config.clone(), runner, shared.clone());
    tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let monitor = HealthMonitor::new(config.clone(), shared.clone());
    tokio::spawn(monitor.run(shutdown_rx.clone()));

    let api = AgentApiServer::new(
        AgentApiState {
            shared: shared.clone(),
            artifacts,
            mailboxes,
            api_key: config.api.api_key.clone(),
        },
        config.api.host.clone(),
        config.api.port,
    );
    tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            error!("Agent API exited: {}", e);
        }
    });

    info!("✅ Agent runner ready");

    tokio::signal::ctrl_c().await?;
    info!("Caught interrupt, shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

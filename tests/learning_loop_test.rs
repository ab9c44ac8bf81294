//! Learning-loop scenarios: cycles, artifacts, resume, and the strategy
//! hand-off to the execution engine.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use helmsman_bot::agents::cycle::{CycleContext, StepOutcome};
use helmsman_bot::agents::llm::{ChatMessage, ToolDefinition};
use helmsman_bot::agents::{
    AgentInvoker, ArtifactManager, ChatProvider, CycleState, LearningLoopRunner, MailboxStore,
    RunnerShared, ToolExecutor,
};
use helmsman_bot::config::{AppConfig, StorageConfig, ToolsConfig};
use helmsman_bot::events::EventLog;
use helmsman_bot::models::{TradingError, TradingResult};
use helmsman_bot::strategy::{StrategyService, StrategyState};
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

struct ScriptedProvider {
    replies: Mutex<VecDeque<ChatMessage>>,
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _temperature: f64,
        _max_tokens: u32,
    ) -> TradingResult<ChatMessage> {
        self.replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| TradingError::AgentError("script exhausted".to_string()))
    }
}

fn terminal(content: &str) -> ChatMessage {
    ChatMessage {
        role: "assistant".to_string(),
        content: content.to_string(),
        tool_calls: None,
    }
}

fn strategy_json() -> String {
    let window = Utc::now() + ChronoDuration::hours(6);
    format!(
        r#"{{
  "mode": "paper",
  "posture": "moderate",
  "validity_window": "{}",
  "portfolio_risk": {{
    "max_drawdown_pct": 0.15,
    "daily_loss_limit_usd": 400.0,
    "max_total_exposure_pct": 0.7,
    "max_per_position_pct": 0.2
  }},
  "positions": [
    {{
      "id": "btc-long-1",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "market"
    }}
  ]
}}"#,
        window.to_rfc3339()
    )
}

struct Loop {
    runner: LearningLoopRunner,
    shared: Arc<RunnerShared>,
    artifacts: Arc<ArtifactManager>,
    mailboxes: Arc<MailboxStore>,
    dir: TempDir,
}

fn build(replies: Vec<ChatMessage>) -> Loop {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.storage = StorageConfig {
        base_path: dir.path().to_string_lossy().into_owned(),
        cycles_path: "cycles".to_string(),
        memory_path: "memory".to_string(),
        archive_retention_count: 10,
    };
    config.strategy.watch_path = dir
        .path()
        .join("live/strategy.json")
        .to_string_lossy()
        .into_owned();
    for agent in config.agents.values_mut() {
        agent.timeout_minutes = 1;
        agent.max_retries = 0;
    }

    let artifacts = Arc::new(ArtifactManager::new(&config.storage).unwrap());
    let mailboxes = Arc::new(MailboxStore::new(&config.storage.base_path, 5).unwrap());
    let provider = Arc::new(ScriptedProvider {
        replies: Mutex::new(replies.into()),
    });
    let executor = Arc::new(ToolExecutor::new(ToolsConfig {
        cache_ttl_seconds: 0,
        ..ToolsConfig::default()
    }));
    let invoker = AgentInvoker::new(provider, executor);
    let shared = Arc::new(RunnerShared::new());
    let runner = LearningLoopRunner::new(
        config,
        invoker,
        artifacts.clone(),
        mailboxes.clone(),
        shared.clone(),
    );
    Loop {
        runner,
        shared,
        artifacts,
        mailboxes,
        dir,
    }
}

#[tokio::test]
async fn produced_strategy_loads_in_the_execution_engine() {
    let harness = build(vec![
        terminal("# Plan"),
        terminal("# Research"),
        terminal("# Analysis"),
        terminal(&format!(
            "Here is the strategy:\n{}\nGood luck.",
            strategy_json()
        )),
    ]);

    harness.runner.run_cycle().await.unwrap();

    // The hinge: the execution engine's strategy service must accept the
    // published file unchanged.
    let events = Arc::new(EventLog::open(harness.dir.path().join("events.log")).unwrap());
    let service = StrategyService::new(
        harness.dir.path().join("live/strategy.json"),
        5,
        50,
        events,
    );
    assert!(service.try_load().await.unwrap());
    let snapshot = service.snapshot().await;
    assert_eq!(snapshot.state, StrategyState::Active);
    let document = snapshot.document.unwrap();
    assert_eq!(document.positions.len(), 1);
    assert_eq!(document.id.len(), 16);
}

#[tokio::test]
async fn cycle_writes_artifacts_memory_and_forward_notes() {
    let harness = build(vec![
        terminal("# Plan"),
        terminal("# Research"),
        terminal("# Analysis"),
        terminal(&strategy_json()),
    ]);

    harness.runner.run_cycle().await.unwrap();

    let cycle_id = harness
        .shared
        .current
        .read()
        .await
        .clone()
        .unwrap()
        .cycle_id;
    for artifact in ["plan.md", "research.md", "analysis.md", "strategy.json"] {
        assert!(harness.artifacts.read_artifact(&cycle_id, artifact).is_some());
    }
    assert_eq!(
        harness.artifacts.latest_completed_cycle(),
        Some(cycle_id.clone())
    );

    // Memory accumulated for every stage agent that ran.
    for agent in ["planner", "researcher", "analyst", "synthesizer"] {
        assert!(
            harness.artifacts.read_memory(agent).contains(&cycle_id),
            "no memory for {}",
            agent
        );
    }

    // Forward notes travelled down the pipeline.
    let researcher_mail = harness.mailboxes.read("researcher");
    assert_eq!(researcher_mail.len(), 1);
    assert_eq!(researcher_mail[0].from_agent, "planner");
}

#[tokio::test]
async fn interrupted_cycle_resumes_under_the_same_id() {
    let harness = build(vec![
        terminal("# Research resumed"),
        terminal("# Analysis"),
        terminal(&strategy_json()),
    ]);

    // Simulate a crash mid-Research: Plan succeeded, Research started but
    // never finished.
    let cycle_id = "20260801_090000".to_string();
    let cycle_dir = harness.artifacts.ensure_cycle_dir(&cycle_id).unwrap();
    harness
        .artifacts
        .write_artifact(&cycle_id, "plan.md", "# Plan from before the crash")
        .unwrap();
    let mut context = CycleContext::new(cycle_id.clone());
    context.transition(CycleState::Plan).unwrap();
    context.finish_step(StepOutcome::Success, None);
    context.transition(CycleState::Research).unwrap();
    context.persist(&cycle_dir).unwrap();

    harness.runner.run_cycle().await.unwrap();

    let resumed = harness.shared.current.read().await.clone().unwrap();
    assert_eq!(resumed.cycle_id, cycle_id);
    assert_eq!(resumed.current_state, CycleState::WaitingForNextCycle);
    assert_eq!(resumed.restart_count, 1);
    assert!(harness
        .artifacts
        .read_artifact(&cycle_id, "research.md")
        .is_some());
    assert!(harness
        .artifacts
        .read_artifact(&cycle_id, "strategy.json")
        .is_some());
}

#[tokio::test]
async fn stage_failure_lands_in_failed_state_with_error_record() {
    let harness = build(vec![
        terminal("# Plan"),
        // Researcher's provider dies with a permanent error.
    ]);

    assert!(harness.runner.run_cycle().await.is_err());
    let context = harness.shared.current.read().await.clone().unwrap();
    assert_eq!(context.current_state, CycleState::Failed);
    let failed_step = context
        .steps
        .iter()
        .find(|s| s.stage == CycleState::Research)
        .unwrap();
    assert_eq!(failed_step.outcome, Some(StepOutcome::Failed));

    let errors = harness.shared.errors.read().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].stage.as_deref(), Some("research"));
}

#[tokio::test]
async fn pause_override_parks_the_cycle() {
    let harness = build(vec![terminal("# Plan")]);
    // Request pause before the cycle starts: the runner checks the flag at
    // each stage boundary.
    harness
        .shared
        .pause_requested
        .store(true, std::sync::atomic::Ordering::SeqCst);

    harness.runner.run_cycle().await.unwrap();
    let context = harness.shared.current.read().await.clone().unwrap();
    assert_eq!(context.current_state, CycleState::Paused);
    assert!(context.paused);
    assert_eq!(context.pause_reason.as_deref(), Some("operator override"));
}

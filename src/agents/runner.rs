use crate::agents::artifacts::ArtifactManager;
use crate::agents::cycle::{CycleContext, StepOutcome};
use crate::agents::invoker::{AgentInvoker, AgentOutcome};
use crate::agents::mailbox::{MailboxStore, MessageKind};
use crate::agents::state_machine::CycleState;
use crate::config::AppConfig;
use crate::models::{TradingError, TradingResult};
use crate::strategy::StrategyDocument;
use crate::utils::persistence::atomic_write;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};

/// Error surfaced through `GET /errors`.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerError {
    pub at: DateTime<Utc>,
    pub cycle_id: Option<String>,
    pub stage: Option<String>,
    pub message: String,
}

/// State shared between the runner task, the health monitor, and the HTTP
/// surface.
pub struct RunnerShared {
    pub current: RwLock<Option<CycleContext>>,
    pub last_completed_at: RwLock<Option<DateTime<Utc>>>,
    pub last_transition_at: RwLock<DateTime<Utc>>,
    pub errors: RwLock<Vec<RunnerError>>,
    pub pause_requested: AtomicBool,
    pub abort_requested: AtomicBool,
    pub force_cycle: Notify,
    /// Operator-injected guidance, consumed by the next stage prompt.
    pub injected_notes: RwLock<Vec<String>>,
    /// Signalled by the health monitor at stall-critical.
    pub stall_restart: Notify,
}

impl RunnerShared {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            last_completed_at: RwLock::new(None),
            last_transition_at: RwLock::new(Utc::now()),
            errors: RwLock::new(Vec::new()),
            pause_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            force_cycle: Notify::new(),
            injected_notes: RwLock::new(Vec::new()),
            stall_restart: Notify::new(),
        }
    }

    pub async fn record_error(
        &self,
        cycle_id: Option<String>,
        stage: Option<String>,
        message: String,
    ) {
        let mut errors = self.errors.write().await;
        errors.push(RunnerError {
            at: Utc::now(),
            cycle_id,
            stage,
            message,
        });
        // Bounded history for the operator surface.
        if errors.len() > 200 {
            let excess = errors.len() - 200;
            errors.drain(0..excess);
        }
    }
}

impl Default for RunnerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the agent pipeline: Evaluate (when a previous completed cycle
/// exists) then Plan -> Research -> Analyze -> Synthesize. Each stage
/// consumes the prior artifact plus per-agent memory and mailbox notes, and
/// writes exactly one artifact. Every transition is persisted.
pub struct LearningLoopRunner {
    config: AppConfig,
    invoker: AgentInvoker,
    artifacts: Arc<ArtifactManager>,
    mailboxes: Arc<MailboxStore>,
    shared: Arc<RunnerShared>,
    strategy_output_path: PathBuf,
}

impl LearningLoopRunner {
    pub fn new(
        config: AppConfig,
        invoker: AgentInvoker,
        artifacts: Arc<ArtifactManager>,
        mailboxes: Arc<MailboxStore>,
        shared: Arc<RunnerShared>,
    ) -> Self {
        let strategy_output_path = PathBuf::from(&config.strategy.watch_path);
        Self {
            config,
            invoker,
            artifacts,
            mailboxes,
            shared,
            strategy_output_path,
        }
    }

    /// Resume an interrupted cycle if one is on disk, otherwise start a new
    /// cycle when the schedule allows.
    pub async fn run_cycle(&self) -> TradingResult<()> {
        let (mut context, resumed) = self.restore_or_create().await?;
        self.store_context(&context).await?;

        let mut stage = if resumed {
            match context.resume_stage() {
                Some(stage) => {
                    info!(
                        "🔁 Resuming cycle {} at stage {} (restart {})",
                        context.cycle_id, stage, context.restart_count
                    );
                    // Re-enter the pipeline through the recorded stage.
                    context.current_state = CycleState::Idle;
                    if stage == CycleState::Evaluate || stage == CycleState::Plan {
                        stage
                    } else {
                        // Idle can only legally enter Plan/Evaluate; walk the
                        // recorded successes back onto the pipeline.
                        context.current_state = stage;
                        stage
                    }
                }
                None => self.first_stage(),
            }
        } else {
            self.first_stage()
        };

        // Entering the first stage from Idle; resumed mid-pipeline cycles
        // already sit on their stage.
        if context.current_state == CycleState::Idle {
            context.transition(stage)?;
            self.store_context(&context).await?;
        }

        loop {
            if self.shared.abort_requested.swap(false, Ordering::SeqCst) {
                warn!("⛔ Cycle {} aborted by operator", context.cycle_id);
                context.finish_step(StepOutcome::Skipped, Some("operator abort".to_string()));
                context.transition(CycleState::Failed)?;
                self.store_context(&context).await?;
                return Ok(());
            }
            if self.shared.pause_requested.swap(false, Ordering::SeqCst) {
                context.finish_step(StepOutcome::Skipped, Some("operator pause".to_string()));
                context.pause("operator override")?;
                self.store_context(&context).await?;
                info!("⏸️ Cycle {} paused", context.cycle_id);
                return Ok(());
            }

            match self.run_stage(&mut context, stage).await {
                Ok(()) => {
                    context.finish_step(StepOutcome::Success, None);
                    let next = stage
                        .next_stage()
                        .ok_or_else(|| {
                            TradingError::InvariantViolation(format!(
                                "stage {} has no successor",
                                stage
                            ))
                        })?;
                    context.transition(next)?;
                    self.store_context(&context).await?;
                    if next == CycleState::WaitingForNextCycle {
                        info!("🏁 Cycle {} completed", context.cycle_id);
                        *self.shared.last_completed_at.write().await = Some(Utc::now());
                        if let Err(e) = self.artifacts.archive_old_cycles() {
                            warn!("Archive pass failed: {}", e);
                        }
                        return Ok(());
                    }
                    stage = next;
                }
                Err(e) => {
                    let outcome = match &e {
                        TradingError::Cancelled(_) => StepOutcome::Timeout,
                        _ => StepOutcome::Failed,
                    };
                    context.finish_step(outcome, Some(e.to_string()));
                    self.shared
                        .record_error(
                            Some(context.cycle_id.clone()),
                            Some(stage.to_string()),
                            e.to_string(),
                        )
                        .await;
                    error!("💥 Cycle {} stage {} failed: {}", context.cycle_id, stage, e);
                    context.transition(CycleState::Failed)?;
                    self.store_context(&context).await?;
                    return Err(e);
                }
            }
        }
    }

    fn first_stage(&self) -> CycleState {
        if self.artifacts.latest_completed_cycle().is_some() {
            CycleState::Evaluate
        } else {
            CycleState::Plan
        }
    }

    async fn restore_or_create(&self) -> TradingResult<(CycleContext, bool)> {
        // An unfinished cycle on disk resumes under the same id.
        if let Some(last_id) = self.artifacts.list_cycles().into_iter().last() {
            let dir = self.artifacts.cycle_dir(&last_id);
            if let Some(mut context) = CycleContext::load(&dir)? {
                // Paused cycles stay parked until an operator decision; only
                // cycles interrupted mid-stage are resumed automatically.
                let unfinished = !matches!(
                    context.current_state,
                    CycleState::WaitingForNextCycle
                        | CycleState::Idle
                        | CycleState::Failed
                        | CycleState::Paused
                );
                if unfinished {
                    context.restart_count += 1;
                    if context.restart_count > self.config.resilience.max_restart_attempts {
                        warn!(
                            "Cycle {} exceeded {} restarts; abandoning",
                            context.cycle_id, self.config.resilience.max_restart_attempts
                        );
                        context.finish_step(
                            StepOutcome::Failed,
                            Some("restart budget exhausted".to_string()),
                        );
                        if context.current_state.can_transition_to(CycleState::Failed) {
                            context.transition(CycleState::Failed)?;
                        }
                        self.store_context(&context).await?;
                    } else {
                        return Ok((context, true));
                    }
                }
            }
        }

        // Ids have one-second resolution; never reuse a directory that a
        // completed cycle already owns.
        let mut cycle_id = CycleContext::generate_id(Utc::now());
        while self.artifacts.cycle_dir(&cycle_id).exists() {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            cycle_id = CycleContext::generate_id(Utc::now());
        }
        let context = CycleContext::new(cycle_id);
        self.artifacts.ensure_cycle_dir(&context.cycle_id)?;
        info!("🚀 Starting cycle {}", context.cycle_id);
        Ok((context, false))
    }

    async fn store_context(&self, context: &CycleContext) -> TradingResult<()> {
        let dir = self.artifacts.ensure_cycle_dir(&context.cycle_id)?;
        context.persist(&dir)?;
        *self.shared.current.write().await = Some(context.clone());
        *self.shared.last_transition_at.write().await = Utc::now();
        Ok(())
    }

    async fn run_stage(
        &self,
        context: &mut CycleContext,
        stage: CycleState,
    ) -> TradingResult<()> {
        let agent_name = stage.stage_agent().ok_or_else(|| {
            TradingError::InvariantViolation(format!("{} is not an agent stage", stage))
        })?;
        let artifact_name = stage
            .stage_artifact()
            .expect("agent stages always name an artifact");
        let agent_config = self.config.agent(agent_name);
        let (system_prompt, user_prompt) = self.build_prompts(context, stage, agent_name).await;

        let mut attempts = 0u32;
        let outcome: AgentOutcome = loop {
            attempts += 1;
            tokio::select! {
                result = self.invoker.run_agent(
                    agent_name,
                    &agent_config,
                    &system_prompt,
                    &user_prompt,
                ) => {
                    match result {
                        Ok(outcome) => break outcome,
                        Err(e) if attempts <= agent_config.max_retries
                            && crate::agents::tools::is_transient_error(&e.to_string()) =>
                        {
                            warn!(
                                "Stage {} transient failure (attempt {}): {}",
                                stage, attempts, e
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = self.shared.stall_restart.notified() => {
                    context.restart_count += 1;
                    self.store_context(context).await?;
                    if context.restart_count > self.config.resilience.max_restart_attempts {
                        return Err(TradingError::Cancelled(format!(
                            "stage {} stalled and restart budget exhausted",
                            stage
                        )));
                    }
                    warn!("🔁 Restarting stalled stage {} (restart {})", stage, context.restart_count);
                    continue;
                }
            }
        };

        // Synthesize must yield a valid strategy document; everything else
        // writes its markdown verbatim.
        if stage == CycleState::Synthesize {
            let json = extract_json(&outcome.final_text).ok_or_else(|| {
                TradingError::AgentError("synthesizer produced no JSON object".to_string())
            })?;
            let document = StrategyDocument::from_bytes(json.as_bytes())?;
            document.validate(Utc::now())?;
            self.artifacts
                .write_artifact(&context.cycle_id, artifact_name, &json)?;
            // The hinge: publish atomically where the execution engine's
            // file watch will pick it up.
            atomic_write(&self.strategy_output_path, json.as_bytes())?;
            info!(
                "📄 Strategy {} published to {}",
                document.id,
                self.strategy_output_path.display()
            );
        } else {
            self.artifacts
                .write_artifact(&context.cycle_id, artifact_name, &outcome.final_text)?;
        }

        self.artifacts.append_memory(
            agent_name,
            &format!(
                "cycle {}: {} finished in {} iterations ({} tool calls)",
                context.cycle_id, stage, outcome.iterations, outcome.tool_calls
            ),
        )?;

        // Forward note to the next stage's agent.
        if let Some(next_agent) = stage.next_stage().and_then(|s| s.stage_agent()) {
            let note = format!(
                "{} ready in cycle {} ({} chars)",
                artifact_name,
                context.cycle_id,
                outcome.final_text.len()
            );
            if let Err(e) = self
                .mailboxes
                .send(agent_name, next_agent, MessageKind::Forward, &note)
                .await
            {
                warn!("Mailbox forward failed: {}", e);
            }
        }

        Ok(())
    }

    async fn build_prompts(
        &self,
        context: &CycleContext,
        stage: CycleState,
        agent_name: &str,
    ) -> (String, String) {
        let system = match stage {
            CycleState::Evaluate => {
                "You are the evaluation agent of an autonomous crypto trading platform. \
                 Review the previous cycle's strategy against current portfolio results and \
                 write a frank markdown post-mortem (evaluation.md)."
            }
            CycleState::Plan => {
                "You are the planning agent of an autonomous crypto trading platform. \
                 Produce a concise markdown plan (plan.md) naming the assets, signals, and \
                 risk questions this cycle should investigate."
            }
            CycleState::Research => {
                "You are the research agent of an autonomous crypto trading platform. \
                 Execute the plan using your tools and write markdown findings (research.md) \
                 with concrete numbers."
            }
            CycleState::Analyze => {
                "You are the analysis agent of an autonomous crypto trading platform. \
                 Turn the research into trade theses with entries, exits, and invalidation \
                 levels (analysis.md)."
            }
            CycleState::Synthesize => {
                "You are the synthesis agent of an autonomous crypto trading platform. \
                 Emit ONLY a strategy document as a single JSON object with fields: mode, \
                 posture, validity_window (ISO-8601, in the future), portfolio_risk \
                 {max_drawdown_pct, daily_loss_limit_usd, max_total_exposure_pct, \
                 max_per_position_pct}, and positions (id, asset, direction, allocation_pct, \
                 entry_type, optional entry_limit_price/entry_condition, take_profit_targets, \
                 stop_loss, time_exit_utc, invalidation_condition)."
            }
            _ => "You are an agent of an autonomous crypto trading platform.",
        }
        .to_string();

        let mut user = format!("Cycle {}.\n", context.cycle_id);

        let prior = match stage {
            CycleState::Evaluate => self
                .artifacts
                .latest_completed_cycle()
                .and_then(|id| self.artifacts.read_artifact(&id, "strategy.json"))
                .map(|s| ("previous strategy.json", s)),
            CycleState::Plan => self
                .artifacts
                .read_artifact(&context.cycle_id, "evaluation.md")
                .map(|s| ("evaluation.md", s)),
            CycleState::Research => self
                .artifacts
                .read_artifact(&context.cycle_id, "plan.md")
                .map(|s| ("plan.md", s)),
            CycleState::Analyze => self
                .artifacts
                .read_artifact(&context.cycle_id, "research.md")
                .map(|s| ("research.md", s)),
            CycleState::Synthesize => self
                .artifacts
                .read_artifact(&context.cycle_id, "analysis.md")
                .map(|s| ("analysis.md", s)),
            _ => None,
        };
        if let Some((name, content)) = prior {
            user.push_str(&format!("\n## Input ({})\n{}\n", name, content));
        }

        let memory = self.artifacts.read_memory(agent_name);
        if !memory.is_empty() {
            user.push_str(&format!("\n## Your memory\n{}\n", memory));
        }

        let mail = self.mailboxes.read(agent_name);
        if !mail.is_empty() {
            user.push_str("\n## Mailbox\n");
            for message in mail {
                user.push_str(&format!(
                    "- [{}] from {}: {}\n",
                    match message.kind {
                        MessageKind::Forward => "forward",
                        MessageKind::Feedback => "feedback",
                    },
                    message.from_agent,
                    message.content
                ));
            }
        }

        let mut injected = self.shared.injected_notes.write().await;
        if !injected.is_empty() {
            user.push_str("\n## Operator guidance\n");
            for note in injected.drain(..) {
                user.push_str(&format!("- {}\n", note));
            }
        }

        (system, user)
    }
}

/// Pull the first top-level JSON object out of model text that may carry
/// prose around it.
fn extract_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::invoker::ChatProvider;
    use crate::agents::llm::{ChatMessage, ToolDefinition};
    use crate::agents::tools::ToolExecutor;
    use crate::config::{StorageConfig, ToolsConfig};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;
    use tempfile::tempdir;
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

    fn build_runner(
        dir: &std::path::Path,
        replies: Vec<ChatMessage>,
    ) -> (LearningLoopRunner, Arc<RunnerShared>, Arc<ArtifactManager>) {
        let mut config = AppConfig::default();
        config.storage = StorageConfig {
            base_path: dir.to_string_lossy().into_owned(),
            cycles_path: "cycles".to_string(),
            memory_path: "memory".to_string(),
            archive_retention_count: 10,
        };
        config.strategy.watch_path = dir
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
            mailboxes,
            shared.clone(),
        );
        (runner, shared, artifacts)
    }

    #[tokio::test]
    async fn test_first_cycle_runs_plan_through_synthesize() {
        let dir = tempdir().unwrap();
        let (runner, shared, artifacts) = build_runner(
            dir.path(),
            vec![
                terminal("# Plan"),
                terminal("# Research"),
                terminal("# Analysis"),
                terminal(&strategy_json()),
            ],
        );

        runner.run_cycle().await.unwrap();

        let context = shared.current.read().await.clone().unwrap();
        assert_eq!(context.current_state, CycleState::WaitingForNextCycle);
        // No Evaluate on the very first cycle.
        assert_eq!(context.steps.len(), 4);
        assert!(context
            .steps
            .iter()
            .all(|s| s.outcome == Some(StepOutcome::Success)));

        let cycle_id = context.cycle_id;
        for artifact in ["plan.md", "research.md", "analysis.md", "strategy.json"] {
            assert!(
                artifacts.read_artifact(&cycle_id, artifact).is_some(),
                "missing {}",
                artifact
            );
        }
        // Strategy published to the execution engine's watch path.
        assert!(dir.path().join("live/strategy.json").exists());
    }

    #[tokio::test]
    async fn test_second_cycle_opens_with_evaluate() {
        let dir = tempdir().unwrap();
        let (runner, shared, _artifacts) = build_runner(
            dir.path(),
            vec![
                terminal("# Plan"),
                terminal("# Research"),
                terminal("# Analysis"),
                terminal(&strategy_json()),
                terminal("# Evaluation"),
                terminal("# Plan 2"),
                terminal("# Research 2"),
                terminal("# Analysis 2"),
                terminal(&strategy_json()),
            ],
        );

        runner.run_cycle().await.unwrap();
        runner.run_cycle().await.unwrap();

        let context = shared.current.read().await.clone().unwrap();
        assert_eq!(context.steps.len(), 5);
        assert_eq!(context.steps[0].stage, CycleState::Evaluate);
        assert_eq!(context.steps[0].outcome, Some(StepOutcome::Success));
    }

    #[tokio::test]
    async fn test_invalid_strategy_fails_cycle() {
        let dir = tempdir().unwrap();
        let (runner, shared, _artifacts) = build_runner(
            dir.path(),
            vec![
                terminal("# Plan"),
                terminal("# Research"),
                terminal("# Analysis"),
                terminal("not json at all"),
            ],
        );

        assert!(runner.run_cycle().await.is_err());
        let context = shared.current.read().await.clone().unwrap();
        assert_eq!(context.current_state, CycleState::Failed);
        assert!(!shared.errors.read().await.is_empty());
        // Nothing was published on the hinge path.
        assert!(!dir.path().join("live/strategy.json").exists());
    }

    #[tokio::test]
    async fn test_abort_override_stops_cycle() {
        let dir = tempdir().unwrap();
        let (runner, shared, _artifacts) =
            build_runner(dir.path(), vec![terminal("# never used")]);
        shared.abort_requested.store(true, Ordering::SeqCst);

        runner.run_cycle().await.unwrap();
        let context = shared.current.read().await.clone().unwrap();
        assert_eq!(context.current_state, CycleState::Failed);
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(
            extract_json("prose {\"a\": 1} trailing").as_deref(),
            Some("{\"a\": 1}")
        );
        assert!(extract_json("no braces here").is_none());
    }
}

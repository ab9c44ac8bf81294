use crate::agents::state_machine::CycleState;
use crate::models::{TradingError, TradingResult};
use crate::utils::persistence::{atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// Per-stage record inside a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: CycleState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<StepOutcome>,
    pub error: Option<String>,
}

/// One learning-loop run. Persisted into the cycle directory after every
/// state change so a restart resumes from the last unfinished stage under
/// the same cycle id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleContext {
    pub cycle_id: String,
    pub current_state: CycleState,
    pub steps: Vec<StepRecord>,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub restart_count: u32,
    pub is_stalled: bool,
    pub started_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl CycleContext {
    /// Cycle ids are UTC timestamps, `YYYYMMDD_HHMMSS`.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        now.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn new(cycle_id: String) -> Self {
        let now = Utc::now();
        Self {
            cycle_id,
            current_state: CycleState::Idle,
            steps: Vec::new(),
            paused: false,
            pause_reason: None,
            restart_count: 0,
            is_stalled: false,
            started_at: now,
            last_transition_at: now,
        }
    }

    /// Apply a transition, enforcing the state-machine table.
    pub fn transition(&mut self, next: CycleState) -> TradingResult<()> {
        if !self.current_state.can_transition_to(next) {
            return Err(TradingError::InvariantViolation(format!(
                "illegal transition {} -> {} in cycle {}",
                self.current_state, next, self.cycle_id
            )));
        }
        debug!(
            "Cycle {}: {} -> {}",
            self.cycle_id, self.current_state, next
        );
        self.current_state = next;
        self.last_transition_at = Utc::now();
        self.is_stalled = false;
        if let Some(agent) = next.stage_agent() {
            info!("🧠 Cycle {} entering {} ({})", self.cycle_id, next, agent);
            self.steps.push(StepRecord {
                stage: next,
                started_at: Utc::now(),
                ended_at: None,
                outcome: None,
                error: None,
            });
        }
        Ok(())
    }

    /// Close the open step record for the current stage.
    pub fn finish_step(&mut self, outcome: StepOutcome, error: Option<String>) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.stage == self.current_state && s.ended_at.is_none())
        {
            step.ended_at = Some(Utc::now());
            step.outcome = Some(outcome);
            step.error = error;
        }
        self.last_transition_at = Utc::now();
    }

    pub fn pause(&mut self, reason: &str) -> TradingResult<()> {
        self.transition(CycleState::Paused)?;
        self.paused = true;
        self.pause_reason = Some(reason.to_string());
        Ok(())
    }

    /// The stage to resume after a restart: the most recent step that never
    /// finished, or the next stage after the last success.
    pub fn resume_stage(&self) -> Option<CycleState> {
        if let Some(open) = self.steps.iter().rev().find(|s| s.ended_at.is_none()) {
            return Some(open.stage);
        }
        self.steps
            .iter()
            .rev()
            .find(|s| s.outcome == Some(StepOutcome::Success))
            .and_then(|s| s.stage.next_stage())
            .filter(|s| s.stage_agent().is_some())
    }

    pub fn context_path(cycle_dir: &Path) -> PathBuf {
        cycle_dir.join("context.json")
    }

    pub fn persist(&self, cycle_dir: &Path) -> TradingResult<()> {
        atomic_write_json(Self::context_path(cycle_dir), self)
    }

    pub fn load(cycle_dir: &Path) -> TradingResult<Option<Self>> {
        load_json(Self::context_path(cycle_dir))
    }
}

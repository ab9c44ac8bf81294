use serde::{Deserialize, Serialize};

/// Learning-loop states. A cycle is the ordered run
/// Plan -> Research -> Analyze -> Synthesize, optionally preceded by
/// Evaluate when a previous completed cycle exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Plan,
    Research,
    Analyze,
    Synthesize,
    Evaluate,
    WaitingForNextCycle,
    Paused,
    Failed,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Plan => "plan",
            CycleState::Research => "research",
            CycleState::Analyze => "analyze",
            CycleState::Synthesize => "synthesize",
            CycleState::Evaluate => "evaluate",
            CycleState::WaitingForNextCycle => "waiting_for_next_cycle",
            CycleState::Paused => "paused",
            CycleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl CycleState {
    /// Transition table. Everything not listed is illegal.
    pub fn can_transition_to(self, next: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, next),
            (Idle, Plan)
                | (Idle, Evaluate)
                | (Plan, Research)
                | (Plan, Failed)
                | (Plan, Paused)
                | (Research, Analyze)
                | (Research, Failed)
                | (Research, Paused)
                | (Analyze, Synthesize)
                | (Analyze, Failed)
                | (Analyze, Paused)
                | (Synthesize, WaitingForNextCycle)
                | (Synthesize, Failed)
                | (Synthesize, Paused)
                | (Evaluate, Plan)
                | (Evaluate, Failed)
                | (WaitingForNextCycle, Plan)
                | (WaitingForNextCycle, Idle)
                | (WaitingForNextCycle, Paused)
                | (Paused, Evaluate)
                | (Paused, Idle)
                | (Failed, Idle)
        )
    }

    /// States in which no agent is running.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CycleState::Idle | CycleState::Failed | CycleState::Paused
        )
    }

    /// The agent stage that runs in this state, if any.
    pub fn stage_agent(self) -> Option<&'static str> {
        match self {
            CycleState::Plan => Some("planner"),
            CycleState::Research => Some("researcher"),
            CycleState::Analyze => Some("analyst"),
            CycleState::Synthesize => Some("synthesizer"),
            CycleState::Evaluate => Some("evaluator"),
            _ => None,
        }
    }

    /// The artifact the stage writes.
    pub fn stage_artifact(self) -> Option<&'static str> {
        match self {
            CycleState::Plan => Some("plan.md"),
            CycleState::Research => Some("research.md"),
            CycleState::Analyze => Some("analysis.md"),
            CycleState::Synthesize => Some("strategy.json"),
            CycleState::Evaluate => Some("evaluation.md"),
            _ => None,
        }
    }

    /// Next pipeline state after this stage succeeds.
    pub fn next_stage(self) -> Option<CycleState> {
        match self {
            CycleState::Evaluate => Some(CycleState::Plan),
            CycleState::Plan => Some(CycleState::Research),
            CycleState::Research => Some(CycleState::Analyze),
            CycleState::Analyze => Some(CycleState::Synthesize),
            CycleState::Synthesize => Some(CycleState::WaitingForNextCycle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let mut state = CycleState::Plan;
        let mut visited = vec![state];
        while let Some(next) = state.next_stage() {
            assert!(state.can_transition_to(next));
            state = next;
            visited.push(state);
            if state == CycleState::WaitingForNextCycle {
                break;
            }
        }
        assert_eq!(
            visited,
            vec![
                CycleState::Plan,
                CycleState::Research,
                CycleState::Analyze,
                CycleState::Synthesize,
                CycleState::WaitingForNextCycle,
            ]
        );
    }

    #[test]
    fn test_no_execute_stage_between_synthesize_and_waiting() {
        assert_eq!(
            CycleState::Synthesize.next_stage(),
            Some(CycleState::WaitingForNextCycle)
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!CycleState::Idle.can_transition_to(CycleState::Research));
        assert!(!CycleState::Plan.can_transition_to(CycleState::Synthesize));
        assert!(!CycleState::Failed.can_transition_to(CycleState::Plan));
        assert!(!CycleState::Research.can_transition_to(CycleState::Plan));
    }

    #[test]
    fn test_resume_paths() {
        // Resume-with-history enters through Evaluate.
        assert!(CycleState::Idle.can_transition_to(CycleState::Evaluate));
        assert!(CycleState::Paused.can_transition_to(CycleState::Evaluate));
        assert!(CycleState::Failed.can_transition_to(CycleState::Idle));
    }

    #[test]
    fn test_stage_metadata() {
        assert_eq!(CycleState::Synthesize.stage_agent(), Some("synthesizer"));
        assert_eq!(CycleState::Synthesize.stage_artifact(), Some("strategy.json"));
        assert_eq!(CycleState::Idle.stage_agent(), None);
    }
}

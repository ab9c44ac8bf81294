use crate::agents::runner::{LearningLoopRunner, RunnerShared};
use crate::config::AppConfig;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};
use tracing::{error, info, warn};

/// Triggers a new learning cycle at most every `schedule_interval_minutes`
/// since the last completion. An operator force-cycle skips the wait.
pub struct Scheduler {
    config: AppConfig,
    runner: Arc<LearningLoopRunner>,
    shared: Arc<RunnerShared>,
}

impl Scheduler {
    pub fn new(
        config: AppConfig,
        runner: Arc<LearningLoopRunner>,
        shared: Arc<RunnerShared>,
    ) -> Self {
        Self {
            config,
            runner,
            shared,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cadence = Duration::from_secs(self.config.cycle.schedule_interval_minutes * 60);
        info!(
            "⏱️ Scheduler running (cadence {} minutes)",
            self.config.cycle.schedule_interval_minutes
        );

        loop {
            let wait = {
                let last = *self.shared.last_completed_at.read().await;
                match last {
                    None => Duration::ZERO,
                    Some(at) => {
                        let elapsed = (Utc::now() - at)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        cadence.saturating_sub(elapsed)
                    }
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        return;
                    }
                }
                _ = sleep(wait) => {}
                _ = self.shared.force_cycle.notified() => {
                    info!("⚡ Cycle forced by operator");
                }
            }

            if let Err(e) = self.runner.run_cycle().await {
                error!("Cycle run failed: {}", e);
                // Back off before the next attempt rather than hot-looping
                // on a persistent failure.
                sleep(Duration::from_secs(
                    self.config.cycle.min_duration_minutes * 60,
                ))
                .await;
            }
        }
    }
}

/// Watches the learning state machine for stalls. No transition within
/// `stall_warning_minutes` emits a warning; `stall_critical_minutes`
/// escalates and asks the runner to restart the current stage.
pub struct HealthMonitor {
    config: AppConfig,
    shared: Arc<RunnerShared>,
}

impl HealthMonitor {
    pub fn new(config: AppConfig, shared: Arc<RunnerShared>) -> Self {
        Self { config, shared }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let warning = chrono::Duration::minutes(self.config.resilience.stall_warning_minutes as i64);
        let critical =
            chrono::Duration::minutes(self.config.resilience.stall_critical_minutes as i64);
        let mut ticker = interval(Duration::from_secs(30));
        let mut warned_for: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }

            let running_stage = {
                let current = self.shared.current.read().await;
                current.as_ref().and_then(|c| {
                    if c.current_state.is_terminal() || c.current_state.stage_agent().is_none() {
                        None
                    } else {
                        Some((c.cycle_id.clone(), c.current_state))
                    }
                })
            };
            let Some((cycle_id, stage)) = running_stage else {
                warned_for = None;
                continue;
            };

            let idle_for = Utc::now() - *self.shared.last_transition_at.read().await;
            let stall_key = format!("{}:{}", cycle_id, stage);

            if idle_for >= critical {
                error!(
                    "🆘 Stall critical: cycle {} stage {} silent for {} minutes",
                    cycle_id,
                    stage,
                    idle_for.num_minutes()
                );
                if let Some(context) = self.shared.current.write().await.as_mut() {
                    context.is_stalled = true;
                }
                self.shared
                    .record_error(
                        Some(cycle_id),
                        Some(stage.to_string()),
                        format!("stall critical after {} minutes", idle_for.num_minutes()),
                    )
                    .await;
                // Ask the runner to restart the stage; it enforces the
                // restart budget.
                self.shared.stall_restart.notify_one();
                *self.shared.last_transition_at.write().await = Utc::now();
                warned_for = None;
            } else if idle_for >= warning && warned_for.as_deref() != Some(stall_key.as_str()) {
                warn!(
                    "⚠️ Stall warning: cycle {} stage {} silent for {} minutes",
                    cycle_id,
                    stage,
                    idle_for.num_minutes()
                );
                warned_for = Some(stall_key);
            }
        }
    }
}

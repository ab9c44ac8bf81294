use crate::dsl::{Condition, Tri};
use crate::events::{EventLog, EventType};
use crate::execution::controls::SafeModeController;
use crate::execution::order_router::OrderRouter;
use crate::execution::registry::PositionRegistry;
use crate::models::{
    Direction, ExitReason, MarketSnapshot, OpenPosition, OrderIntent, OrderRequest, SnapshotMap,
};
use crate::strategy::{
    PositionDirection, Posture, StopLoss, StrategyDocument, StrategyPosition, StrategyService,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Per-tick exit decisions for live positions.
///
/// Check order per position: exit_all posture, hard stop, trailing stop,
/// take-profit ladder, time exit, invalidation, declared close. At most one
/// close dispatch per position per tick; a per-position in-flight flag makes
/// concurrent ticks no-ops.
pub struct ExitEvaluator {
    strategy: Arc<StrategyService>,
    registry: Arc<PositionRegistry>,
    safe_mode: Arc<SafeModeController>,
    router: Arc<OrderRouter>,
    events: Arc<EventLog>,
    invalidations: HashMap<String, Condition>,
}

impl ExitEvaluator {
    pub fn new(
        strategy: Arc<StrategyService>,
        registry: Arc<PositionRegistry>,
        safe_mode: Arc<SafeModeController>,
        router: Arc<OrderRouter>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            strategy,
            registry,
            safe_mode,
            router,
            events,
            invalidations: HashMap::new(),
        }
    }

    /// Recompile invalidation conditions for a freshly swapped document.
    pub fn on_strategy_swap(&mut self, document: &StrategyDocument) {
        self.invalidations.clear();
        for position in &document.positions {
            if let Some(src) = &position.invalidation_condition {
                match Condition::parse(src) {
                    Ok(condition) => {
                        self.invalidations.insert(position.id.clone(), condition);
                    }
                    Err(e) => {
                        error!("invalidation recompile failed for {}: {}", position.id, e)
                    }
                }
            }
        }
    }

    pub async fn evaluate_tick(&mut self, snapshots: &SnapshotMap) {
        let document = self.strategy.snapshot().await.document;
        // Safe-mode forces exit_all regardless of the strategy posture.
        let exit_all = self.safe_mode.is_active()
            || document
                .as_ref()
                .is_some_and(|d| d.posture == Posture::ExitAll);

        for position in self.registry.open_positions().await {
            if self.registry.is_closing(position.id) {
                continue;
            }
            if let Err(e) = self
                .evaluate_position(&position, document.as_deref(), exit_all, snapshots)
                .await
            {
                // Per-position errors never tear down the loop.
                error!("Exit evaluation failed for {}: {}", position.id, e);
            }
        }
    }

    async fn evaluate_position(
        &mut self,
        position: &OpenPosition,
        document: Option<&StrategyDocument>,
        exit_all: bool,
        snapshots: &SnapshotMap,
    ) -> crate::models::TradingResult<()> {
        // 1. exit_all closes the full remaining quantity unconditionally.
        if exit_all {
            return self
                .close(position, position.quantity, ExitReason::ExitAll)
                .await;
        }

        let declared = document.and_then(|d| d.position(&position.strategy_position_id));
        let declared = match declared {
            Some(d) => d,
            // No matching declaration in the current document; nothing to
            // check until a swap brings one back or posture closes it.
            None => return Ok(()),
        };

        // 7 (checked early to avoid borrowing tick data it does not need):
        // a declared `close` direction demands unconditional closure.
        if declared.direction == PositionDirection::Close {
            return self
                .close(position, position.quantity, ExitReason::DeclaredClose)
                .await;
        }

        let tick = match snapshots.get(&position.symbol) {
            Some(t) => t,
            None => {
                debug!("No snapshot for {}; exits idle", position.symbol);
                return Ok(());
            }
        };

        // 2. Hard stop.
        if let Some(StopLoss::Hard { price }) = &declared.stop_loss {
            let triggered = match position.direction {
                Direction::Long => tick.bid <= *price,
                Direction::Short => tick.ask >= *price,
            };
            if triggered {
                return self
                    .close(position, position.quantity, ExitReason::StopLossHard)
                    .await;
            }
        }

        // 3. Trailing stop: ratchet, then trigger like a hard stop.
        if let Some(StopLoss::Trailing { trail_pct }) = &declared.stop_loss {
            let candidate = match position.direction {
                Direction::Long => tick.bid * (1.0 - trail_pct),
                Direction::Short => tick.ask * (1.0 + trail_pct),
            };
            let stop = self
                .registry
                .update_trailing_stop(position.id, candidate)
                .await?;
            if let Some(stop) = stop {
                let triggered = match position.direction {
                    Direction::Long => tick.bid <= stop,
                    Direction::Short => tick.ask >= stop,
                };
                if triggered {
                    return self
                        .close(position, position.quantity, ExitReason::StopLossTrailing)
                        .await;
                }
            }
        }

        // 4. Take-profit ladder: strictly in order, one level per tick.
        if let Some(()) = self
            .check_take_profits(position, declared, tick)
            .await?
        {
            return Ok(());
        }

        // 5. Time exit.
        if let Some(deadline) = declared.time_exit_utc {
            if deadline <= Utc::now() {
                return self
                    .close(position, position.quantity, ExitReason::TimeExit)
                    .await;
            }
        }

        // 6. Invalidation: the thesis broke. Not-ready means no action.
        if let Some(condition) = self.invalidations.get_mut(&position.strategy_position_id) {
            if condition.evaluate(snapshots) == Tri::True {
                return self
                    .close(position, position.quantity, ExitReason::Invalidation)
                    .await;
            }
        }

        Ok(())
    }

    async fn check_take_profits(
        &mut self,
        position: &OpenPosition,
        declared: &StrategyPosition,
        tick: &MarketSnapshot,
    ) -> crate::models::TradingResult<Option<()>> {
        for (index, target) in declared.take_profit_targets.iter().enumerate() {
            if position.take_profit_indices_hit.contains(&index) {
                continue;
            }
            // Earlier rungs must fill first.
            if (0..index).any(|i| !position.take_profit_indices_hit.contains(&i)) {
                break;
            }
            let triggered = match position.direction {
                Direction::Long => tick.ask >= target.price,
                Direction::Short => tick.bid <= target.price,
            };
            if !triggered {
                break;
            }

            let quantity = (target.close_pct * position.original_quantity).min(position.quantity);
            self.close(position, quantity, ExitReason::TakeProfitTarget(index))
                .await?;
            self.registry
                .mark_take_profit_hit(position.id, index)
                .await?;
            // At most one take-profit level fires per tick per position.
            return Ok(Some(()));
        }
        Ok(None)
    }

    async fn close(
        &self,
        position: &OpenPosition,
        quantity: f64,
        reason: ExitReason,
    ) -> crate::models::TradingResult<()> {
        // In-flight flag: concurrent ticks observing it become no-ops.
        if !self.registry.begin_close(position.id) {
            return Ok(());
        }

        let request = OrderRequest::market(
            position.symbol.clone(),
            position.direction.exit_side(),
            quantity,
            position.strategy_id.clone(),
            position.strategy_position_id.clone(),
            OrderIntent::Exit {
                position_id: position.id,
                reason: reason.clone(),
            },
        );
        let trade = self.router.submit_exit(request, reason.clone()).await?;

        info!(
            "🚪 Exit triggered ({}): {} {} of {}",
            reason, position.direction, quantity, position.symbol
        );
        self.events.emit(
            EventType::ExitTriggered,
            serde_json::json!({
                "position_id": position.id,
                "strategy_position_id": position.strategy_position_id,
                "asset": position.symbol,
                "quantity": quantity,
                "reason": reason.to_string(),
                "realized_pnl": trade.as_ref().map(|t| t.realized_pnl),
            }),
        );
        Ok(())
    }
}

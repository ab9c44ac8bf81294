use crate::dsl::{Condition, Tri};
use crate::events::{EventLog, EventType};
use crate::execution::controls::SafeModeController;
use crate::execution::order_router::OrderRouter;
use crate::execution::position_sizer::PositionSizer;
use crate::execution::registry::PositionRegistry;
use crate::execution::risk::PortfolioRiskEnforcer;
use crate::models::{
    Direction, OrderIntent, OrderRequest, SnapshotMap,
};
use crate::strategy::{
    EntryType, PositionDirection, StrategyDocument, StrategyPosition, StrategyService,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Per-tick entry decisions: which declared positions to open.
///
/// Holds its own compiled copy of every entry condition (crossing state is
/// per-evaluator), rebuilt on each strategy swap. Dispatch is deduplicated
/// through the registry's atomic entry claims, so concurrent evaluation of
/// the same tick cannot double-fire a declared position.
pub struct EntryEvaluator {
    strategy: Arc<StrategyService>,
    registry: Arc<PositionRegistry>,
    risk: Arc<PortfolioRiskEnforcer>,
    safe_mode: Arc<SafeModeController>,
    router: Arc<OrderRouter>,
    events: Arc<EventLog>,
    conditions: HashMap<String, Condition>,
    /// Last skip reason emitted per declared position; suppresses the same
    /// reason repeating tick after tick.
    last_skip: HashMap<String, String>,
}

impl EntryEvaluator {
    pub fn new(
        strategy: Arc<StrategyService>,
        registry: Arc<PositionRegistry>,
        risk: Arc<PortfolioRiskEnforcer>,
        safe_mode: Arc<SafeModeController>,
        router: Arc<OrderRouter>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            strategy,
            registry,
            risk,
            safe_mode,
            router,
            events,
            conditions: HashMap::new(),
            last_skip: HashMap::new(),
        }
    }

    /// Recompile entry conditions for a freshly swapped document.
    pub fn on_strategy_swap(&mut self, document: &StrategyDocument) {
        self.conditions.clear();
        self.last_skip.clear();
        for position in &document.positions {
            if let Some(src) = &position.entry_condition {
                match Condition::parse(src) {
                    Ok(condition) => {
                        self.conditions.insert(position.id.clone(), condition);
                    }
                    // Validation compiled this already; a failure here is a
                    // bug, not an operator input problem.
                    Err(e) => error!("entry condition recompile failed for {}: {}", position.id, e),
                }
            }
        }
        debug!(
            "Entry evaluator armed with {} conditional entries",
            self.conditions.len()
        );
    }

    fn emit_skip(&mut self, position: &StrategyPosition, strategy_id: &str, reason: &str) {
        if self
            .last_skip
            .get(&position.id)
            .is_some_and(|last| last == reason)
        {
            return;
        }
        self.last_skip
            .insert(position.id.clone(), reason.to_string());
        self.events.emit(
            EventType::EntrySkipped,
            serde_json::json!({
                "strategy_id": strategy_id,
                "strategy_position_id": position.id,
                "asset": position.asset,
                "reason": reason,
            }),
        );
    }

    /// Run the deterministic per-tick entry pass.
    pub async fn evaluate_tick(&mut self, snapshots: &SnapshotMap) {
        let snapshot = self.strategy.snapshot().await;
        let document = match snapshot.eligible_for_entries() {
            Some(doc) => doc.clone(),
            None => return,
        };
        if !document.posture.allows_entries() {
            return;
        }

        let blocked_reason = if self.safe_mode.is_active() {
            Some("safe_mode")
        } else if self.risk.entries_suspended() {
            Some("risk_suspended")
        } else {
            None
        };

        for position in &document.positions {
            if position.direction == PositionDirection::Close {
                continue;
            }
            if self
                .registry
                .position_for(&document.id, &position.id)
                .await
                .is_some()
            {
                continue;
            }

            if let Some(reason) = blocked_reason {
                self.emit_skip(position, &document.id, reason);
                continue;
            }

            match self.gate(position, snapshots) {
                Tri::NotReady => {
                    self.emit_skip(position, &document.id, "indicator_not_ready");
                    continue;
                }
                Tri::False => continue,
                Tri::True => {}
            }

            if let Err(e) = self.dispatch(&document, position, snapshots).await {
                // Per-position failures never tear down the loop.
                error!("Entry dispatch failed for {}: {}", position.id, e);
            }
        }
    }

    /// Resolve the gating predicate for a declared position.
    fn gate(&mut self, position: &StrategyPosition, snapshots: &SnapshotMap) -> Tri {
        match position.entry_type {
            EntryType::Market => Tri::True,
            EntryType::Limit => {
                let limit = match position.entry_limit_price {
                    Some(p) => p,
                    None => return Tri::False,
                };
                match snapshots.get(&position.asset) {
                    Some(tick) => match position.direction {
                        PositionDirection::Long => Tri::from(tick.bid <= limit),
                        PositionDirection::Short => Tri::from(tick.ask >= limit),
                        PositionDirection::Close => Tri::False,
                    },
                    None => Tri::NotReady,
                }
            }
            EntryType::Conditional => match self.conditions.get_mut(&position.id) {
                Some(condition) => condition.evaluate(snapshots),
                None => Tri::NotReady,
            },
        }
    }

    async fn dispatch(
        &mut self,
        document: &Arc<StrategyDocument>,
        position: &StrategyPosition,
        snapshots: &SnapshotMap,
    ) -> crate::models::TradingResult<()> {
        let direction = match position.direction {
            PositionDirection::Long => Direction::Long,
            PositionDirection::Short => Direction::Short,
            PositionDirection::Close => return Ok(()),
        };

        let tick = match snapshots.get(&position.asset) {
            Some(t) => t,
            None => {
                self.emit_skip(position, &document.id, "indicator_not_ready");
                return Ok(());
            }
        };
        let reference_price = match direction {
            Direction::Long => tick.ask,
            Direction::Short => tick.bid,
        };

        let available_cash = self.router.available_cash().await?;
        let marks: HashMap<String, f64> =
            snapshots.iter().map(|(k, v)| (k.clone(), v.mid())).collect();
        let exposure = self.registry.total_exposure(&marks).await;
        let portfolio_value = available_cash + exposure;

        let quantity = match PositionSizer::size_entry(
            available_cash,
            portfolio_value,
            position.allocation_pct,
            document.portfolio_risk.max_per_position_pct,
            reference_price,
            self.router.min_order_quantity(&position.asset),
        ) {
            Ok(q) => q,
            Err(rejection) => {
                self.emit_skip(position, &document.id, rejection.as_reason());
                return Ok(());
            }
        };

        // Atomic claim: at most one dispatch per declared position, even
        // under concurrent evaluation.
        if !self.registry.claim_entry(&document.id, &position.id).await {
            return Ok(());
        }

        let request = OrderRequest::market(
            position.asset.clone(),
            direction.entry_side(),
            quantity,
            document.id.clone(),
            position.id.clone(),
            OrderIntent::Entry { direction },
        );
        let opened = self.router.submit_entry(request, direction).await?;

        info!(
            "🎯 Entry triggered: {} {} {} @ {}",
            direction, opened.quantity, position.asset, opened.average_entry_price
        );
        self.last_skip.remove(&position.id);
        self.events.emit(
            EventType::EntryTriggered,
            serde_json::json!({
                "strategy_id": document.id,
                "strategy_position_id": position.id,
                "asset": position.asset,
                "direction": direction.to_string(),
                "quantity": opened.quantity,
                "price": opened.average_entry_price,
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::exchange::PaperExchangeAdapter;
    use crate::execution::controls::OperationModeController;
    use crate::models::{MarketSnapshot, TradeMode};
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::tempdir;

    struct Harness {
        evaluator: EntryEvaluator,
        strategy: Arc<StrategyService>,
        registry: Arc<PositionRegistry>,
        events: Arc<EventLog>,
        safe_mode: Arc<SafeModeController>,
        paper: Arc<PaperExchangeAdapter>,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let events = Arc::new(EventLog::open(dir.path().join("events.log")).unwrap());
        let registry = Arc::new(PositionRegistry::open(dir.path()).unwrap());
        let safe_mode = Arc::new(SafeModeController::new(events.clone()));
        let risk = Arc::new(PortfolioRiskEnforcer::new(
            registry.clone(),
            safe_mode.clone(),
            events.clone(),
        ));
        let mode = Arc::new(OperationModeController::new(TradeMode::Paper, events.clone()));
        let paper = Arc::new(PaperExchangeAdapter::new(10_000.0, 0.0, 0.0001));
        let router = Arc::new(OrderRouter::new(
            paper.clone(),
            None,
            mode,
            registry.clone(),
            events.clone(),
        ));
        let strategy = Arc::new(StrategyService::new(
            dir.path().join("strategy.json"),
            5,
            50,
            events.clone(),
        ));
        let evaluator = EntryEvaluator::new(
            strategy.clone(),
            registry.clone(),
            risk,
            safe_mode.clone(),
            router,
            events.clone(),
        );
        Harness {
            evaluator,
            strategy,
            registry,
            events,
            safe_mode,
            paper,
            dir,
        }
    }

    fn write_strategy(harness: &Harness, positions_json: &str) {
        let window = Utc::now() + ChronoDuration::hours(4);
        let json = format!(
            r#"{{
  "mode": "paper",
  "posture": "moderate",
  "validity_window": "{}",
  "portfolio_risk": {{
    "max_drawdown_pct": 0.5,
    "daily_loss_limit_usd": 100000.0,
    "max_total_exposure_pct": 1.0,
    "max_per_position_pct": 1.0
  }},
  "positions": [{}]
}}"#,
            window.to_rfc3339(),
            positions_json
        );
        std::fs::write(harness.dir.path().join("strategy.json"), json).unwrap();
    }

    async fn load_and_arm(harness: &mut Harness) {
        harness.strategy.try_load().await.unwrap();
        let document = harness.strategy.snapshot().await.document.unwrap();
        harness.evaluator.on_strategy_swap(&document);
    }

    async fn tick(harness: &Harness, bid: f64, ask: f64) -> SnapshotMap {
        let snap = MarketSnapshot::new("BTC/USD", bid, ask).unwrap();
        harness.paper.push_snapshot(snap.clone()).await;
        let mut map = SnapshotMap::new();
        map.insert("BTC/USD".to_string(), snap);
        map
    }

    const MARKET_POSITION: &str = r#"{
      "id": "btc-long-1",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "market"
    }"#;

    #[tokio::test]
    async fn test_market_entry_fires_once_across_three_evaluations() {
        let mut harness = harness().await;
        write_strategy(&harness, MARKET_POSITION);
        load_and_arm(&mut harness).await;

        let snapshots = tick(&harness, 50_000.0, 50_010.0).await;
        let mut rx = harness.events.subscribe();

        for _ in 0..3 {
            harness.evaluator.evaluate_tick(&snapshots).await;
        }

        let positions = harness.registry.open_positions().await;
        assert_eq!(positions.len(), 1);
        let expected = 1_000.0 / 50_010.0;
        assert!((positions[0].quantity - expected).abs() < 1e-9);

        let mut entry_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == EventType::EntryTriggered {
                entry_events += 1;
            }
        }
        assert_eq!(entry_events, 1);
    }

    #[tokio::test]
    async fn test_conditional_entry_gates_on_threshold() {
        let mut harness = harness().await;
        write_strategy(
            &harness,
            r#"{
      "id": "btc-cond-1",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "conditional",
      "entry_condition": "price(BTC/USD) > 40000"
    }"#,
        );
        load_and_arm(&mut harness).await;

        let below = tick(&harness, 38_000.0, 38_000.0).await;
        harness.evaluator.evaluate_tick(&below).await;
        assert!(harness.registry.open_positions().await.is_empty());

        let above = tick(&harness, 41_000.0, 41_000.0).await;
        harness.evaluator.evaluate_tick(&above).await;
        assert_eq!(harness.registry.open_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_safe_mode_blocks_and_emits_skip() {
        let mut harness = harness().await;
        write_strategy(&harness, MARKET_POSITION);
        load_and_arm(&mut harness).await;
        harness.safe_mode.activate("operator drill");

        let snapshots = tick(&harness, 50_000.0, 50_010.0).await;
        let mut rx = harness.events.subscribe();
        harness.evaluator.evaluate_tick(&snapshots).await;

        assert!(harness.registry.open_positions().await.is_empty());
        let skip = rx.try_recv().unwrap();
        assert_eq!(skip.event_type, EventType::EntrySkipped);
        assert_eq!(skip.data["reason"], "safe_mode");
    }

    #[tokio::test]
    async fn test_limit_entry_waits_for_price() {
        let mut harness = harness().await;
        write_strategy(
            &harness,
            r#"{
      "id": "btc-limit-1",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "limit",
      "entry_limit_price": 49000.0
    }"#,
        );
        load_and_arm(&mut harness).await;

        let above_limit = tick(&harness, 50_000.0, 50_010.0).await;
        harness.evaluator.evaluate_tick(&above_limit).await;
        assert!(harness.registry.open_positions().await.is_empty());

        let at_limit = tick(&harness, 48_900.0, 48_910.0).await;
        harness.evaluator.evaluate_tick(&at_limit).await;
        assert_eq!(harness.registry.open_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_indicator_not_ready_skips() {
        let mut harness = harness().await;
        write_strategy(
            &harness,
            r#"{
      "id": "btc-cond-2",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "conditional",
      "entry_condition": "rsi(14, BTC/USD) < 30"
    }"#,
        );
        load_and_arm(&mut harness).await;

        let snapshots = tick(&harness, 50_000.0, 50_010.0).await;
        let mut rx = harness.events.subscribe();
        harness.evaluator.evaluate_tick(&snapshots).await;

        assert!(harness.registry.open_positions().await.is_empty());
        let skip = rx.try_recv().unwrap();
        assert_eq!(skip.data["reason"], "indicator_not_ready");

        // Identical reason next tick is not re-emitted.
        harness.evaluator.evaluate_tick(&snapshots).await;
        assert!(rx.try_recv().is_err());
    }
}

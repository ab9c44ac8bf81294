use crate::events::{EventLog, EventType};
use crate::execution::controls::SafeModeController;
use crate::execution::registry::PositionRegistry;
use crate::strategy::PortfolioRisk;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Snapshot of the enforcer's latest verdict.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskStatus {
    pub entries_suspended: bool,
    pub reasons: Vec<String>,
    pub exposure_fraction: f64,
    pub daily_realized_loss_usd: f64,
    pub drawdown_fraction: f64,
}

/// Gate that suspends new entries when exposure, daily loss, or drawdown
/// limits are reached. Crossing the drawdown limit additionally trips
/// safe-mode. Recomputed after every fill and periodically.
pub struct PortfolioRiskEnforcer {
    registry: Arc<PositionRegistry>,
    safe_mode: Arc<SafeModeController>,
    events: Arc<EventLog>,
    status: RwLock<RiskStatus>,
    peak_equity: RwLock<f64>,
}

impl PortfolioRiskEnforcer {
    pub fn new(
        registry: Arc<PositionRegistry>,
        safe_mode: Arc<SafeModeController>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            registry,
            safe_mode,
            events,
            status: RwLock::new(RiskStatus::default()),
            peak_equity: RwLock::new(0.0),
        }
    }

    pub fn status(&self) -> RiskStatus {
        self.status.read().expect("risk status lock").clone()
    }

    pub fn entries_suspended(&self) -> bool {
        self.status.read().expect("risk status lock").entries_suspended
    }

    pub async fn recompute(
        &self,
        limits: &PortfolioRisk,
        available_cash: f64,
        marks: &HashMap<String, f64>,
    ) -> RiskStatus {
        let exposure = self.registry.total_exposure(marks).await;
        let unrealized = self.registry.unrealized_pnl(marks).await;
        let equity = available_cash + exposure + unrealized.min(0.0);
        let portfolio_value = available_cash + exposure;

        let exposure_fraction = if portfolio_value > 0.0 {
            exposure / portfolio_value
        } else {
            0.0
        };

        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
        let daily_pnl = self.registry.realized_pnl_since(midnight).await;
        let daily_realized_loss_usd = (-daily_pnl).max(0.0);

        let drawdown_fraction = {
            let mut peak = self.peak_equity.write().expect("peak equity lock");
            if equity > *peak {
                *peak = equity;
            }
            if *peak > 0.0 {
                ((*peak - equity) / *peak).max(0.0)
            } else {
                0.0
            }
        };

        let mut reasons = Vec::new();
        if exposure_fraction >= limits.max_total_exposure_pct {
            reasons.push(format!(
                "exposure {:.3} >= max_total_exposure {:.3}",
                exposure_fraction, limits.max_total_exposure_pct
            ));
        }
        if limits.daily_loss_limit_usd > 0.0
            && daily_realized_loss_usd >= limits.daily_loss_limit_usd
        {
            reasons.push(format!(
                "daily loss {:.2} >= limit {:.2}",
                daily_realized_loss_usd, limits.daily_loss_limit_usd
            ));
        }
        let drawdown_breached = drawdown_fraction >= limits.max_drawdown_pct;
        if drawdown_breached {
            reasons.push(format!(
                "drawdown {:.3} >= max_drawdown {:.3}",
                drawdown_fraction, limits.max_drawdown_pct
            ));
        }

        let status = RiskStatus {
            entries_suspended: !reasons.is_empty(),
            reasons: reasons.clone(),
            exposure_fraction,
            daily_realized_loss_usd,
            drawdown_fraction,
        };

        let was_suspended = {
            let mut current = self.status.write().expect("risk status lock");
            let was = current.entries_suspended;
            *current = status.clone();
            was
        };

        if status.entries_suspended && !was_suspended {
            warn!("🛑 Entries suspended: {}", reasons.join("; "));
            self.events.emit(
                EventType::RiskSuspended,
                serde_json::json!({ "reasons": reasons }),
            );
        }
        if drawdown_breached {
            self.safe_mode.activate(&format!(
                "max drawdown breached ({:.3} >= {:.3})",
                drawdown_fraction, limits.max_drawdown_pct
            ));
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use tempfile::tempdir;

    fn limits() -> PortfolioRisk {
        PortfolioRisk {
            max_drawdown_pct: 0.2,
            daily_loss_limit_usd: 500.0,
            max_total_exposure_pct: 0.5,
            max_per_position_pct: 0.25,
        }
    }

    fn build(dir: &std::path::Path) -> (PortfolioRiskEnforcer, Arc<PositionRegistry>, Arc<EventLog>) {
        let events = Arc::new(EventLog::open(dir.join("events.log")).unwrap());
        let registry = Arc::new(PositionRegistry::open(dir).unwrap());
        let safe_mode = Arc::new(SafeModeController::new(events.clone()));
        let enforcer = PortfolioRiskEnforcer::new(registry.clone(), safe_mode, events.clone());
        (enforcer, registry, events)
    }

    #[tokio::test]
    async fn test_no_positions_no_suspension() {
        let dir = tempdir().unwrap();
        let (enforcer, _registry, _events) = build(dir.path());
        let status = enforcer.recompute(&limits(), 10_000.0, &HashMap::new()).await;
        assert!(!status.entries_suspended);
        assert_eq!(status.exposure_fraction, 0.0);
    }

    #[tokio::test]
    async fn test_exposure_limit_suspends_entries() {
        let dir = tempdir().unwrap();
        let (enforcer, registry, events) = build(dir.path());
        registry
            .record_entry_fill("s1", "p1", "BTC/USD", Direction::Long, 1.0, 50_000.0)
            .await
            .unwrap();

        let mut rx = events.subscribe();
        let marks: HashMap<String, f64> = [("BTC/USD".to_string(), 50_000.0)].into();
        // 50k exposure against 10k cash: fraction well above the 0.5 limit.
        let status = enforcer.recompute(&limits(), 10_000.0, &marks).await;
        assert!(status.entries_suspended);
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::RiskSuspended);

        // Already suspended: no duplicate event on recompute.
        enforcer.recompute(&limits(), 10_000.0, &marks).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_daily_loss_limit() {
        let dir = tempdir().unwrap();
        let (enforcer, registry, _events) = build(dir.path());
        let position = registry
            .record_entry_fill("s1", "p1", "BTC/USD", Direction::Long, 1.0, 50_000.0)
            .await
            .unwrap();
        // Realise a 1,000 USD loss, above the 500 limit.
        registry
            .record_exit_fill(position.id, 1.0, 49_000.0, 0.0, "x1")
            .await
            .unwrap();

        let status = enforcer.recompute(&limits(), 9_000.0, &HashMap::new()).await;
        assert!(status.entries_suspended);
        assert!((status.daily_realized_loss_usd - 1_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_drawdown_trips_safe_mode() {
        let dir = tempdir().unwrap();
        let events = Arc::new(EventLog::open(dir.path().join("events.log")).unwrap());
        let registry = Arc::new(PositionRegistry::open(dir.path()).unwrap());
        let safe_mode = Arc::new(SafeModeController::new(events.clone()));
        let enforcer =
            PortfolioRiskEnforcer::new(registry.clone(), safe_mode.clone(), events.clone());

        // Establish a 10k peak, then collapse equity by 30%.
        enforcer.recompute(&limits(), 10_000.0, &HashMap::new()).await;
        assert!(!safe_mode.is_active());

        let status = enforcer.recompute(&limits(), 7_000.0, &HashMap::new()).await;
        assert!(status.drawdown_fraction >= 0.2);
        assert!(status.entries_suspended);
        assert!(safe_mode.is_active());
    }
}

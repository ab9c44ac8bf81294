use crate::events::{EventLog, EventType};
use crate::exchange::ExchangeAdapter;
use crate::execution::controls::OperationModeController;
use crate::execution::registry::PositionRegistry;
use crate::models::{
    Direction, ExitReason, OpenPosition, OrderIntent, OrderRequest, OrderStatus, Trade, TradeMode,
    TradingError, TradingResult,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Sole origin of order submissions. Assigns internal ids, dispatches to
/// the mode-selected adapter, and records fills into the registry before
/// returning to the caller.
pub struct OrderRouter {
    paper: Arc<dyn ExchangeAdapter>,
    live: Option<Arc<dyn ExchangeAdapter>>,
    mode: Arc<OperationModeController>,
    registry: Arc<PositionRegistry>,
    events: Arc<EventLog>,
}

impl OrderRouter {
    pub fn new(
        paper: Arc<dyn ExchangeAdapter>,
        live: Option<Arc<dyn ExchangeAdapter>>,
        mode: Arc<OperationModeController>,
        registry: Arc<PositionRegistry>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            paper,
            live,
            mode,
            registry,
            events,
        }
    }

    fn adapter(&self) -> TradingResult<Arc<dyn ExchangeAdapter>> {
        match self.mode.mode() {
            TradeMode::Paper => Ok(self.paper.clone()),
            TradeMode::Live => self.live.clone().ok_or_else(|| {
                TradingError::ConfigError("live mode selected but no live adapter configured".into())
            }),
        }
    }

    /// Dispatch an entry order. The caller must hold the entry claim; on
    /// rejection the claim is released so a later tick may retry.
    pub async fn submit_entry(
        &self,
        request: OrderRequest,
        direction: Direction,
    ) -> TradingResult<OpenPosition> {
        let adapter = self.adapter()?;
        if adapter.rate_limited() {
            self.registry
                .release_entry_claim(&request.strategy_id, &request.strategy_position_id);
            return Err(TradingError::NetworkError(format!(
                "{} is rate limiting; entry deferred",
                adapter.name()
            )));
        }

        self.events.emit(
            EventType::OrderPlaced,
            serde_json::json!({
                "order_id": request.id,
                "symbol": request.symbol,
                "side": request.side.to_string(),
                "quantity": request.quantity,
                "strategy_position_id": request.strategy_position_id,
            }),
        );

        match adapter.place_order(&request).await {
            Ok(ack) if ack.status == OrderStatus::Filled || ack.status == OrderStatus::PartiallyFilled => {
                let price = ack.fill_price.ok_or_else(|| {
                    TradingError::InvariantViolation(format!(
                        "fill for {} without a price",
                        request.id
                    ))
                })?;
                let position = self
                    .registry
                    .record_entry_fill(
                        &request.strategy_id,
                        &request.strategy_position_id,
                        &request.symbol,
                        direction,
                        ack.filled_quantity,
                        price,
                    )
                    .await?;
                info!(
                    "✅ Entry filled: {} {} {} @ {}",
                    request.side, ack.filled_quantity, request.symbol, price
                );
                self.events.emit(
                    EventType::OrderFilled,
                    serde_json::json!({
                        "order_id": request.id,
                        "exchange_order_id": ack.exchange_order_id,
                        "quantity": ack.filled_quantity,
                        "price": price,
                    }),
                );
                Ok(position)
            }
            Ok(ack) => {
                self.registry
                    .release_entry_claim(&request.strategy_id, &request.strategy_position_id);
                self.events.emit(
                    EventType::OrderRejected,
                    serde_json::json!({
                        "order_id": request.id,
                        "status": format!("{:?}", ack.status),
                    }),
                );
                Err(TradingError::ExchangeError(format!(
                    "order {} not filled: {:?}",
                    request.id, ack.status
                )))
            }
            Err(e) => {
                self.registry
                    .release_entry_claim(&request.strategy_id, &request.strategy_position_id);
                error!("💥 Entry order {} failed: {}", request.id, e);
                self.events.emit(
                    EventType::OrderRejected,
                    serde_json::json!({ "order_id": request.id, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Dispatch a (partial or full) close. The caller must have set the
    /// position's in-flight flag via `begin_close`; this routine clears it
    /// on both fill and rejection.
    pub async fn submit_exit(
        &self,
        request: OrderRequest,
        reason: ExitReason,
    ) -> TradingResult<Option<Trade>> {
        let position_id = match &request.intent {
            OrderIntent::Exit { position_id, .. } => *position_id,
            OrderIntent::Entry { .. } => {
                return Err(TradingError::InvariantViolation(
                    "submit_exit called with an entry intent".into(),
                ))
            }
        };

        let result = async {
            let adapter = self.adapter()?;
            if adapter.rate_limited() {
                return Err(TradingError::NetworkError(format!(
                    "{} is rate limiting; exit deferred",
                    adapter.name()
                )));
            }

            self.events.emit(
                EventType::OrderPlaced,
                serde_json::json!({
                    "order_id": request.id,
                    "symbol": request.symbol,
                    "side": request.side.to_string(),
                    "quantity": request.quantity,
                    "reason": reason.to_string(),
                }),
            );

            let ack = adapter.place_order(&request).await?;
            if ack.status != OrderStatus::Filled && ack.status != OrderStatus::PartiallyFilled {
                self.events.emit(
                    EventType::OrderRejected,
                    serde_json::json!({
                        "order_id": request.id,
                        "status": format!("{:?}", ack.status),
                    }),
                );
                return Err(TradingError::ExchangeError(format!(
                    "close order {} not filled: {:?}",
                    request.id, ack.status
                )));
            }

            let price = ack.fill_price.ok_or_else(|| {
                TradingError::InvariantViolation(format!("fill for {} without a price", request.id))
            })?;
            let trade = self
                .registry
                .record_exit_fill(
                    position_id,
                    ack.filled_quantity,
                    price,
                    ack.fee,
                    &ack.exchange_order_id,
                )
                .await?;
            info!(
                "✅ Exit filled ({}): {} {} @ {}",
                reason, ack.filled_quantity, request.symbol, price
            );
            self.events.emit(
                EventType::OrderFilled,
                serde_json::json!({
                    "order_id": request.id,
                    "exchange_order_id": ack.exchange_order_id,
                    "quantity": ack.filled_quantity,
                    "price": price,
                    "reason": reason.to_string(),
                }),
            );
            Ok(trade)
        }
        .await;

        self.registry.end_close(position_id);
        if let Err(e) = &result {
            warn!("💥 Exit order {} failed: {}", request.id, e);
            self.events.emit(
                EventType::OrderRejected,
                serde_json::json!({ "order_id": request.id, "error": e.to_string() }),
            );
        }
        result
    }

    /// Free quote-currency balance on the mode-selected venue.
    pub async fn available_cash(&self) -> TradingResult<f64> {
        let adapter = self.adapter()?;
        let balances = adapter.balances().await?;
        Ok(balances.get("USD").copied().unwrap_or(0.0))
    }

    pub fn min_order_quantity(&self, symbol: &str) -> f64 {
        match self.adapter() {
            Ok(adapter) => adapter.min_order_quantity(symbol),
            Err(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchangeAdapter;
    use crate::models::{MarketSnapshot, OrderSide};
    use tempfile::tempdir;

    async fn build(dir: &std::path::Path) -> (OrderRouter, Arc<PositionRegistry>, Arc<PaperExchangeAdapter>) {
        let events = Arc::new(EventLog::open(dir.join("events.log")).unwrap());
        let registry = Arc::new(PositionRegistry::open(dir).unwrap());
        let mode = Arc::new(OperationModeController::new(TradeMode::Paper, events.clone()));
        let paper = Arc::new(PaperExchangeAdapter::new(10_000.0, 0.0, 0.0001));
        paper
            .push_snapshot(MarketSnapshot::new("BTC/USD", 50_000.0, 50_010.0).unwrap())
            .await;
        let router = OrderRouter::new(paper.clone(), None, mode, registry.clone(), events);
        (router, registry, paper)
    }

    #[tokio::test]
    async fn test_entry_fill_creates_position() {
        let dir = tempdir().unwrap();
        let (router, registry, _paper) = build(dir.path()).await;

        assert!(registry.claim_entry("s1", "p1").await);
        let request = OrderRequest::market(
            "BTC/USD",
            OrderSide::Buy,
            0.02,
            "s1",
            "p1",
            OrderIntent::Entry {
                direction: Direction::Long,
            },
        );
        let position = router.submit_entry(request, Direction::Long).await.unwrap();
        assert_eq!(position.average_entry_price, 50_010.0);
        assert!(registry.position_for("s1", "p1").await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_entry_releases_claim() {
        let dir = tempdir().unwrap();
        let (router, registry, _paper) = build(dir.path()).await;

        assert!(registry.claim_entry("s1", "p1").await);
        // Order for an unknown symbol: the paper venue rejects it.
        let request = OrderRequest::market(
            "DOGE/USD",
            OrderSide::Buy,
            1.0,
            "s1",
            "p1",
            OrderIntent::Entry {
                direction: Direction::Long,
            },
        );
        assert!(router.submit_entry(request, Direction::Long).await.is_err());
        // Claim released: a later tick may retry.
        assert!(registry.claim_entry("s1", "p1").await);
    }

    #[tokio::test]
    async fn test_exit_clears_in_flight_flag() {
        let dir = tempdir().unwrap();
        let (router, registry, _paper) = build(dir.path()).await;

        let position = registry
            .record_entry_fill("s1", "p1", "BTC/USD", Direction::Long, 0.5, 40_000.0)
            .await
            .unwrap();
        assert!(registry.begin_close(position.id));

        let request = OrderRequest::market(
            "BTC/USD",
            OrderSide::Sell,
            0.5,
            "s1",
            "p1",
            OrderIntent::Exit {
                position_id: position.id,
                reason: ExitReason::StopLossHard,
            },
        );
        let trade = router
            .submit_exit(request, ExitReason::StopLossHard)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.side, OrderSide::Sell);
        assert!(!registry.is_closing(position.id));
        assert!(registry.position_by_id(position.id).await.is_none());
    }
}

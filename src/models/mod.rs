use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// One market tick for a single asset, as delivered by the exchange adapter.
///
/// Snapshots are immutable: produced by the adapter, fanned out by the hub,
/// consumed within one tick and discarded. Indicator values (RSI_14, EMA_50,
/// ...) are computed upstream and arrive as named scalars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, bid: f64, ask: f64) -> TradingResult<Self> {
        if bid > ask {
            return Err(TradingError::ValidationError(format!(
                "crossed quote: bid {} > ask {}",
                bid, ask
            )));
        }
        Ok(Self {
            symbol: symbol.into(),
            bid,
            ask,
            timestamp: Utc::now(),
            indicators: HashMap::new(),
        })
    }

    pub fn with_indicator(mut self, key: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(key.into(), value);
        self
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Map of the most recent snapshot per asset, passed to every evaluation.
pub type SnapshotMap = HashMap<String, MarketSnapshot>;

/// Paper/live switch. Gates which adapter the order router dispatches to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Paper,
    Live,
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeMode::Paper => write!(f, "paper"),
            TradeMode::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of a realised position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side used to open a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side used to close a position in this direction.
    pub fn exit_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    PartiallyFilled,
    Rejected,
    Cancelled,
}

/// Why an exit order was dispatched. Serialised into events as snake_case
/// (take-profit reasons carry the ladder index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ExitAll,
    StopLossHard,
    StopLossTrailing,
    TakeProfitTarget(usize),
    TimeExit,
    Invalidation,
    DeclaredClose,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::ExitAll => write!(f, "exit_all"),
            ExitReason::StopLossHard => write!(f, "stop_loss_hard"),
            ExitReason::StopLossTrailing => write!(f, "stop_loss_trailing"),
            ExitReason::TakeProfitTarget(i) => write!(f, "take_profit_target_{}", i),
            ExitReason::TimeExit => write!(f, "time_exit"),
            ExitReason::Invalidation => write!(f, "invalidation"),
            ExitReason::DeclaredClose => write!(f, "declared_close"),
        }
    }
}

/// What an order is for. Entries carry the declared-position back-link that
/// the dispatch-once rule is keyed on; exits carry their reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OrderIntent {
    Entry {
        direction: Direction,
    },
    Exit {
        position_id: Uuid,
        reason: ExitReason,
    },
}

/// Order request as handed to the order router. The router is the only
/// component that talks to the adapter's order-placement capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub strategy_id: String,
    pub strategy_position_id: String,
    pub intent: OrderIntent,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        strategy_id: impl Into<String>,
        strategy_position_id: impl Into<String>,
        intent: OrderIntent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            strategy_id: strategy_id.into(),
            strategy_position_id: strategy_position_id.into(),
            intent,
            created_at: Utc::now(),
        }
    }
}

/// Adapter acknowledgement for a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: Uuid,
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub fill_price: Option<f64>,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// A realised live position. Exactly one exists per
/// (strategy_id, strategy_position_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: Uuid,
    pub strategy_id: String,
    pub strategy_position_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Remaining quantity. Always > 0 while the position exists.
    pub quantity: f64,
    /// Quantity at open, before any partial closes. Take-profit partial
    /// closes are sized against this, not the remaining quantity.
    pub original_quantity: f64,
    pub average_entry_price: f64,
    pub opened_at: DateTime<Utc>,
    /// Trailing stop level. Moves only in the favourable direction.
    pub trailing_stop_price: Option<f64>,
    #[serde(default)]
    pub take_profit_indices_hit: BTreeSet<usize>,
    pub updated_at: DateTime<Utc>,
}

impl OpenPosition {
    pub fn new(
        strategy_id: impl Into<String>,
        strategy_position_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        quantity: f64,
        entry_price: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.into(),
            strategy_position_id: strategy_position_id.into(),
            symbol: symbol.into(),
            direction,
            quantity,
            original_quantity: quantity,
            average_entry_price: entry_price,
            opened_at: now,
            trailing_stop_price: None,
            take_profit_indices_hit: BTreeSet::new(),
            updated_at: now,
        }
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        match self.direction {
            Direction::Long => (mark_price - self.average_entry_price) * self.quantity,
            Direction::Short => (self.average_entry_price - mark_price) * self.quantity,
        }
    }

    pub fn notional(&self, mark_price: f64) -> f64 {
        self.quantity * mark_price
    }

    /// Fold an additional entry fill into the weighted-average entry price.
    pub fn apply_entry_fill(&mut self, quantity: f64, price: f64) {
        let total = self.quantity + quantity;
        if total > 0.0 {
            self.average_entry_price =
                (self.average_entry_price * self.quantity + price * quantity) / total;
        }
        self.quantity = total;
        self.original_quantity = self.original_quantity.max(total);
        self.updated_at = Utc::now();
    }
}

/// Closed fill record. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub exchange_trade_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub strategy_id: String,
    pub timestamp: DateTime<Utc>,
}

// Error taxonomy. Validation rejects at the boundary, transient-remote is
// retried with backoff, permanent-remote surfaces immediately, invariant
// violations quiesce the component, cancellation is expected during shutdown.
#[derive(Debug, thiserror::Error)]
pub enum TradingError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Exchange error: {0}")]
    ExchangeError(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Strategy error: {0}")]
    StrategyError(String),

    #[error("Condition parse error: {0}")]
    ConditionParseError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Agent error: {0}")]
    AgentError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rejects_crossed_quote() {
        assert!(MarketSnapshot::new("BTC/USD", 50010.0, 50000.0).is_err());
        let snap = MarketSnapshot::new("BTC/USD", 50000.0, 50010.0).unwrap();
        assert_eq!(snap.mid(), 50005.0);
    }

    #[test]
    fn test_position_pnl_by_direction() {
        let long = OpenPosition::new("s1", "p1", "BTC/USD", Direction::Long, 0.5, 40000.0);
        assert_eq!(long.unrealized_pnl(41000.0), 500.0);

        let short = OpenPosition::new("s1", "p2", "BTC/USD", Direction::Short, 0.5, 40000.0);
        assert_eq!(short.unrealized_pnl(41000.0), -500.0);
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut pos = OpenPosition::new("s1", "p1", "ETH/USD", Direction::Long, 1.0, 2000.0);
        pos.apply_entry_fill(1.0, 2100.0);
        assert_eq!(pos.quantity, 2.0);
        assert_eq!(pos.average_entry_price, 2050.0);
    }

    #[test]
    fn test_exit_reason_labels() {
        assert_eq!(
            ExitReason::TakeProfitTarget(1).to_string(),
            "take_profit_target_1"
        );
        assert_eq!(ExitReason::StopLossHard.to_string(), "stop_loss_hard");
    }
}

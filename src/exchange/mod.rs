pub mod paper;

use crate::models::{
    MarketSnapshot, OrderAck, OrderRequest, OrderStatus, Trade, TradingResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

pub use paper::PaperExchangeAdapter;

/// Unified exchange capability: market data in, orders out, account state
/// on demand. The order router is the only caller of `place_order`.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Begin streaming ticks for the given symbols, replacing any previous
    /// subscription. Per-symbol ticks arrive in timestamp order.
    async fn subscribe(&self, symbols: Vec<String>) -> TradingResult<mpsc::Receiver<MarketSnapshot>>;

    async fn place_order(&self, request: &OrderRequest) -> TradingResult<OrderAck>;

    async fn cancel_order(&self, exchange_order_id: &str) -> TradingResult<()>;

    async fn order_status(&self, exchange_order_id: &str) -> TradingResult<OrderStatus>;

    /// Free balances per currency (quote currency included).
    async fn balances(&self) -> TradingResult<HashMap<String, f64>>;

    async fn trade_history(&self) -> TradingResult<Vec<Trade>>;

    /// Minimum order quantity for a symbol; sizing rejects below this.
    fn min_order_quantity(&self, symbol: &str) -> f64;

    /// True while the venue is throttling us; the router backs off.
    fn rate_limited(&self) -> bool;

    fn name(&self) -> &str;
}

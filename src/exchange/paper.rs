use crate::exchange::ExchangeAdapter;
use crate::models::{
    MarketSnapshot, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, Trade,
    TradingError, TradingResult,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Simulated venue for paper trading and tests. Ticks are injected with
/// `push_snapshot` (by the market-data bridge or a test harness); market
/// orders fill instantly at the current top of book.
pub struct PaperExchangeAdapter {
    cash: RwLock<HashMap<String, f64>>,
    last_tick: DashMap<String, MarketSnapshot>,
    subscriber: StdMutex<Option<(Vec<String>, mpsc::Sender<MarketSnapshot>)>>,
    fills: StdMutex<Vec<Trade>>,
    fee_bps: f64,
    min_quantity: f64,
    order_seq: AtomicU64,
}

impl PaperExchangeAdapter {
    pub fn new(initial_cash_usd: f64, fee_bps: f64, min_quantity: f64) -> Self {
        let mut cash = HashMap::new();
        cash.insert("USD".to_string(), initial_cash_usd);
        Self {
            cash: RwLock::new(cash),
            last_tick: DashMap::new(),
            subscriber: StdMutex::new(None),
            fills: StdMutex::new(Vec::new()),
            fee_bps,
            min_quantity,
            order_seq: AtomicU64::new(1),
        }
    }

    /// Inject a tick. Forwards to the active subscription when the symbol
    /// is subscribed and records it as the venue's top of book.
    pub async fn push_snapshot(&self, snapshot: MarketSnapshot) {
        self.last_tick
            .insert(snapshot.symbol.clone(), snapshot.clone());
        let tx = {
            let guard = self.subscriber.lock().expect("paper subscriber lock");
            match guard.as_ref() {
                Some((symbols, tx)) if symbols.contains(&snapshot.symbol) => Some(tx.clone()),
                _ => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(snapshot).await;
        }
    }

    fn fill_price(&self, request: &OrderRequest) -> TradingResult<f64> {
        let tick = self.last_tick.get(&request.symbol).ok_or_else(|| {
            TradingError::ExchangeError(format!("no market for {}", request.symbol))
        })?;
        Ok(match request.side {
            OrderSide::Buy => tick.ask,
            OrderSide::Sell => tick.bid,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchangeAdapter {
    async fn subscribe(
        &self,
        symbols: Vec<String>,
    ) -> TradingResult<mpsc::Receiver<MarketSnapshot>> {
        let (tx, rx) = mpsc::channel(256);
        info!("📡 Paper adapter subscription: {:?}", symbols);
        *self.subscriber.lock().expect("paper subscriber lock") = Some((symbols, tx));
        Ok(rx)
    }

    async fn place_order(&self, request: &OrderRequest) -> TradingResult<OrderAck> {
        if request.quantity <= 0.0 {
            return Err(TradingError::ValidationError(format!(
                "order quantity {} must be positive",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Err(TradingError::ValidationError(
                "limit order without limit_price".to_string(),
            ));
        }

        let price = self.fill_price(request)?;
        let notional = price * request.quantity;
        let fee = notional * self.fee_bps / 10_000.0;

        {
            let mut cash = self.cash.write().await;
            let balance = cash.entry("USD".to_string()).or_insert(0.0);
            match request.side {
                OrderSide::Buy => {
                    let required = notional + fee;
                    if *balance < required {
                        return Err(TradingError::InsufficientBalance {
                            required,
                            available: *balance,
                        });
                    }
                    *balance -= required;
                }
                OrderSide::Sell => {
                    *balance += notional - fee;
                }
            }
        }

        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);
        let exchange_order_id = format!("paper-{}", seq);
        debug!(
            "🧾 Paper fill: {} {} {} @ {} (fee {:.4})",
            request.side, request.quantity, request.symbol, price, fee
        );

        self.fills.lock().expect("paper fills lock").push(Trade {
            id: Uuid::new_v4(),
            exchange_trade_id: exchange_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price,
            fee,
            realized_pnl: 0.0,
            strategy_id: request.strategy_id.clone(),
            timestamp: Utc::now(),
        });

        Ok(OrderAck {
            order_id: request.id,
            exchange_order_id,
            status: OrderStatus::Filled,
            filled_quantity: request.quantity,
            fill_price: Some(price),
            fee,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, _exchange_order_id: &str) -> TradingResult<()> {
        // Paper fills are immediate; there is never anything resting.
        Ok(())
    }

    async fn order_status(&self, _exchange_order_id: &str) -> TradingResult<OrderStatus> {
        Ok(OrderStatus::Filled)
    }

    async fn balances(&self) -> TradingResult<HashMap<String, f64>> {
        Ok(self.cash.read().await.clone())
    }

    async fn trade_history(&self) -> TradingResult<Vec<Trade>> {
        Ok(self.fills.lock().expect("paper fills lock").clone())
    }

    fn min_order_quantity(&self, _symbol: &str) -> f64 {
        self.min_quantity
    }

    fn rate_limited(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "paper"
    }
}

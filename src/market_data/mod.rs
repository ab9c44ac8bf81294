use crate::exchange::ExchangeAdapter;
use crate::models::{MarketSnapshot, SnapshotMap, TradingResult};
use crate::strategy::StrategyDocument;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Distributes ticks from the active adapter to subscribers (entry and exit
/// evaluators, dashboard feed) and keeps a last-tick-per-asset cache.
///
/// Per-asset ordering is preserved from the adapter; cross-asset order is
/// not guaranteed.
pub struct MarketDataHub {
    adapter: Arc<dyn ExchangeAdapter>,
    tick_tx: broadcast::Sender<MarketSnapshot>,
    last_ticks: Arc<DashMap<String, MarketSnapshot>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MarketDataHub {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        let (tick_tx, _) = broadcast::channel(1024);
        Self {
            adapter,
            tick_tx,
            last_ticks: Arc::new(DashMap::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketSnapshot> {
        self.tick_tx.subscribe()
    }

    /// Defensive copy of the latest snapshot per asset.
    pub fn snapshot_map(&self) -> SnapshotMap {
        self.last_ticks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn last_tick(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.last_ticks.get(symbol).map(|e| e.value().clone())
    }

    /// Replace the adapter subscription with the given symbol set and pump
    /// its ticks into the broadcast. Called at startup and on every
    /// strategy swap that changes the active symbol union.
    pub async fn set_symbols(&self, symbols: Vec<String>) -> TradingResult<()> {
        let mut pump = self.pump.lock().await;
        if let Some(handle) = pump.take() {
            handle.abort();
        }
        if symbols.is_empty() {
            info!("📡 Market-data hub idle (no active symbols)");
            return Ok(());
        }

        info!("📡 Market-data hub subscribing: {:?}", symbols);
        let mut rx = self.adapter.subscribe(symbols).await?;
        let tick_tx = self.tick_tx.clone();
        let last_ticks = self.last_ticks.clone();

        *pump = Some(tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                // Per-asset timestamps must be non-decreasing; a stale tick
                // is an adapter fault and is dropped.
                if let Some(prev) = last_ticks.get(&snapshot.symbol) {
                    if snapshot.timestamp < prev.timestamp {
                        warn!(
                            "Dropping out-of-order tick for {} ({} < {})",
                            snapshot.symbol, snapshot.timestamp, prev.timestamp
                        );
                        continue;
                    }
                }
                last_ticks.insert(snapshot.symbol.clone(), snapshot.clone());
                debug!(
                    "tick {} bid={} ask={}",
                    snapshot.symbol, snapshot.bid, snapshot.ask
                );
                let _ = tick_tx.send(snapshot);
            }
        }));
        Ok(())
    }

    /// Follow strategy swaps, re-subscribing whenever the symbol union
    /// changes.
    pub async fn run(
        self: Arc<Self>,
        mut swaps: broadcast::Receiver<Arc<StrategyDocument>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut current: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                swap = swaps.recv() => {
                    match swap {
                        Ok(document) => {
                            let symbols: Vec<String> = document.symbols().into_iter().collect();
                            if symbols != current {
                                if let Err(e) = self.set_symbols(symbols.clone()).await {
                                    warn!("Failed to re-subscribe market data: {}", e);
                                    continue;
                                }
                                current = symbols;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Market-data hub lagged {} strategy swaps", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchangeAdapter;

    #[tokio::test]
    async fn test_fan_out_and_cache() {
        let adapter = Arc::new(PaperExchangeAdapter::new(1_000.0, 0.0, 0.0001));
        let hub = MarketDataHub::new(adapter.clone());
        hub.set_symbols(vec!["BTC/USD".to_string()]).await.unwrap();

        let mut rx_a = hub.subscribe();
        let mut rx_b = hub.subscribe();

        adapter
            .push_snapshot(MarketSnapshot::new("BTC/USD", 50_000.0, 50_010.0).unwrap())
            .await;

        let tick_a = rx_a.recv().await.unwrap();
        let tick_b = rx_b.recv().await.unwrap();
        assert_eq!(tick_a.symbol, "BTC/USD");
        assert_eq!(tick_b.bid, 50_000.0);

        let cached = hub.last_tick("BTC/USD").unwrap();
        assert_eq!(cached.ask, 50_010.0);
        assert_eq!(hub.snapshot_map().len(), 1);
    }
}

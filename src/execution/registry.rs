use crate::models::{Direction, OpenPosition, Trade, TradingError, TradingResult};
use crate::utils::persistence::{atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Durable ledger of open positions and closed trades.
///
/// The registry is the exclusive owner of both collections. Writes are
/// serialised behind a single mutex and persisted (write-temp, rename,
/// fsync) under the same lock before the mutation is acknowledged; crash
/// recovery reloads the last consistent on-disk state. Reads hand out
/// defensive copies.
pub struct PositionRegistry {
    positions_path: PathBuf,
    trades_path: PathBuf,
    inner: Mutex<Ledger>,
    /// Entry-dispatch claims keyed by `strategy_id:strategy_position_id`.
    /// Claimed atomically at dispatch; released on rejection or full close.
    entry_claims: DashSet<String>,
    /// Positions with an exit order in flight. A concurrent tick that
    /// observes the flag becomes a no-op.
    closing: DashSet<Uuid>,
}

#[derive(Default)]
struct Ledger {
    positions: HashMap<String, OpenPosition>,
    trades: Vec<Trade>,
}

fn position_key(strategy_id: &str, strategy_position_id: &str) -> String {
    format!("{}:{}", strategy_id, strategy_position_id)
}

impl PositionRegistry {
    /// Open the registry, reloading any persisted state.
    pub fn open(state_dir: impl Into<PathBuf>) -> TradingResult<Self> {
        let state_dir = state_dir.into();
        let positions_path = state_dir.join("positions.json");
        let trades_path = state_dir.join("trades.json");

        let positions: Vec<OpenPosition> = load_json(&positions_path)?.unwrap_or_default();
        let trades: Vec<Trade> = load_json(&trades_path)?.unwrap_or_default();
        if !positions.is_empty() || !trades.is_empty() {
            info!(
                "💾 Recovered {} open positions, {} trades from {}",
                positions.len(),
                trades.len(),
                state_dir.display()
            );
        }

        let mut map = HashMap::new();
        for position in positions {
            let key = position_key(&position.strategy_id, &position.strategy_position_id);
            if map.insert(key.clone(), position).is_some() {
                return Err(TradingError::InvariantViolation(format!(
                    "duplicate persisted position for {}",
                    key
                )));
            }
        }

        Ok(Self {
            positions_path,
            trades_path,
            inner: Mutex::new(Ledger {
                positions: map,
                trades,
            }),
            entry_claims: DashSet::new(),
            closing: DashSet::new(),
        })
    }

    fn persist(&self, ledger: &Ledger) -> TradingResult<()> {
        let positions: Vec<&OpenPosition> = ledger.positions.values().collect();
        atomic_write_json(&self.positions_path, &positions)?;
        atomic_write_json(&self.trades_path, &ledger.trades)?;
        Ok(())
    }

    // ---- entry dispatch dedup -------------------------------------------

    /// Atomically claim the right to dispatch an entry for a declared
    /// position. Returns false if another task already holds the claim or
    /// the position is already realised.
    pub async fn claim_entry(&self, strategy_id: &str, strategy_position_id: &str) -> bool {
        let key = position_key(strategy_id, strategy_position_id);
        if self.inner.lock().await.positions.contains_key(&key) {
            return false;
        }
        self.entry_claims.insert(key)
    }

    /// Release a claim after a rejected entry so a later tick may retry.
    pub fn release_entry_claim(&self, strategy_id: &str, strategy_position_id: &str) {
        self.entry_claims
            .remove(&position_key(strategy_id, strategy_position_id));
    }

    // ---- in-flight close flag -------------------------------------------

    /// Set the in-flight close flag. Returns false if a close is already
    /// being dispatched for this position.
    pub fn begin_close(&self, position_id: Uuid) -> bool {
        self.closing.insert(position_id)
    }

    /// Clear the flag after the close filled or was rejected.
    pub fn end_close(&self, position_id: Uuid) {
        self.closing.remove(&position_id);
    }

    pub fn is_closing(&self, position_id: Uuid) -> bool {
        self.closing.contains(&position_id)
    }

    // ---- mutations (router only) ----------------------------------------

    /// Record an entry fill. Creates the position, or folds a partial fill
    /// into the weighted-average entry price.
    pub async fn record_entry_fill(
        &self,
        strategy_id: &str,
        strategy_position_id: &str,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        price: f64,
    ) -> TradingResult<OpenPosition> {
        if quantity <= 0.0 {
            return Err(TradingError::InvariantViolation(format!(
                "entry fill quantity {} must be positive",
                quantity
            )));
        }
        let key = position_key(strategy_id, strategy_position_id);
        let mut ledger = self.inner.lock().await;
        let position = match ledger.positions.get_mut(&key) {
            Some(existing) => {
                existing.apply_entry_fill(quantity, price);
                existing.clone()
            }
            None => {
                let position = OpenPosition::new(
                    strategy_id,
                    strategy_position_id,
                    symbol,
                    direction,
                    quantity,
                    price,
                );
                ledger.positions.insert(key, position.clone());
                position
            }
        };
        self.persist(&ledger)?;
        Ok(position)
    }

    /// Record an exit fill. A partial close reduces the quantity; closing
    /// the full remainder removes the position and appends a trade with its
    /// realised PnL.
    pub async fn record_exit_fill(
        &self,
        position_id: Uuid,
        quantity: f64,
        price: f64,
        fee: f64,
        exchange_trade_id: &str,
    ) -> TradingResult<Option<Trade>> {
        let mut ledger = self.inner.lock().await;
        let key = ledger
            .positions
            .iter()
            .find(|(_, p)| p.id == position_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| {
                TradingError::InvariantViolation(format!(
                    "exit fill for unknown position {}",
                    position_id
                ))
            })?;

        let position = ledger.positions.get_mut(&key).expect("key just found");
        if quantity <= 0.0 || quantity > position.quantity + 1e-12 {
            return Err(TradingError::InvariantViolation(format!(
                "exit fill quantity {} outside (0, {}]",
                quantity, position.quantity
            )));
        }

        let direction = position.direction;
        let entry_price = position.average_entry_price;
        let strategy_id = position.strategy_id.clone();
        let symbol = position.symbol.clone();
        let realized = match direction {
            Direction::Long => (price - entry_price) * quantity,
            Direction::Short => (entry_price - price) * quantity,
        } - fee;

        let trade = Trade {
            id: Uuid::new_v4(),
            exchange_trade_id: exchange_trade_id.to_string(),
            symbol,
            side: direction.exit_side(),
            quantity,
            price,
            fee,
            realized_pnl: realized,
            strategy_id,
            timestamp: Utc::now(),
        };

        let fully_closed = quantity >= position.quantity - 1e-12;
        if fully_closed {
            ledger.positions.remove(&key);
            self.entry_claims.remove(&key);
        } else {
            position.quantity -= quantity;
            position.updated_at = Utc::now();
        }
        ledger.trades.push(trade.clone());
        self.persist(&ledger)?;

        if fully_closed {
            info!(
                "📕 Position {} fully closed (pnl {:.2})",
                position_id, trade.realized_pnl
            );
        }
        Ok(Some(trade))
    }

    /// Record a take-profit level as hit.
    pub async fn mark_take_profit_hit(
        &self,
        position_id: Uuid,
        index: usize,
    ) -> TradingResult<()> {
        let mut ledger = self.inner.lock().await;
        if let Some(position) = ledger.positions.values_mut().find(|p| p.id == position_id) {
            position.take_profit_indices_hit.insert(index);
            position.updated_at = Utc::now();
        } else {
            // The fill may have fully closed the position in the same tick.
            warn!("take-profit mark for already-closed position {}", position_id);
            return Ok(());
        }
        self.persist(&ledger)?;
        Ok(())
    }

    /// Update the trailing stop. Only moves in the favourable direction:
    /// strictly up for longs, strictly down for shorts.
    pub async fn update_trailing_stop(
        &self,
        position_id: Uuid,
        candidate: f64,
    ) -> TradingResult<Option<f64>> {
        let mut ledger = self.inner.lock().await;
        let position = match ledger.positions.values_mut().find(|p| p.id == position_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        let updated = match (position.trailing_stop_price, position.direction) {
            (None, _) => Some(candidate),
            (Some(current), Direction::Long) if candidate > current => Some(candidate),
            (Some(current), Direction::Short) if candidate < current => Some(candidate),
            (Some(current), _) => {
                return Ok(Some(current));
            }
        };
        position.trailing_stop_price = updated;
        position.updated_at = Utc::now();
        let value = position.trailing_stop_price;
        self.persist(&ledger)?;
        Ok(value)
    }

    // ---- reads -----------------------------------------------------------

    pub async fn open_positions(&self) -> Vec<OpenPosition> {
        self.inner.lock().await.positions.values().cloned().collect()
    }

    pub async fn position_by_id(&self, position_id: Uuid) -> Option<OpenPosition> {
        self.inner
            .lock()
            .await
            .positions
            .values()
            .find(|p| p.id == position_id)
            .cloned()
    }

    pub async fn position_for(
        &self,
        strategy_id: &str,
        strategy_position_id: &str,
    ) -> Option<OpenPosition> {
        self.inner
            .lock()
            .await
            .positions
            .get(&position_key(strategy_id, strategy_position_id))
            .cloned()
    }

    pub async fn trades(&self) -> Vec<Trade> {
        self.inner.lock().await.trades.clone()
    }

    /// Sum of realised PnL for trades closed since the given UTC midnight
    /// boundary. The risk enforcer feeds this its day window.
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> f64 {
        self.inner
            .lock()
            .await
            .trades
            .iter()
            .filter(|t| t.timestamp >= since)
            .map(|t| t.realized_pnl)
            .sum()
    }

    /// Buy side order sizes currently committed, valued at the given marks.
    pub async fn total_exposure(&self, marks: &HashMap<String, f64>) -> f64 {
        self.inner
            .lock()
            .await
            .positions
            .values()
            .map(|p| {
                let mark = marks
                    .get(&p.symbol)
                    .copied()
                    .unwrap_or(p.average_entry_price);
                p.notional(mark)
            })
            .sum()
    }

    pub async fn unrealized_pnl(&self, marks: &HashMap<String, f64>) -> f64 {
        self.inner
            .lock()
            .await
            .positions
            .values()
            .map(|p| {
                let mark = marks
                    .get(&p.symbol)
                    .copied()
                    .unwrap_or(p.average_entry_price);
                p.unrealized_pnl(mark)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_long(registry: &PositionRegistry) -> OpenPosition {
        registry
            .record_entry_fill("s1", "p1", "BTC/USD", Direction::Long, 1.0, 50_000.0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_entry_claim_is_exclusive() {
        let dir = tempdir().unwrap();
        let registry = PositionRegistry::open(dir.path()).unwrap();

        assert!(registry.claim_entry("s1", "p1").await);
        assert!(!registry.claim_entry("s1", "p1").await);

        registry.release_entry_claim("s1", "p1");
        assert!(registry.claim_entry("s1", "p1").await);
    }

    #[tokio::test]
    async fn test_claim_blocked_by_existing_position_and_freed_on_close() {
        let dir = tempdir().unwrap();
        let registry = PositionRegistry::open(dir.path()).unwrap();
        let position = open_long(&registry).await;
        registry.release_entry_claim("s1", "p1");

        // Realised position blocks re-entry even without a claim.
        assert!(!registry.claim_entry("s1", "p1").await);

        registry
            .record_exit_fill(position.id, 1.0, 51_000.0, 0.0, "x1")
            .await
            .unwrap();
        // Full close frees the slot for a second dispatch.
        assert!(registry.claim_entry("s1", "p1").await);
    }

    #[tokio::test]
    async fn test_partial_close_then_full_close() {
        let dir = tempdir().unwrap();
        let registry = PositionRegistry::open(dir.path()).unwrap();
        let position = open_long(&registry).await;

        registry
            .record_exit_fill(position.id, 0.4, 55_000.0, 0.0, "x1")
            .await
            .unwrap();
        let remaining = registry.position_by_id(position.id).await.unwrap();
        assert!((remaining.quantity - 0.6).abs() < 1e-9);
        assert_eq!(remaining.original_quantity, 1.0);

        registry
            .record_exit_fill(position.id, 0.6, 60_000.0, 0.0, "x2")
            .await
            .unwrap();
        assert!(registry.position_by_id(position.id).await.is_none());

        let trades = registry.trades().await;
        assert_eq!(trades.len(), 2);
        assert!((trades[0].realized_pnl - 2_000.0).abs() < 1e-6);
        assert!((trades[1].realized_pnl - 6_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_trailing_stop_monotone() {
        let dir = tempdir().unwrap();
        let registry = PositionRegistry::open(dir.path()).unwrap();
        let position = open_long(&registry).await;

        assert_eq!(
            registry.update_trailing_stop(position.id, 47_500.0).await.unwrap(),
            Some(47_500.0)
        );
        // A lower candidate never moves a long's trailing stop down.
        assert_eq!(
            registry.update_trailing_stop(position.id, 46_550.0).await.unwrap(),
            Some(47_500.0)
        );
        assert_eq!(
            registry.update_trailing_stop(position.id, 48_000.0).await.unwrap(),
            Some(48_000.0)
        );
    }

    #[tokio::test]
    async fn test_recovery_from_disk() {
        let dir = tempdir().unwrap();
        {
            let registry = PositionRegistry::open(dir.path()).unwrap();
            open_long(&registry).await;
        }
        let registry = PositionRegistry::open(dir.path()).unwrap();
        let positions = registry.open_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC/USD");
    }

    #[tokio::test]
    async fn test_close_flag_is_exclusive() {
        let dir = tempdir().unwrap();
        let registry = PositionRegistry::open(dir.path()).unwrap();
        let position = open_long(&registry).await;

        assert!(registry.begin_close(position.id));
        assert!(!registry.begin_close(position.id));
        registry.end_close(position.id);
        assert!(registry.begin_close(position.id));
    }
}

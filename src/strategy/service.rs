use crate::events::{EventLog, EventType};
use crate::models::{TradingError, TradingResult};
use crate::strategy::StrategyDocument;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

/// Lifecycle of the strategy slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyState {
    None,
    Active,
    Expired,
    Invalid,
}

impl std::fmt::Display for StrategyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyState::None => "none",
            StrategyState::Active => "active",
            StrategyState::Expired => "expired",
            StrategyState::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

/// Read snapshot handed to evaluators and the operator API. Cheap to clone;
/// the document is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct StrategySnapshot {
    pub state: StrategyState,
    pub document: Option<Arc<StrategyDocument>>,
}

impl StrategySnapshot {
    /// Only an Active, unexpired document is eligible for new entries.
    pub fn eligible_for_entries(&self) -> Option<&Arc<StrategyDocument>> {
        if self.state == StrategyState::Active {
            self.document.as_ref()
        } else {
            None
        }
    }
}

struct Inner {
    state: StrategyState,
    document: Option<Arc<StrategyDocument>>,
    last_rejection: Option<String>,
}

/// Watches the configured strategy file, validates and hot-swaps documents,
/// and expires them when the validity window passes. The service is the
/// exclusive owner of the active document; everyone else sees snapshots.
pub struct StrategyService {
    watch_path: PathBuf,
    reload_latency: Duration,
    validity_check_interval: Duration,
    inner: RwLock<Inner>,
    swap_tx: broadcast::Sender<Arc<StrategyDocument>>,
    events: Arc<EventLog>,
}

impl StrategyService {
    pub fn new(
        watch_path: impl Into<PathBuf>,
        reload_latency_ms: u64,
        validity_check_interval_ms: u64,
        events: Arc<EventLog>,
    ) -> Self {
        let (swap_tx, _) = broadcast::channel(16);
        Self {
            watch_path: watch_path.into(),
            reload_latency: Duration::from_millis(reload_latency_ms.max(1)),
            validity_check_interval: Duration::from_millis(validity_check_interval_ms.max(10)),
            inner: RwLock::new(Inner {
                state: StrategyState::None,
                document: None,
                last_rejection: None,
            }),
            swap_tx,
            events,
        }
    }

    pub async fn snapshot(&self) -> StrategySnapshot {
        let inner = self.inner.read().await;
        StrategySnapshot {
            state: inner.state,
            document: inner.document.clone(),
        }
    }

    pub async fn last_rejection(&self) -> Option<String> {
        self.inner.read().await.last_rejection.clone()
    }

    /// New-document notifications, fired after each successful swap.
    pub fn subscribe_swaps(&self) -> broadcast::Receiver<Arc<StrategyDocument>> {
        self.swap_tx.subscribe()
    }

    /// Attempt a load of the watched file. Called once at startup (missing
    /// file is not an error; the state stays None) and on every change.
    pub async fn try_load(&self) -> TradingResult<bool> {
        if !self.watch_path.exists() {
            debug!("Strategy file {} not present yet", self.watch_path.display());
            return Ok(false);
        }
        match self.load_once().await {
            Ok(swapped) => Ok(swapped),
            Err(e) => {
                let reason = e.to_string();
                warn!("⚠️ Strategy rejected: {}", reason);
                {
                    let mut inner = self.inner.write().await;
                    inner.last_rejection = Some(reason.clone());
                    // A previous Active document stays in effect; only an
                    // empty slot becomes Invalid.
                    if inner.document.is_none() {
                        inner.state = StrategyState::Invalid;
                    }
                }
                self.events.emit(
                    EventType::StrategyRejected,
                    serde_json::json!({ "reason": reason }),
                );
                Err(e)
            }
        }
    }

    async fn load_once(&self) -> TradingResult<bool> {
        let bytes = self.read_with_retries().await?;
        let document = StrategyDocument::from_bytes(&bytes)?;
        document.validate(Utc::now())?;

        // Pre-compile every condition so parse failures reject the load
        // rather than surfacing on a tick.
        for position in &document.positions {
            for src in [&position.entry_condition, &position.invalidation_condition]
                .into_iter()
                .flatten()
            {
                crate::dsl::Condition::parse(src).map_err(|e| {
                    TradingError::ValidationError(format!("position '{}': {}", position.id, e))
                })?;
            }
        }

        let document = Arc::new(document);
        let previous_id = {
            let mut inner = self.inner.write().await;
            if inner
                .document
                .as_ref()
                .is_some_and(|d| d.id == document.id)
            {
                // Same content re-written; nothing to swap.
                return Ok(false);
            }
            let previous = inner.document.replace(document.clone());
            inner.state = StrategyState::Active;
            inner.last_rejection = None;
            previous.map(|d| d.id.clone())
        };

        match &previous_id {
            None => {
                info!("✅ Strategy loaded: {} (posture {})", document.id, document.posture);
                self.events.emit(
                    EventType::StrategyLoaded,
                    serde_json::json!({ "strategy_id": document.id }),
                );
            }
            Some(prev) => {
                info!("🔄 Strategy swapped: {} -> {}", prev, document.id);
                self.events.emit(
                    EventType::StrategySwapped,
                    serde_json::json!({ "strategy_id": document.id, "previous_id": prev }),
                );
            }
        }

        let _ = self.swap_tx.send(document);
        Ok(true)
    }

    /// Read the strategy file, tolerating up to three partial reads (the
    /// writer renames atomically, but foreign writers may not).
    async fn read_with_retries(&self) -> TradingResult<Vec<u8>> {
        let mut last_err: Option<String> = None;
        for attempt in 0..4 {
            if attempt > 0 {
                sleep(self.reload_latency).await;
            }
            match tokio::fs::read(&self.watch_path).await {
                Ok(bytes) if !bytes.is_empty() => {
                    // A partial write shows up as truncated JSON; let the
                    // next attempt see the finished file.
                    if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() {
                        return Ok(bytes);
                    }
                    last_err = Some("file is not complete JSON".to_string());
                }
                Ok(_) => last_err = Some("file is empty".to_string()),
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(TradingError::ValidationError(format!(
            "unreadable strategy file {}: {}",
            self.watch_path.display(),
            last_err.unwrap_or_else(|| "unknown".to_string())
        )))
    }

    /// Run the file watcher and the validity monitor until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(16);

        // notify delivers on its own thread; bridge into the async world.
        let watch_target = self
            .watch_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Err(e) = std::fs::create_dir_all(&watch_target) {
            warn!("Failed to create strategy dir {}: {}", watch_target.display(), e);
        }
        let mut watcher: Option<RecommendedWatcher> = match notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = fs_tx.blocking_send(());
                }
            },
        ) {
            Ok(w) => Some(w),
            Err(e) => {
                error!("Failed to create strategy file watcher: {}", e);
                None
            }
        };
        if let Some(w) = watcher.as_mut() {
            if let Err(e) = w.watch(&watch_target, RecursiveMode::NonRecursive) {
                error!(
                    "Failed to watch {}: {}; falling back to polling",
                    watch_target.display(),
                    e
                );
                watcher = None;
            }
        }

        info!(
            "👀 Strategy service watching {} (poll fallback {}ms)",
            self.watch_path.display(),
            self.reload_latency.as_millis()
        );

        let mut validity = interval(self.validity_check_interval);
        // Polling fallback also catches events the watcher missed.
        let mut poll = interval(Duration::from_millis(
            (self.reload_latency.as_millis() as u64 * 10).max(500),
        ));
        // Content hash of the last load attempt, successful or not, so a
        // rejected file is not re-attempted on every poll tick.
        let mut last_attempted: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Strategy service shutting down");
                        break;
                    }
                }
                Some(()) = fs_rx.recv() => {
                    // Debounce: editors and atomic renames produce bursts.
                    sleep(self.reload_latency).await;
                    while fs_rx.try_recv().is_ok() {}
                    last_attempted = self.attempt_if_changed(last_attempted).await;
                }
                _ = poll.tick() => {
                    last_attempted = self.attempt_if_changed(last_attempted).await;
                }
                _ = validity.tick() => {
                    self.check_validity().await;
                }
            }
        }
    }

    async fn attempt_if_changed(&self, last_attempted: Option<String>) -> Option<String> {
        let bytes = match tokio::fs::read(&self.watch_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => return last_attempted,
        };
        let id = StrategyDocument::content_id(&bytes);
        if last_attempted.as_deref() == Some(id.as_str()) {
            return last_attempted;
        }
        let _ = self.try_load().await;
        Some(id)
    }

    /// Active -> Expired once wall-clock passes the validity window. The
    /// last document stays in place but becomes ineligible for entries.
    /// Driven by the validity-monitor timer in `run`.
    pub async fn check_validity(&self) {
        let expired_id = {
            let mut inner = self.inner.write().await;
            let expired = match (&inner.state, &inner.document) {
                (StrategyState::Active, Some(doc)) if doc.validity_window <= Utc::now() => {
                    Some(doc.id.clone())
                }
                _ => None,
            };
            if expired.is_some() {
                inner.state = StrategyState::Expired;
            }
            expired
        };
        if let Some(id) = expired_id {
            warn!("⏰ Strategy {} expired", id);
            self.events.emit(
                EventType::StrategyExpired,
                serde_json::json!({ "strategy_id": id }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn strategy_json(posture: &str, validity_secs: i64) -> String {
        let window = Utc::now() + ChronoDuration::seconds(validity_secs);
        format!(
            r#"{{
  "mode": "paper",
  "posture": "{}",
  "validity_window": "{}",
  "portfolio_risk": {{
    "max_drawdown_pct": 0.15,
    "daily_loss_limit_usd": 500.0,
    "max_total_exposure_pct": 0.8,
    "max_per_position_pct": 0.25
  }},
  "positions": [
    {{
      "id": "btc-long-1",
      "asset": "BTC/USD",
      "direction": "long",
      "allocation_pct": 0.1,
      "entry_type": "market"
    }}
  ]
}}"#,
            posture,
            window.to_rfc3339()
        )
    }

    fn service(dir: &std::path::Path) -> (Arc<StrategyService>, Arc<EventLog>) {
        let events = Arc::new(EventLog::open(dir.join("events.log")).unwrap());
        let service = Arc::new(StrategyService::new(
            dir.join("strategy.json"),
            5,
            50,
            events.clone(),
        ));
        (service, events)
    }

    #[tokio::test]
    async fn test_first_load_emits_strategy_loaded() {
        let dir = tempdir().unwrap();
        let (service, events) = service(dir.path());
        let mut rx = events.subscribe();

        std::fs::write(dir.path().join("strategy.json"), strategy_json("moderate", 3600)).unwrap();
        assert!(service.try_load().await.unwrap());

        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.state, StrategyState::Active);
        assert!(snapshot.eligible_for_entries().is_some());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::StrategyLoaded);
    }

    #[tokio::test]
    async fn test_swap_carries_previous_id() {
        let dir = tempdir().unwrap();
        let (service, events) = service(dir.path());
        let path = dir.path().join("strategy.json");

        let json_a = strategy_json("moderate", 3600);
        std::fs::write(&path, &json_a).unwrap();
        service.try_load().await.unwrap();
        let id_a = service.snapshot().await.document.unwrap().id.clone();

        let mut rx = events.subscribe();
        let json_b = strategy_json("defensive", 3600);
        std::fs::write(&path, &json_b).unwrap();
        service.try_load().await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::StrategySwapped);
        assert_eq!(event.data["previous_id"], id_a.as_str());
        assert_eq!(
            event.data["strategy_id"],
            StrategyDocument::content_id(json_b.as_bytes()).as_str()
        );
    }

    #[tokio::test]
    async fn test_rejected_file_keeps_previous_active() {
        let dir = tempdir().unwrap();
        let (service, events) = service(dir.path());
        let path = dir.path().join("strategy.json");

        std::fs::write(&path, strategy_json("moderate", 3600)).unwrap();
        service.try_load().await.unwrap();
        let active_id = service.snapshot().await.document.unwrap().id.clone();

        let mut rx = events.subscribe();
        std::fs::write(&path, "{\"mode\": \"paper\"").unwrap();
        assert!(service.try_load().await.is_err());

        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.state, StrategyState::Active);
        assert_eq!(snapshot.document.unwrap().id, active_id);
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::StrategyRejected);
    }

    #[tokio::test]
    async fn test_expiry_marks_ineligible_but_keeps_document() {
        let dir = tempdir().unwrap();
        let (service, events) = service(dir.path());
        let path = dir.path().join("strategy.json");

        std::fs::write(&path, strategy_json("moderate", 1)).unwrap();
        service.try_load().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let mut rx = events.subscribe();
        service.check_validity().await;

        let snapshot = service.snapshot().await;
        assert_eq!(snapshot.state, StrategyState::Expired);
        assert!(snapshot.document.is_some());
        assert!(snapshot.eligible_for_entries().is_none());
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::StrategyExpired);
    }
}

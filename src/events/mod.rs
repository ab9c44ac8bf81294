use crate::models::{TradeMode, TradingError, TradingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Every significant state change in the platform emits exactly one event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StrategyLoaded,
    StrategyRejected,
    StrategySwapped,
    StrategyExpired,
    EntryTriggered,
    EntrySkipped,
    ExitTriggered,
    RiskSuspended,
    SafeModeActivated,
    OrderPlaced,
    OrderFilled,
    OrderRejected,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::StrategyLoaded => "strategy_loaded",
            EventType::StrategyRejected => "strategy_rejected",
            EventType::StrategySwapped => "strategy_swapped",
            EventType::StrategyExpired => "strategy_expired",
            EventType::EntryTriggered => "entry_triggered",
            EventType::EntrySkipped => "entry_skipped",
            EventType::ExitTriggered => "exit_triggered",
            EventType::RiskSuspended => "risk_suspended",
            EventType::SafeModeActivated => "safe_mode_activated",
            EventType::OrderPlaced => "order_placed",
            EventType::OrderFilled => "order_filled",
            EventType::OrderRejected => "order_rejected",
        };
        write!(f, "{}", s)
    }
}

/// One structured log record: `{ ts, event_type, mode, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub event_type: EventType,
    pub mode: TradeMode,
    pub data: serde_json::Value,
}

/// Append-only event sink: one JSON record per line, plus an in-process
/// broadcast so subscribers (dashboard feed, tests) can observe the stream.
pub struct EventLog {
    file: Mutex<File>,
    mode: RwLock<TradeMode>,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> TradingResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TradingError::DataError(format!("create event log dir: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| TradingError::DataError(format!("open event log: {}", e)))?;
        let (tx, _) = broadcast::channel(1024);
        Ok(Self {
            file: Mutex::new(file),
            mode: RwLock::new(TradeMode::Paper),
            tx,
        })
    }

    /// Current operation mode stamped onto every record. Updated by the
    /// mode controller on promotion/demotion.
    pub fn set_mode(&self, mode: TradeMode) {
        *self.mode.write().expect("event log mode lock poisoned") = mode;
    }

    pub fn emit(&self, event_type: EventType, data: serde_json::Value) {
        let event = Event {
            ts: Utc::now(),
            event_type,
            mode: *self.mode.read().expect("event log mode lock poisoned"),
            data,
        };
        debug!("📝 event: {} {}", event.event_type, event.data);

        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut file = self.file.lock().expect("event log file lock poisoned");
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!("Failed to append event {}: {}", event.event_type, e);
                }
            }
            Err(e) => warn!("Failed to serialize event {}: {}", event.event_type, e),
        }

        // No subscribers is fine; the file is the durable record.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

use crate::events::{EventLog, EventType};
use crate::models::TradeMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Single tripwire: while active, the entry evaluator submits nothing and
/// the exit evaluator is forced into exit_all behaviour regardless of the
/// strategy posture.
pub struct SafeModeController {
    active: AtomicBool,
    reason: RwLock<Option<String>>,
    events: Arc<EventLog>,
}

impl SafeModeController {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            active: AtomicBool::new(false),
            reason: RwLock::new(None),
            events,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().expect("safe-mode reason lock").clone()
    }

    pub fn activate(&self, reason: &str) {
        let was_active = self.active.swap(true, Ordering::SeqCst);
        *self.reason.write().expect("safe-mode reason lock") = Some(reason.to_string());
        if !was_active {
            warn!("🚨 SAFE MODE ACTIVATED: {}", reason);
            self.events.emit(
                EventType::SafeModeActivated,
                serde_json::json!({ "reason": reason }),
            );
        }
    }

    pub fn clear(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        *self.reason.write().expect("safe-mode reason lock") = None;
        if was_active {
            info!("✅ Safe mode cleared");
        }
    }
}

/// Paper/live switch. Promotion to live requires an explicit operator call
/// with a note; the router consults the current mode on every dispatch.
pub struct OperationModeController {
    mode: RwLock<TradeMode>,
    events: Arc<EventLog>,
}

impl OperationModeController {
    pub fn new(initial: TradeMode, events: Arc<EventLog>) -> Self {
        events.set_mode(initial);
        Self {
            mode: RwLock::new(initial),
            events,
        }
    }

    pub fn mode(&self) -> TradeMode {
        *self.mode.read().expect("mode lock")
    }

    pub fn set_live(&self, note: Option<&str>) {
        *self.mode.write().expect("mode lock") = TradeMode::Live;
        self.events.set_mode(TradeMode::Live);
        warn!(
            "🔴 Operation mode promoted to LIVE ({})",
            note.unwrap_or("no note")
        );
    }

    pub fn set_paper(&self, note: Option<&str>) {
        *self.mode.write().expect("mode lock") = TradeMode::Paper;
        self.events.set_mode(TradeMode::Paper);
        info!(
            "📄 Operation mode set to paper ({})",
            note.unwrap_or("no note")
        );
    }
}

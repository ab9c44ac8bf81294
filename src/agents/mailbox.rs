use crate::models::{TradingError, TradingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Forward,
    Feedback,
}

/// One inter-agent note. Forward notes travel down the pipeline, feedback
/// notes travel back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub id: Uuid,
    pub from_agent: String,
    pub to_agent: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

/// Bounded per-agent message log: one line-delimited JSON file per
/// addressee, pruned to the last K messages on every write.
pub struct MailboxStore {
    dir: PathBuf,
    bound: usize,
    write_lock: Mutex<()>,
}

impl MailboxStore {
    pub fn new(base_path: impl Into<PathBuf>, bound: usize) -> TradingResult<Self> {
        let dir = base_path.into().join("mailboxes");
        fs::create_dir_all(&dir)
            .map_err(|e| TradingError::DataError(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            bound: bound.max(1),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{}.log", agent))
    }

    pub async fn send(
        &self,
        from_agent: &str,
        to_agent: &str,
        kind: MessageKind,
        content: &str,
    ) -> TradingResult<MailboxMessage> {
        let message = MailboxMessage {
            id: Uuid::new_v4(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            content: content.to_string(),
            kind,
            timestamp: Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        let mut messages = self.read(to_agent);
        messages.push(message.clone());
        // Oldest pruned once the bound is exceeded.
        if messages.len() > self.bound {
            let excess = messages.len() - self.bound;
            messages.drain(0..excess);
        }

        let mut body = String::new();
        for m in &messages {
            body.push_str(&serde_json::to_string(m).map_err(|e| {
                TradingError::DataError(format!("serialize mailbox message: {}", e))
            })?);
            body.push('\n');
        }
        crate::utils::persistence::atomic_write(self.path_for(to_agent), body.as_bytes())?;
        Ok(message)
    }

    pub fn read(&self, agent: &str) -> Vec<MailboxMessage> {
        fs::read_to_string(self.path_for(agent))
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All mailboxes keyed by addressee.
    pub fn read_all(&self) -> std::collections::HashMap<String, Vec<MailboxMessage>> {
        let mut out = std::collections::HashMap::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(agent) = name.strip_suffix(".log") {
                    out.insert(agent.to_string(), self.read(agent));
                }
            }
        }
        out
    }
}

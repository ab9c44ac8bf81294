pub mod market_data;
pub mod portfolio;
pub mod strategy_file;

use crate::agents::llm::{ToolDefinition, ToolFunctionDefinition};
use crate::config::ToolsConfig;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use market_data::MarketDataTool;
pub use portfolio::PortfolioTool;
pub use strategy_file::{LatestStrategyTool, ReadArtifactTool};

/// Error-message substrings that mark a remote failure as transient and
/// therefore retryable. Matched case-insensitively.
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "toomanyrequests",
    "rate limit",
    "ratelimit",
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "502",
    "503",
];

pub fn is_transient_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Small capability interface every agent tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether successful results may be served from the TTL cache.
    fn cacheable(&self) -> bool {
        true
    }

    /// Per-tool timeout override; `None` uses the configured default.
    fn timeout_seconds(&self) -> Option<u64> {
        None
    }

    async fn execute(&self, args: &serde_json::Value) -> TradingResult<serde_json::Value>;
}

/// Result of one executor call, fed back to the model verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

struct CacheEntry {
    stored_at: Instant,
    value: serde_json::Value,
}

/// Registry of named tools with per-call timeout, TTL cache, and
/// retry-with-backoff on transient errors. The initial call plus
/// `max_retries` retries bounds every invocation at `max_retries + 1`
/// attempts.
pub struct ToolExecutor {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    config: ToolsConfig,
    cache: DashMap<String, CacheEntry>,
}

impl ToolExecutor {
    pub fn new(config: ToolsConfig) -> Self {
        Self {
            tools: BTreeMap::new(),
            config,
            cache: DashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                kind: "function".to_string(),
                function: ToolFunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Cache keys canonicalise the argument map: object keys sorted, then
    /// serialised, so `{a,b}` and `{b,a}` hit the same entry.
    fn cache_key(name: &str, args: &serde_json::Value) -> String {
        fn canonical(value: &serde_json::Value) -> serde_json::Value {
            match value {
                serde_json::Value::Object(map) => {
                    let sorted: BTreeMap<String, serde_json::Value> = map
                        .iter()
                        .map(|(k, v)| (k.clone(), canonical(v)))
                        .collect();
                    serde_json::to_value(sorted).unwrap_or_default()
                }
                serde_json::Value::Array(items) => {
                    serde_json::Value::Array(items.iter().map(canonical).collect())
                }
                other => other.clone(),
            }
        }
        format!("{}:{}", name, canonical(args))
    }

    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> ToolOutcome {
        let started = Instant::now();
        let tool = match self.tools.get(name) {
            Some(tool) => tool.clone(),
            None => {
                return ToolOutcome {
                    success: false,
                    data: None,
                    error: Some(format!("unknown tool '{}'", name)),
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        let cache_key = Self::cache_key(name, args);
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
        if tool.cacheable() && !ttl.is_zero() {
            if let Some(entry) = self.cache.get(&cache_key) {
                if entry.stored_at.elapsed() < ttl {
                    debug!("🗄️ Tool {} served from cache", name);
                    return ToolOutcome {
                        success: true,
                        data: Some(entry.value.clone()),
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                drop(entry);
                self.cache.remove(&cache_key);
            }
        }

        let timeout = Duration::from_secs(
            tool.timeout_seconds()
                .unwrap_or(self.config.default_timeout_seconds),
        );

        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // min(2^(attempt-1) seconds, max_retry_delay_seconds)
                let backoff = Duration::from_secs(
                    2u64.saturating_pow(attempt - 1)
                        .min(self.config.max_retry_delay_seconds),
                );
                debug!(
                    "Tool {} retry {}/{} after {:?}",
                    name, attempt, self.config.max_retries, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            let result = match tokio::time::timeout(timeout, tool.execute(args)).await {
                Ok(result) => result,
                Err(_) => Err(TradingError::ToolError(format!(
                    "tool '{}' timed out after {:?}",
                    name, timeout
                ))),
            };

            match result {
                Ok(value) => {
                    if tool.cacheable() && !ttl.is_zero() {
                        self.cache.insert(
                            cache_key,
                            CacheEntry {
                                stored_at: Instant::now(),
                                value: value.clone(),
                            },
                        );
                    }
                    return ToolOutcome {
                        success: true,
                        data: Some(value),
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !is_transient_error(&last_error) {
                        warn!("Tool {} failed permanently: {}", name, last_error);
                        break;
                    }
                    warn!(
                        "Tool {} transient failure (attempt {}): {}",
                        name,
                        attempt + 1,
                        last_error
                    );
                }
            }
        }

        ToolOutcome {
            success: false,
            data: None,
            error: Some(last_error),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

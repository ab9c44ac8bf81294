use crate::agents::tools::Tool;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fetches portfolio state (engine status plus open positions) from the
/// execution engine's operator API. Which deployment endpoint it points at
/// is a configuration decision (`tools.execution_api_url`).
pub struct PortfolioTool {
    http: reqwest::Client,
    base_url: String,
}

impl PortfolioTool {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> TradingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| TradingError::ConfigError(format!("build portfolio client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, path: &str) -> TradingResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("portfolio GET {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradingError::ToolError(format!("portfolio request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::ToolError(format!(
                "portfolio HTTP {}: {}",
                status, body
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TradingError::ToolError(format!("portfolio response: {}", e)))
    }
}

#[async_trait]
impl Tool for PortfolioTool {
    fn name(&self) -> &str {
        "portfolio"
    }

    fn description(&self) -> &str {
        "Fetch current portfolio state: engine status, safe-mode flag, and all open positions"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _args: &serde_json::Value) -> TradingResult<serde_json::Value> {
        let status = self.fetch("/status").await?;
        let positions = self.fetch("/positions").await?;
        Ok(serde_json::json!({
            "status": status,
            "positions": positions,
        }))
    }
}

use crate::agents::tools::Tool;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fetches the latest ticker and indicator scalars for one asset from the
/// market-data service.
pub struct MarketDataTool {
    http: reqwest::Client,
    base_url: String,
}

impl MarketDataTool {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> TradingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| TradingError::ConfigError(format!("build market-data client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Tool for MarketDataTool {
    fn name(&self) -> &str {
        "market_data"
    }

    fn description(&self) -> &str {
        "Fetch the current ticker (bid/ask/mid) and indicator values for an asset, e.g. BTC/USD"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "asset": {
                    "type": "string",
                    "description": "Asset symbol, e.g. BTC/USD"
                }
            },
            "required": ["asset"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> TradingResult<serde_json::Value> {
        let asset = args
            .get("asset")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TradingError::ToolError("market_data requires 'asset'".to_string()))?;

        let url = format!(
            "{}/api/ticker/{}",
            self.base_url,
            asset.replace('/', "-")
        );
        debug!("market_data GET {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradingError::ToolError(format!("market-data request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::ToolError(format!(
                "market-data HTTP {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TradingError::ToolError(format!("market-data response: {}", e)))
    }
}

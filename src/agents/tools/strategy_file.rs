use crate::agents::artifacts::ArtifactManager;
use crate::agents::tools::Tool;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Reads a named artifact from a prior cycle directory.
pub struct ReadArtifactTool {
    artifacts: Arc<ArtifactManager>,
}

impl ReadArtifactTool {
    pub fn new(artifacts: Arc<ArtifactManager>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Tool for ReadArtifactTool {
    fn name(&self) -> &str {
        "read_artifact"
    }

    fn description(&self) -> &str {
        "Read an artifact (plan.md, research.md, analysis.md, strategy.json, evaluation.md) from a cycle directory"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "cycle_id": {
                    "type": "string",
                    "description": "Cycle id, e.g. 20260801_143000"
                },
                "name": {
                    "type": "string",
                    "description": "Artifact file name, e.g. plan.md"
                }
            },
            "required": ["cycle_id", "name"]
        })
    }

    fn cacheable(&self) -> bool {
        // Artifacts are written once but the current cycle's set grows.
        false
    }

    async fn execute(&self, args: &serde_json::Value) -> TradingResult<serde_json::Value> {
        let cycle_id = args
            .get("cycle_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TradingError::ToolError("read_artifact requires 'cycle_id'".into()))?;
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TradingError::ToolError("read_artifact requires 'name'".into()))?;
        if name.contains('/') || name.contains("..") {
            return Err(TradingError::ToolError(format!(
                "invalid artifact name '{}'",
                name
            )));
        }

        match self.artifacts.read_artifact(cycle_id, name) {
            Some(content) => Ok(serde_json::json!({
                "cycle_id": cycle_id,
                "name": name,
                "content": content,
            })),
            None => Err(TradingError::ToolError(format!(
                "artifact {}/{} not found",
                cycle_id, name
            ))),
        }
    }
}

/// Returns the strategy document of the latest completed cycle.
pub struct LatestStrategyTool {
    artifacts: Arc<ArtifactManager>,
}

impl LatestStrategyTool {
    pub fn new(artifacts: Arc<ArtifactManager>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Tool for LatestStrategyTool {
    fn name(&self) -> &str {
        "latest_strategy"
    }

    fn description(&self) -> &str {
        "Fetch the strategy.json produced by the most recent completed cycle, if any"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn execute(&self, _args: &serde_json::Value) -> TradingResult<serde_json::Value> {
        let cycle_id = match self.artifacts.latest_completed_cycle() {
            Some(id) => id,
            None => {
                return Ok(serde_json::json!({
                    "cycle_id": null,
                    "strategy": null,
                    "note": "no completed cycle yet",
                }))
            }
        };
        let raw = self
            .artifacts
            .read_artifact(&cycle_id, "strategy.json")
            .ok_or_else(|| {
                TradingError::ToolError(format!("strategy.json missing in cycle {}", cycle_id))
            })?;
        let strategy: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| TradingError::ToolError(format!("invalid strategy.json: {}", e)))?;
        Ok(serde_json::json!({
            "cycle_id": cycle_id,
            "strategy": strategy,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    fn artifacts(dir: &std::path::Path) -> Arc<ArtifactManager> {
        Arc::new(
            ArtifactManager::new(&StorageConfig {
                base_path: dir.to_string_lossy().into_owned(),
                cycles_path: "cycles".to_string(),
                memory_path: "memory".to_string(),
                archive_retention_count: 5,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_read_artifact() {
        let dir = tempdir().unwrap();
        let artifacts = artifacts(dir.path());
        artifacts
            .write_artifact("20260801_100000", "plan.md", "# plan body")
            .unwrap();

        let tool = ReadArtifactTool::new(artifacts);
        let result = tool
            .execute(&serde_json::json!({"cycle_id": "20260801_100000", "name": "plan.md"}))
            .await
            .unwrap();
        assert_eq!(result["content"], "# plan body");

        assert!(tool
            .execute(&serde_json::json!({"cycle_id": "20260801_100000", "name": "../escape"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_latest_strategy_empty_then_present() {
        let dir = tempdir().unwrap();
        let artifacts = artifacts(dir.path());
        let tool = LatestStrategyTool::new(artifacts.clone());

        let result = tool.execute(&serde_json::json!({})).await.unwrap();
        assert!(result["cycle_id"].is_null());

        artifacts
            .write_artifact("20260801_100000", "strategy.json", r#"{"posture":"flat"}"#)
            .unwrap();
        let result = tool.execute(&serde_json::json!({})).await.unwrap();
        assert_eq!(result["cycle_id"], "20260801_100000");
        assert_eq!(result["strategy"]["posture"], "flat");
    }
}

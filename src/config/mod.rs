use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Hierarchical application configuration.
///
/// Precedence, highest to lowest: command-line overrides (applied by the
/// binaries) > environment variables (`HELMSMAN` prefix, `__` hierarchy
/// separator) > config file > built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cycle: CycleConfig,
    pub resilience: ResilienceConfig,
    pub tools: ToolsConfig,
    pub ollama: OllamaConfig,
    pub agents: HashMap<String, AgentConfig>,
    pub storage: StorageConfig,
    pub strategy: StrategyConfig,
    pub api: ApiConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub min_duration_minutes: u64,
    pub max_duration_minutes: u64,
    pub schedule_interval_minutes: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            min_duration_minutes: 5,
            max_duration_minutes: 120,
            schedule_interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_restart_attempts: u32,
    pub stall_warning_minutes: u64,
    pub stall_critical_minutes: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            stall_warning_minutes: 10,
            stall_critical_minutes: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub default_timeout_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub max_retries: u32,
    pub max_retry_delay_seconds: u64,
    /// Market-data service the market_data tool queries.
    pub market_data_url: String,
    /// Execution-engine operator API the portfolio tool queries.
    pub execution_api_url: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            cache_ttl_seconds: 60,
            max_retries: 3,
            max_retry_delay_seconds: 30,
            market_data_url: "http://localhost:8090".to_string(),
            execution_api_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_minutes: u64,
    pub max_retries: u32,
    pub max_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1".to_string(),
            temperature: 0.4,
            max_tokens: 4096,
            timeout_minutes: 10,
            max_retries: 2,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: String,
    pub cycles_path: String,
    pub memory_path: String,
    pub archive_retention_count: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "./data".to_string(),
            cycles_path: "cycles".to_string(),
            memory_path: "memory".to_string(),
            archive_retention_count: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub watch_path: String,
    pub reload_latency_ms: u64,
    pub validity_check_interval_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            watch_path: "./data/strategy.json".to_string(),
            reload_latency_ms: 250,
            validity_check_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub state_dir: String,
    pub initial_paper_balance_usd: f64,
    pub paper_fee_bps: f64,
    pub min_order_quantity: f64,
    pub risk_check_interval_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            state_dir: "./data/exec".to_string(),
            initial_paper_balance_usd: 10_000.0,
            paper_fee_bps: 10.0,
            min_order_quantity: 0.0001,
            risk_check_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "./logs".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut agents = HashMap::new();
        for name in ["planner", "researcher", "analyst", "synthesizer", "evaluator"] {
            agents.insert(name.to_string(), AgentConfig::default());
        }
        Self {
            cycle: CycleConfig::default(),
            resilience: ResilienceConfig::default(),
            tools: ToolsConfig::default(),
            ollama: OllamaConfig::default(),
            agents,
            storage: StorageConfig::default(),
            strategy: StrategyConfig::default(),
            api: ApiConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config.toml")
    }

    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = config_path.as_ref().to_str().unwrap_or("config.toml");
        let builder = ConfigBuilder::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("HELMSMAN")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.fill_agent_defaults();
        Ok(config)
    }

    /// Every known stage gets a config entry even if the file names none.
    fn fill_agent_defaults(&mut self) {
        for name in ["planner", "researcher", "analyst", "synthesizer", "evaluator"] {
            self.agents
                .entry(name.to_string())
                .or_insert_with(AgentConfig::default);
        }
    }

    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cycle.schedule_interval_minutes == 0 {
            return Err("cycle.schedule_interval_minutes must be positive".to_string());
        }
        if self.resilience.stall_critical_minutes <= self.resilience.stall_warning_minutes {
            return Err(
                "resilience.stall_critical_minutes must exceed stall_warning_minutes".to_string(),
            );
        }
        if self.storage.archive_retention_count == 0 {
            return Err("storage.archive_retention_count must be at least 1".to_string());
        }
        if self.execution.initial_paper_balance_usd < 0.0 {
            return Err("execution.initial_paper_balance_usd cannot be negative".to_string());
        }
        for (name, agent) in &self.agents {
            if agent.temperature < 0.0 || agent.temperature > 2.0 {
                return Err(format!(
                    "agents.{}.temperature {} outside [0.0, 2.0]",
                    name, agent.temperature
                ));
            }
            if agent.max_iterations == 0 {
                return Err(format!("agents.{}.max_iterations must be positive", name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.agent("planner").max_iterations, 50);
        assert_eq!(config.tools.max_retries, 3);
        assert_eq!(config.strategy.validity_check_interval_ms, 100);
    }

    #[test]
    fn test_unknown_agent_falls_back_to_default() {
        let config = AppConfig::default();
        let agent = config.agent("mystery");
        assert_eq!(agent.model, AgentConfig::default().model);
    }

    #[test]
    fn test_validation_catches_bad_stall_thresholds() {
        let mut config = AppConfig::default();
        config.resilience.stall_warning_minutes = 30;
        config.resilience.stall_critical_minutes = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_temperature() {
        let mut config = AppConfig::default();
        config.agents.get_mut("planner").unwrap().temperature = 5.0;
        assert!(config.validate().is_err());
    }
}

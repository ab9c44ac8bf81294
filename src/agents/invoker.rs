use crate::agents::llm::{ChatMessage, OllamaClient, ToolDefinition};
use crate::agents::tools::ToolExecutor;
use crate::config::AgentConfig;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The single capability the learning loop needs from an LLM provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        temperature: f64,
        max_tokens: u32,
    ) -> TradingResult<ChatMessage>;
}

#[async_trait]
impl ChatProvider for OllamaClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        temperature: f64,
        max_tokens: u32,
    ) -> TradingResult<ChatMessage> {
        OllamaClient::chat(self, model, messages, tools, temperature, max_tokens).await
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub final_text: String,
    pub iterations: u32,
    pub tool_calls: u32,
}

/// Runs one agent stage to completion: streams completions, dispatches the
/// model's tool calls through the executor, feeds results back, and stops
/// at the first terminal (tool-free) message. Bounded by MaxIterations and
/// the per-agent wall-clock timeout.
pub struct AgentInvoker {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolExecutor>,
}

impl AgentInvoker {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: Arc<ToolExecutor>) -> Self {
        Self { provider, tools }
    }

    pub async fn run_agent(
        &self,
        agent_name: &str,
        config: &AgentConfig,
        system_prompt: &str,
        user_prompt: &str,
    ) -> TradingResult<AgentOutcome> {
        let timeout = Duration::from_secs(config.timeout_minutes * 60);
        match tokio::time::timeout(
            timeout,
            self.run_inner(agent_name, config, system_prompt, user_prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TradingError::Cancelled(format!(
                "agent {} timed out after {} minutes",
                agent_name, config.timeout_minutes
            ))),
        }
    }

    async fn run_inner(
        &self,
        agent_name: &str,
        config: &AgentConfig,
        system_prompt: &str,
        user_prompt: &str,
    ) -> TradingResult<AgentOutcome> {
        let definitions = self.tools.definitions();
        let mut messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(user_prompt),
        ];
        let mut total_tool_calls = 0u32;

        info!(
            "🤖 Invoking agent {} (model {}, max {} iterations)",
            agent_name, config.model, config.max_iterations
        );

        for iteration in 1..=config.max_iterations {
            let reply = self
                .provider
                .chat(
                    &config.model,
                    &messages,
                    Some(&definitions),
                    config.temperature,
                    config.max_tokens,
                )
                .await?;

            let tool_calls = reply.tool_calls.clone().unwrap_or_default();
            messages.push(reply.clone());

            if tool_calls.is_empty() {
                debug!(
                    "Agent {} terminal after {} iterations ({} tool calls)",
                    agent_name, iteration, total_tool_calls
                );
                return Ok(AgentOutcome {
                    final_text: reply.content,
                    iterations: iteration,
                    tool_calls: total_tool_calls,
                });
            }

            for call in tool_calls {
                total_tool_calls += 1;
                let outcome = self
                    .tools
                    .execute(&call.function.name, &call.function.arguments)
                    .await;
                if !outcome.success {
                    warn!(
                        "Agent {} tool {} failed: {}",
                        agent_name,
                        call.function.name,
                        outcome.error.as_deref().unwrap_or("unknown")
                    );
                }
                let payload = serde_json::to_string(&outcome).unwrap_or_else(|_| {
                    r#"{"success":false,"error":"unserialisable tool outcome"}"#.to_string()
                });
                messages.push(ChatMessage::tool(payload));
            }
        }

        Err(TradingError::AgentError(format!(
            "agent {} exhausted {} iterations without a terminal message",
            agent_name, config.max_iterations
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::llm::{ToolCall, ToolCallFunction};
    use crate::agents::tools::Tool;
    use crate::config::ToolsConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<ChatMessage>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<ChatMessage>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _temperature: f64,
            _max_tokens: u32,
        ) -> TradingResult<ChatMessage> {
            self.replies
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| TradingError::AgentError("script exhausted".to_string()))
        }
    }

    struct EchoTool {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn cacheable(&self) -> bool {
            false
        }
        async fn execute(&self, args: &serde_json::Value) -> TradingResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(args.clone())
        }
    }

    fn tool_call_reply(name: &str, args: serde_json::Value) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: String::new(),
            tool_calls: Some(vec![ToolCall {
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: args,
                },
            }]),
        }
    }

    fn terminal_reply(content: &str) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.to_string(),
            tool_calls: None,
        }
    }

    fn executor_with_echo(calls: Arc<AtomicU32>) -> Arc<ToolExecutor> {
        let mut executor = ToolExecutor::new(ToolsConfig {
            cache_ttl_seconds: 0,
            ..ToolsConfig::default()
        });
        executor.register(Arc::new(EchoTool { calls }));
        Arc::new(executor)
    }

    fn agent_config(max_iterations: u32) -> AgentConfig {
        AgentConfig {
            max_iterations,
            timeout_minutes: 1,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tool_round_trip_then_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply("echo", serde_json::json!({"asset": "BTC/USD"})),
            terminal_reply("# Research\ndone"),
        ]));
        let invoker = AgentInvoker::new(provider, executor_with_echo(calls.clone()));

        let outcome = invoker
            .run_agent("researcher", &agent_config(10), "you are a researcher", "research BTC")
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "# Research\ndone");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_iterations_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        // The model never emits a terminal message.
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply("echo", serde_json::json!({})),
            tool_call_reply("echo", serde_json::json!({})),
            tool_call_reply("echo", serde_json::json!({})),
        ]));
        let invoker = AgentInvoker::new(provider, executor_with_echo(calls.clone()));

        let err = invoker
            .run_agent("planner", &agent_config(3), "sys", "user")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"), "{}", err);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_tool_outcome_is_fed_back_not_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply("missing_tool", serde_json::json!({})),
            terminal_reply("recovered"),
        ]));
        let invoker = AgentInvoker::new(provider, executor_with_echo(calls));

        let outcome = invoker
            .run_agent("analyst", &agent_config(5), "sys", "user")
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "recovered");
    }
}

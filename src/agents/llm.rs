use crate::config::OllamaConfig;
use crate::models::{TradingError, TradingResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One chat turn. Roles: system, user, assistant, tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// Thin Ollama chat client (`POST {base_url}/api/chat`). The provider is
/// reached through this single text-generation + tool-calling capability.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> TradingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(format!("helmsman-bot/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TradingError::ConfigError(format!("build LLM client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        temperature: f64,
        max_tokens: u32,
    ) -> TradingResult<ChatMessage> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            tools,
            stream: false,
            options: ChatOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        debug!("LLM chat -> {} ({} messages)", model, messages.len());
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TradingError::NetworkError(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("LLM HTTP {}: {}", status, body);
            return Err(TradingError::NetworkError(format!(
                "LLM HTTP {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TradingError::AgentError(format!("invalid LLM response: {}", e)))?;
        Ok(parsed.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> OllamaConfig {
        OllamaConfig {
            base_url: url.to_string(),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_chat_parses_content_and_tool_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                  "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [
                      {"function": {"name": "market_data", "arguments": {"asset": "BTC/USD"}}}
                    ]
                  },
                  "done": true
                }"#,
            )
            .create_async()
            .await;

        let client = OllamaClient::new(&config(&server.url())).unwrap();
        let message = client
            .chat(
                "llama3.1",
                &[ChatMessage::user("what is the BTC price?")],
                None,
                0.4,
                1024,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "market_data");
        assert_eq!(calls[0].function.arguments["asset"], "BTC/USD");
    }

    #[tokio::test]
    async fn test_http_error_surfaces_status_in_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let client = OllamaClient::new(&config(&server.url())).unwrap();
        let err = client
            .chat("llama3.1", &[ChatMessage::user("hi")], None, 0.4, 128)
            .await
            .unwrap_err();
        // The status code lands in the message so transient-error
        // classification can see it.
        assert!(err.to_string().contains("503"), "{}", err);
    }
}

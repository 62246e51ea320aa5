//! OpenAI-compatible inference client.
//!
//! Sends the conversation and tool catalog to a chat completions endpoint and
//! parses the assistant's reply. The engine depends on the [`LlmClient`] trait
//! only, so tests drive it with scripted replies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use uuid::Uuid;

use super::config::LlmConfig;
use super::errors::InferenceError;
use super::types::{AssistantReply, ChatCompletionRequest, ChatMessage, ToolCall, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── LlmClient ───────────────────────────────────────────────────────────────

/// Submit history plus tool catalog, receive the assistant's reply.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantReply, InferenceError>;
}

// ─── OpenAiClient ────────────────────────────────────────────────────────────

/// Non-streaming client for `POST {base_url}/chat/completions`.
pub struct OpenAiClient {
    http: HttpClient,
    config: LlmConfig,
}

impl OpenAiClient {
    /// Build the client. Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: LlmConfig) -> Result<Self, InferenceError> {
        if config.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "llm.base_url is empty".into(),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantReply, InferenceError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut request_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = self.config.system_prompt.as_deref() {
            request_messages.push(ChatMessage::system(prompt));
        }
        request_messages.extend_from_slice(messages);

        let has_tools = !tools.is_empty();
        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: request_messages,
            tools: has_tools.then(|| tools.to_vec()),
            tool_choice: has_tools.then(|| "auto".to_string()),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut request = self.http.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let start = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        let reply = parse_completion_response(&body_text)?;
        tracing::info!(
            model = %self.config.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            tool_calls = reply.tool_calls.len(),
            stop_reason = reply.stop_reason.as_deref().unwrap_or("none"),
            "LLM completion received"
        );
        Ok(reply)
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body into an [`AssistantReply`].
pub fn parse_completion_response(body: &str) -> Result<AssistantReply, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionResponse {
        choices: Vec<CompletionChoice>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        content: Option<String>,
        tool_calls: Option<Vec<CompletionToolCall>>,
    }

    #[derive(Deserialize)]
    struct CompletionToolCall {
        id: Option<String>,
        function: CompletionFunction,
    }

    #[derive(Deserialize)]
    struct CompletionFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseError {
            reason: "empty choices array".into(),
        })?;

    let text = choice.message.content.filter(|c| !c.is_empty());
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    Ok(AssistantReply {
        text,
        tool_calls,
        stop_reason: choice.finish_reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

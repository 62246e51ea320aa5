//! Shared types for the inference client.
//!
//! These mirror the OpenAI Chat Completions API types, used for both
//! request building and response parsing.

use serde::{Deserialize, Serialize};

// ─── Request Types ───────────────────────────────────────────────────────────

/// A single message in the conversation.
///
/// `content` is serialized as `""` rather than `null` for assistant messages
/// that only carry tool calls; several OpenAI-compatible servers reject `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    /// Tool call results are sent back as `tool` role messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant messages may contain tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl ChatMessage {
    pub fn system(text: &str) -> Self {
        Self {
            role: Role::System,
            content: Some(text.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: Some(text.to_string()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool(tool_call_id: &str, content: String) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content),
            tool_call_id: Some(tool_call_id.to_string()),
            tool_calls: None,
        }
    }
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Function definition within a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-issued id (generated if the model doesn't provide one).
    pub id: String,
    /// Qualified tool name as offered in the catalog.
    pub name: String,
    /// Raw JSON argument string, kept exactly as produced.
    pub arguments: String,
}

/// Tool call as carried in OpenAI-format messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

impl From<&ToolCall> for ToolCallResponse {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: FunctionCallResponse {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Function call details in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// The assistant's reply to one completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub text: Option<String>,
    /// Requested calls, in the order the model returned them.
    pub tool_calls: Vec<ToolCall>,
    /// `"stop"`, `"tool_calls"`, `"length"`, … as reported by the provider.
    pub stop_reason: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

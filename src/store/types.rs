//! Persisted record types.
//!
//! Chats, messages and their parts, tool server images and instances,
//! OAuth providers, and the auth requests that pause a conversation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Messages ───────────────────────────────────────────────────────────────

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Human => "human",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::System => "system",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(MessageRole::Human),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One content block of a message.
///
/// The set of variants is closed: the store refuses to load a part whose
/// kind it does not recognise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallRequest {
        /// Provider-issued tool call id.
        id: String,
        /// Qualified tool name (`{instance_id}___{tool}`).
        name: String,
        /// Raw JSON argument string exactly as the model produced it.
        arguments: String,
        /// Position of the call in the model's reply.
        index: u32,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        tool_call_id: String,
        /// JSON-encoded content array returned by the tool server.
        content: String,
        is_error: bool,
    },
}

impl Part {
    /// Value stored in the `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Part::Text { .. } => "text",
            Part::ToolCallRequest { .. } => "tool_call_request",
            Part::ToolCallResult { .. } => "tool_call_result",
        }
    }
}

/// A message as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub parts: Vec<Part>,
    /// Set on the system message that announces an auth interrupt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// RFC 3339 timestamp.
    pub created_at: String,
}

/// A message to be inserted; id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub parts: Vec<Part>,
    pub auth_request_id: Option<String>,
    pub stop_reason: Option<String>,
}

impl NewMessage {
    pub fn human(text: &str) -> Self {
        Self {
            role: MessageRole::Human,
            parts: vec![Part::Text {
                content: text.to_string(),
            }],
            auth_request_id: None,
            stop_reason: None,
        }
    }

    pub fn system(text: &str) -> Self {
        Self {
            role: MessageRole::System,
            parts: vec![Part::Text {
                content: text.to_string(),
            }],
            auth_request_id: None,
            stop_reason: None,
        }
    }

    /// A tool-role message carrying a single result.
    pub fn tool_result(tool_call_id: &str, content: String, is_error: bool) -> Self {
        Self {
            role: MessageRole::Tool,
            parts: vec![Part::ToolCallResult {
                tool_call_id: tool_call_id.to_string(),
                content,
                is_error,
            }],
            auth_request_id: None,
            stop_reason: None,
        }
    }
}

// ─── Tool Server Images ─────────────────────────────────────────────────────

/// How a tool server authenticates against its upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    Public,
    Authenticated,
    AuthenticatedOauth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Public => "PUBLIC",
            AuthMode::Authenticated => "AUTHENTICATED",
            AuthMode::AuthenticatedOauth => "AUTHENTICATED_OAUTH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC" => Some(AuthMode::Public),
            "AUTHENTICATED" => Some(AuthMode::Authenticated),
            "AUTHENTICATED_OAUTH" => Some(AuthMode::AuthenticatedOauth),
            _ => None,
        }
    }
}

/// Admin-registered template for a containerized tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// `{slug}-v{version}`.
    pub id: String,
    pub slug: String,
    pub version: u32,
    pub name: String,
    /// Container image reference passed to the runtime.
    pub container_ref: String,
    pub auth_mode: AuthMode,
    pub oauth_provider: Option<String>,
    /// Env key → literal placeholder or `$provider.*` / `$user.*` template.
    pub env_schema: BTreeMap<String, String>,
}

/// A tool advertised by an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

// ─── Tool Server Instances ──────────────────────────────────────────────────

/// Lifecycle state of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Ready,
    Dead,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(InstanceState::Starting),
            "ready" => Some(InstanceState::Ready),
            "dead" => Some(InstanceState::Dead),
            _ => None,
        }
    }
}

/// A launched (or launching) tool server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub image_id: String,
    /// Fully resolved container env.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Facade base URL; `None` until the handshake completes.
    pub address: Option<String>,
    pub state: InstanceState,
    pub created_at: String,
}

/// One row of the tool catalog join: a ready instance and one of its tools.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    pub instance_id: String,
    pub address: String,
    pub oauth_provider: Option<String>,
    pub tool: ImageTool,
}

// ─── OAuth ──────────────────────────────────────────────────────────────────

/// A registered OAuth provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthProvider {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub callback_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Whether an auth request still blocks tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequestStatus {
    Open,
    Resolved,
}

impl AuthRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRequestStatus::Open => "open",
            AuthRequestStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AuthRequestStatus::Open),
            "resolved" => Some(AuthRequestStatus::Resolved),
            _ => None,
        }
    }
}

/// In-conversation marker raised when a tool reports expired credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: String,
    pub chat_id: String,
    pub provider: String,
    pub instance_id: Option<String>,
    pub status: AuthRequestStatus,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

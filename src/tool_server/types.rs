//! Shared types for tool servers.
//!
//! JSON-RPC 2.0 message types, the MCP payloads used by the supervisor,
//! the facade's HTTP wire contract, and the three-way tool outcome.

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP protocol revision sent in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool as listed by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpTool>,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

/// Optional first content item a tool server uses to report its own status.
///
/// Carried as the JSON text of a `{"type": "text"}` item.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControlFrame {
    pub xtrn_message_type: ControlMessageType,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessageType {
    Error,
    Response,
    LlmErrorResponse,
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Classified result of a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The tool ran; content goes back to the model.
    Success { content: Vec<serde_json::Value> },
    /// The tool failed in a way the model may see.
    ToolError { content: Vec<serde_json::Value> },
    /// The tool's credentials are invalid or expired.
    AuthRequired { provider: Option<String> },
}

// ─── Facade Wire Types ───────────────────────────────────────────────────────

/// One entry of the facade's `listTools` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacadeTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<McpTool> for FacadeTool {
    fn from(tool: McpTool) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResponse {
    pub tools: Vec<FacadeTool>,
}

/// Body of `POST /callTool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub tool_use_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// 200 response of `POST /callTool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResponse {
    pub tool_use_id: String,
    pub content: Vec<serde_json::Value>,
    pub is_error: bool,
}

/// 401 response of `POST /callTool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnauthorizedResponse {
    pub error: String,
    #[serde(default)]
    pub provider: Option<String>,
}

/// Error body for every other non-200 facade response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacadeErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillResponse {
    pub killed: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

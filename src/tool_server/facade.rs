//! Instance facade: the private HTTP endpoint of one tool server instance.
//!
//! Served by the instance host on an ephemeral loopback port. Translates
//! `listTools`, `callTool` and `kill` into the MCP session and classifies
//! each tool result into a [`ToolOutcome`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::sync::Notify;

use super::control::classify;
use super::supervisor::ToolSession;
use super::types::{
    CallToolRequest, CallToolResponse, FacadeErrorBody, FacadeTool, KillResponse,
    ListToolsResponse, ToolOutcome, UnauthorizedResponse,
};
use crate::store::Store;

/// Ceiling for one `callTool`, enforced by the facade.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Shared state of the facade routes.
pub struct FacadeState {
    pub instance_id: String,
    /// OAuth provider of the instance's image, reported on auth failures.
    pub provider: Option<String>,
    pub session: Arc<dyn ToolSession>,
    pub store: Arc<Store>,
    /// Notified once `/kill` has been handled.
    pub shutdown: Arc<Notify>,
    pub call_timeout: Duration,
}

pub fn router(state: Arc<FacadeState>) -> Router {
    Router::new()
        .route("/listTools", post(list_tools_handler))
        .route("/callTool", post(call_tool_handler))
        .route("/kill", post(kill_handler))
        .with_state(state)
}

/// POST /listTools
async fn list_tools_handler(State(state): State<Arc<FacadeState>>) -> Response {
    match state.session.list_tools().await {
        Ok(tools) => Json(ListToolsResponse {
            tools: tools.into_iter().map(FacadeTool::from).collect(),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(instance_id = %state.instance_id, error = %e, "listTools failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// POST /callTool
async fn call_tool_handler(State(state): State<Arc<FacadeState>>, body: Bytes) -> Response {
    let request: CallToolRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid callTool body: {e}"))
        }
    };

    let arguments = match request.arguments {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };

    let start = std::time::Instant::now();
    let result = tokio::time::timeout(
        state.call_timeout,
        state.session.call_tool(&request.name, arguments),
    )
    .await;

    let raw = match result {
        Err(_) => {
            tracing::warn!(
                instance_id = %state.instance_id,
                tool = %request.name,
                tool_use_id = %request.tool_use_id,
                timeout_ms = state.call_timeout.as_millis() as u64,
                "tool call timed out"
            );
            return error_response(
                StatusCode::REQUEST_TIMEOUT,
                format!(
                    "tool call '{}' timed out after {}ms",
                    request.name,
                    state.call_timeout.as_millis()
                ),
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(
                instance_id = %state.instance_id,
                tool = %request.name,
                error = %e,
                "tool call failed"
            );
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
        Ok(Ok(raw)) => raw,
    };

    let outcome = classify(raw, state.provider.as_deref());
    tracing::info!(
        instance_id = %state.instance_id,
        tool = %request.name,
        tool_use_id = %request.tool_use_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        outcome = outcome_label(&outcome),
        "tool call completed"
    );

    match outcome {
        ToolOutcome::Success { content } => Json(CallToolResponse {
            tool_use_id: request.tool_use_id,
            content,
            is_error: false,
        })
        .into_response(),
        ToolOutcome::ToolError { content } => Json(CallToolResponse {
            tool_use_id: request.tool_use_id,
            content,
            is_error: true,
        })
        .into_response(),
        ToolOutcome::AuthRequired { provider } => (
            StatusCode::UNAUTHORIZED,
            Json(UnauthorizedResponse {
                error: "tool server credentials are invalid or expired".into(),
                provider,
            }),
        )
            .into_response(),
    }
}

/// POST /kill
async fn kill_handler(State(state): State<Arc<FacadeState>>) -> Json<KillResponse> {
    match state.store.delete_instance(&state.instance_id) {
        Ok(deleted) => {
            tracing::info!(instance_id = %state.instance_id, deleted, "kill requested");
        }
        Err(e) => {
            tracing::warn!(instance_id = %state.instance_id, error = %e, "failed to delete instance record");
        }
    }
    state.shutdown.notify_one();
    Json(KillResponse { killed: true })
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(FacadeErrorBody { error })).into_response()
}

fn outcome_label(outcome: &ToolOutcome) -> &'static str {
    match outcome {
        ToolOutcome::Success { .. } => "success",
        ToolOutcome::ToolError { .. } => "tool_error",
        ToolOutcome::AuthRequired { .. } => "auth_required",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthMode, ImageRecord, InstanceRecord, InstanceState};
    use crate::tool_server::errors::ToolServerError;
    use crate::tool_server::types::{CallToolResult, McpTool};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    struct FakeSession;

    #[async_trait]
    impl ToolSession for FakeSession {
        async fn list_tools(&self) -> Result<Vec<McpTool>, ToolServerError> {
            Ok(vec![McpTool {
                name: "list_emails".into(),
                description: "List emails".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<CallToolResult, ToolServerError> {
            match name {
                "echo" => Ok(CallToolResult {
                    content: vec![json!({"type": "text", "text": arguments.to_string()})],
                    is_error: false,
                }),
                "expired" => Ok(CallToolResult {
                    content: vec![json!({
                        "type": "text",
                        "text": json!({"xtrn_message_type": "ERROR", "error_type": "AUTH_INVALID_GRANT"}).to_string(),
                    })],
                    is_error: true,
                }),
                "failing" => Ok(CallToolResult {
                    content: vec![json!({"type": "text", "text": "no such mailbox"})],
                    is_error: true,
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(CallToolResult {
                        content: vec![],
                        is_error: false,
                    })
                }
                _ => Err(ToolServerError::Transport {
                    instance: "fake".into(),
                    reason: "stdout closed".into(),
                }),
            }
        }

        async fn shutdown(&self) {}
    }

    fn test_state() -> Arc<FacadeState> {
        let store = Arc::new(Store::open(":memory:").unwrap());
        store
            .insert_image(
                &ImageRecord {
                    id: "gmail-v1".into(),
                    slug: "gmail".into(),
                    version: 1,
                    name: "Gmail".into(),
                    container_ref: "toolchat/gmail:1".into(),
                    auth_mode: AuthMode::AuthenticatedOauth,
                    oauth_provider: Some("google".into()),
                    env_schema: BTreeMap::new(),
                },
                &[],
            )
            .unwrap();
        store
            .insert_instance(&InstanceRecord {
                id: "gmail-v1-inst-a".into(),
                image_id: "gmail-v1".into(),
                env: BTreeMap::new(),
                address: None,
                state: InstanceState::Ready,
                created_at: "2026-01-01T00:00:00Z".into(),
            })
            .unwrap();

        Arc::new(FacadeState {
            instance_id: "gmail-v1-inst-a".into(),
            provider: Some("google".into()),
            session: Arc::new(FakeSession),
            store,
            shutdown: Arc::new(Notify::new()),
            call_timeout: Duration::from_millis(50),
        })
    }

    async fn post(state: Arc<FacadeState>, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_list_tools() {
        let (status, body) = post(test_state(), "/listTools", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"][0]["name"], "list_emails");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_call_tool_success_echoes_tool_use_id() {
        let (status, body) = post(
            test_state(),
            "/callTool",
            r#"{"tool_use_id": "call_1", "name": "echo", "arguments": {"q": 1}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tool_use_id"], "call_1");
        assert_eq!(body["is_error"], false);
        assert_eq!(body["content"][0]["text"], r#"{"q":1}"#);
    }

    #[tokio::test]
    async fn test_call_tool_error_is_200_with_flag() {
        let (status, body) = post(
            test_state(),
            "/callTool",
            r#"{"tool_use_id": "call_1", "name": "failing", "arguments": {}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_error"], true);
    }

    #[tokio::test]
    async fn test_call_tool_auth_required_is_401() {
        let (status, body) = post(
            test_state(),
            "/callTool",
            r#"{"tool_use_id": "call_1", "name": "expired", "arguments": {}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["provider"], "google");
    }

    #[tokio::test]
    async fn test_call_tool_timeout_is_408() {
        let (status, _) = post(
            test_state(),
            "/callTool",
            r#"{"tool_use_id": "call_1", "name": "slow", "arguments": {}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_call_tool_transport_failure_is_502() {
        let (status, body) = post(
            test_state(),
            "/callTool",
            r#"{"tool_use_id": "call_1", "name": "gone", "arguments": {}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("stdout closed"));
    }

    #[tokio::test]
    async fn test_call_tool_malformed_body_is_400() {
        let (status, _) = post(test_state(), "/callTool", r#"{"name": 3}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_kill_deletes_record_and_signals_shutdown() {
        let state = test_state();
        let shutdown = state.shutdown.clone();

        let (status, body) = post(state.clone(), "/kill", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["killed"], true);
        assert!(state.store.get_instance("gmail-v1-inst-a").unwrap().is_none());

        // The permit is stored, so a later waiter still observes it.
        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();

        let (status, _) = post(state, "/kill", "").await;
        assert_eq!(status, StatusCode::OK);
    }
}

//! HTTP client for instance facades.
//!
//! The conversation engine dispatches tool calls through the
//! [`ToolDispatcher`] trait; [`FacadeClient`] is its production
//! implementation, speaking the facade's `callTool` / `kill` contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};

use super::errors::ToolServerError;
use super::facade::CALL_TIMEOUT;
use super::types::{
    CallToolRequest, CallToolResponse, FacadeErrorBody, ToolOutcome, UnauthorizedResponse,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side ceiling; longer than the facade's own so the facade answers 408 first.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

// ─── ToolDispatcher ──────────────────────────────────────────────────────────

/// Executes one tool call on the instance listening at `address`.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call_tool(
        &self,
        address: &str,
        name: &str,
        arguments: serde_json::Value,
        tool_use_id: &str,
    ) -> Result<ToolOutcome, ToolServerError>;
}

// ─── FacadeClient ────────────────────────────────────────────────────────────

pub struct FacadeClient {
    http: HttpClient,
}

impl FacadeClient {
    pub fn new() -> Result<Self, ToolServerError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ToolServerError::Facade {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// Ask the instance to tear itself down.
    pub async fn kill(&self, address: &str) -> Result<(), ToolServerError> {
        let response = self
            .http
            .post(format!("{}/kill", address.trim_end_matches('/')))
            .send()
            .await
            .map_err(|e| transport(address, format!("kill request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(transport(
                address,
                format!("kill returned HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolDispatcher for FacadeClient {
    async fn call_tool(
        &self,
        address: &str,
        name: &str,
        arguments: serde_json::Value,
        tool_use_id: &str,
    ) -> Result<ToolOutcome, ToolServerError> {
        let request = CallToolRequest {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
            arguments,
        };

        let response = self
            .http
            .post(format!("{}/callTool", address.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolServerError::Timeout {
                        tool: name.to_string(),
                        timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
                    }
                } else {
                    transport(address, format!("callTool request failed: {e}"))
                }
            })?;

        match response.status() {
            StatusCode::OK => {
                let body: CallToolResponse = response
                    .json()
                    .await
                    .map_err(|e| transport(address, format!("invalid callTool body: {e}")))?;
                Ok(if body.is_error {
                    ToolOutcome::ToolError {
                        content: body.content,
                    }
                } else {
                    ToolOutcome::Success {
                        content: body.content,
                    }
                })
            }
            StatusCode::UNAUTHORIZED => {
                let provider = response
                    .json::<UnauthorizedResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.provider);
                Ok(ToolOutcome::AuthRequired { provider })
            }
            StatusCode::REQUEST_TIMEOUT => Err(ToolServerError::Timeout {
                tool: name.to_string(),
                timeout_ms: CALL_TIMEOUT.as_millis() as u64,
            }),
            status => {
                let body = error_text(response).await;
                Err(transport(address, format!("callTool returned HTTP {status}: {body}")))
            }
        }
    }
}

fn transport(address: &str, reason: String) -> ToolServerError {
    ToolServerError::Transport {
        instance: address.to_string(),
        reason,
    }
}

async fn error_text(response: reqwest::Response) -> String {
    match response.json::<FacadeErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => String::from("<no error body>"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

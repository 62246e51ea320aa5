//! Conversation engine error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::store::StoreError;
use crate::tool_server::ToolServerError;

/// Errors that end a turn.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The inbound request is malformed; nothing was persisted.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// The addressed chat does not exist.
    #[error("chat not found: '{chat_id}'")]
    ChatNotFound { chat_id: String },

    /// LLM or tool transport failure, or a reply the engine cannot act on.
    #[error("upstream error: {reason}")]
    Upstream { reason: String },

    /// A tool call exceeded its ceiling.
    #[error("tool call '{tool}' timed out")]
    Timeout { tool: String },

    /// Persisting or reading the conversation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InferenceError> for ChatError {
    fn from(e: InferenceError) -> Self {
        ChatError::Upstream {
            reason: format!("LLM request failed: {e}"),
        }
    }
}

impl From<ToolServerError> for ChatError {
    fn from(e: ToolServerError) -> Self {
        match e {
            ToolServerError::Timeout { tool, .. } => ChatError::Timeout { tool },
            ToolServerError::Store(inner) => ChatError::Store(inner),
            other => ChatError::Upstream {
                reason: format!("tool call failed: {other}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_timeout_maps_to_timeout() {
        let err: ChatError = ToolServerError::Timeout {
            tool: "search".into(),
            timeout_ms: 20_000,
        }
        .into();
        assert!(matches!(err, ChatError::Timeout { ref tool } if tool == "search"));
    }

    #[test]
    fn test_transport_maps_to_upstream() {
        let err: ChatError = ToolServerError::Transport {
            instance: "i".into(),
            reason: "connection refused".into(),
        }
        .into();
        match err {
            ChatError::Upstream { reason } => assert!(reason.contains("connection refused")),
            other => panic!("expected Upstream, got {other:?}"),
        }
    }
}

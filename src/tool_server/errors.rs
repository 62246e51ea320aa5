//! Tool server error types.

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while launching, talking to, or tearing down a tool server.
#[derive(Debug, Error)]
pub enum ToolServerError {
    /// The container process could not be started.
    #[error("failed to spawn tool server '{instance}': {reason}")]
    SpawnFailed { instance: String, reason: String },

    /// The MCP `initialize` exchange failed or timed out.
    #[error("tool server '{instance}' handshake failed: {reason}")]
    HandshakeFailed { instance: String, reason: String },

    /// JSON-RPC communication error or an unusable facade response.
    #[error("transport error for '{instance}': {reason}")]
    Transport { instance: String, reason: String },

    /// The tool server answered with a JSON-RPC error object.
    #[error("tool server error [{code}]: {message}")]
    Rpc { code: i32, message: String },

    /// A tool call exceeded its ceiling.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The env supplied for an instance does not satisfy the image schema.
    #[error("invalid env for key '{key}': {reason}")]
    InvalidEnv { key: String, reason: String },

    /// An image definition was rejected at registration.
    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    /// The address handoff from the instance host failed.
    #[error("rendezvous failed for '{instance}': {reason}")]
    Rendezvous { instance: String, reason: String },

    /// The addressed image or instance does not exist.
    #[error("{entity} not found: '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// The instance facade could not be served.
    #[error("facade error: {reason}")]
    Facade { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

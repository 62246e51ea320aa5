//! Inference Client: OpenAI-compatible API client for the conversation LLM.
//!
//! This module handles:
//! - Non-streaming chat completions with a tool catalog
//! - Parsing text and tool calls out of the reply
//! - The `llm:` configuration section
//!
//! The client speaks the OpenAI Chat Completions API, so switching providers
//! is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{LlmClient, OpenAiClient};
pub use config::LlmConfig;
pub use errors::InferenceError;
pub use types::{AssistantReply, ChatMessage, Role, ToolCall, ToolCallResponse, ToolDefinition};

//! Conversation engine: LLM/tool rounds, persistence and streaming.
//!
//! This module handles:
//! - The per-turn state machine (LLM call, sequential tool dispatch, loop)
//! - The auth interrupt that pauses a turn when a tool's credentials expire
//! - Converting stored history into provider messages
//! - Encoding engine events as stream frames
//!
//! Each message is committed before its frames are sent. A turn runs in its
//! own task, and turns on the same chat are serialized.

pub mod engine;
pub mod errors;
pub mod history;
pub mod locks;
pub mod stream;

// Re-exports for convenience
pub use engine::{ChatEngine, EngineConfig, TurnOutcome};
pub use errors::ChatError;
pub use stream::{encode_frame, FrameSink, StreamFrame};

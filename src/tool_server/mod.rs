//! Tool servers: containerized MCP servers behind a private HTTP facade.
//!
//! This module handles:
//! - Spawning one container per instance and the MCP handshake over its stdio
//! - Draining container stderr into a per-instance log file
//! - The instance facade (`listTools` / `callTool` / `kill`) and its client
//! - The one-shot rendezvous that hands the facade address to the launcher
//! - Image registration, env templating and the per-turn tool catalog
//!
//! The chat server only ever talks to instances through [`ToolDispatcher`];
//! each instance lives in its own `toolchat-instance` host process.

pub mod client;
pub mod control;
pub mod env;
pub mod errors;
pub mod facade;
pub mod host;
pub mod image;
pub mod launcher;
pub mod registry;
pub mod rendezvous;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{FacadeClient, ToolDispatcher};
pub use errors::ToolServerError;
pub use image::NewImage;
pub use launcher::{Launcher, LauncherConfig};
pub use registry::{CatalogEntry, ToolCatalog};
pub use supervisor::{ToolServerProcess, ToolSession};
pub use types::ToolOutcome;

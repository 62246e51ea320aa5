//! Store: SQLite persistence shared by the chat server and instance hosts.
//!
//! This module handles:
//! - Chats and their messages, with each message's parts kept in order
//! - Tool server images, their advertised tools, and launched instances
//! - OAuth providers, stored refresh tokens, and open auth requests
//!
//! Message insertion, image registration and auth interrupts are each a
//! single transaction.

pub mod database;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use database::Store;
pub use errors::StoreError;
pub use types::{
    AuthMode, AuthRequest, AuthRequestStatus, CatalogRow, ImageRecord, ImageTool,
    InstanceRecord, InstanceState, MessageRole, NewMessage, OAuthProvider, Part, StoredMessage,
};

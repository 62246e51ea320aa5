//! Store error types.

use thiserror::Error;

/// Errors that can occur while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed (including commit and rollback).
    #[error("database error: {reason}")]
    Database { reason: String },

    /// A JSON column could not be written or read.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// A persisted row does not describe a known variant.
    #[error("decode error in {table}: {reason}")]
    Decode { table: &'static str, reason: String },

    /// The addressed row does not exist.
    #[error("{entity} not found: '{id}'")]
    NotFound { entity: &'static str, id: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: e.to_string(),
        }
    }
}

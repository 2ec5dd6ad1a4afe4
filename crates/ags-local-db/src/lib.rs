//! SQLite persistence for agent sandbox state.
//!
//! This crate stores session records, the per-session activity log and the
//! collected results using SQLite as the backing database. All access goes
//! through a single [`Database`] handle per physical store.

pub mod connection;
pub mod migrations;
pub mod models;
pub mod schema;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Invalid status transition for session {session}: {from} -> {to}")]
    InvalidTransition {
        session: String,
        from: String,
        to: String,
    },

    #[error("Generic database error: {0}")]
    Generic(String),
}

impl Error {
    /// Create a new migration error.
    pub fn migration<S: Into<String>>(message: S) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create a new generic database error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

/// Database connection and management.
pub use connection::Database;

/// Database models and operations.
pub use models::{
    now_timestamp, LogLevel, LogRecord, LogSource, LogStore, NewLogEntry, NewSession,
    ResultRecord, ResultStore, SessionFilter, SessionRecord, SessionStatus, SessionStore,
};

/// Schema definitions and constants.
pub use schema::*;

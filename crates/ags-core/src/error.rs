//! Core error types for the agent sandbox.

use crate::container::EngineError;

/// Core error type for all sandbox operations.
///
/// Variants follow the failure taxonomy callers branch on: provisioning
/// failures abort a session before the agent runs, runtime failures are
/// recorded on the session and absorbed, collection failures only affect
/// the final status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Provisioning error: {message}")]
    Provisioning { message: String },

    #[error("Container runtime error: {message}")]
    ContainerRuntime { message: String },

    #[error("Collection error: {message}")]
    Collection { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] ags_local_db::Error),

    #[error("Git error: {0}")]
    Vcs(#[from] ags_repo::VcsError),

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Generic error: {0}")]
    Generic(String),
}

impl Error {
    /// Create a new provisioning error.
    pub fn provisioning<S: Into<String>>(message: S) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Create a new container runtime error.
    pub fn container_runtime<S: Into<String>>(message: S) -> Self {
        Self::ContainerRuntime {
            message: message.into(),
        }
    }

    /// Create a new result collection error.
    pub fn collection<S: Into<String>>(message: S) -> Self {
        Self::Collection {
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new session-related error.
    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a new generic error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }

    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_container_runtime(&self) -> bool {
        matches!(self, Self::ContainerRuntime { .. } | Self::Engine(_))
    }

    /// Whether the error means the session name was already taken.
    pub fn is_duplicate_session(&self) -> bool {
        matches!(self, Self::Database(ags_local_db::Error::DuplicateSession(_)))
    }
}

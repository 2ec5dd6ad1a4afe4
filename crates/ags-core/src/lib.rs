//! Session orchestration and result lifecycle for the agent sandbox.
//!
//! A session clones a project checkout into a private workspace, runs the
//! coding agent in a container that reaches the network only through an
//! egress proxy, captures its activity into the session log and finally
//! stores a result (diff, document or quality score) for it.

pub mod collector;
pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod logs;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod workspace;

/// Core result type used throughout the sandbox.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type that encompasses all sandbox operations.
pub use error::Error;

/// Sandbox configuration.
pub use config::SandboxConfig;

/// Database integration for persistence.
pub use db::DatabaseManager;

/// Container engine boundary and its Docker implementation.
pub use container::{ContainerEngine, ContainerSpec, DockerEngine, EngineError, Mount};

/// Result collection strategies.
pub use collector::{
    CollectedResult, ResultCollector, ResultKind, DEFAULT_PHASE, QUALITY_CHECK_PHASE,
};

/// Session lifecycle management.
pub use session::{CleanupReport, SessionManager, SessionRequest};

pub use logs::LogSink;
pub use orchestrator::{ContainerOrchestrator, ContainerPhase, AUTH_COMMAND};
pub use registry::ProjectRegistry;
pub use workspace::WorkspaceManager;

pub use ags_local_db::{
    LogLevel, LogRecord, LogSource, ResultRecord, SessionFilter, SessionRecord, SessionStatus,
};

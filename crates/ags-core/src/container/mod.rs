//! Container engine boundary.
//!
//! The orchestrator only talks to containers through [`ContainerEngine`], so
//! the Docker backend can be swapped for an in-process fake in tests.

pub mod docker;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use docker::DockerEngine;

/// Errors reported by a container engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Failed to build image {image}: {message}")]
    Build { image: String, message: String },

    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Container engine request failed: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Lifecycle state reported by the engine for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// The container does not exist (never created or already auto-removed).
    NotFound,
}

impl ContainerStatus {
    /// Whether the container may still produce output.
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running)
    }
}

/// A filesystem mount of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Host directory bind mount.
    Bind {
        host: PathBuf,
        container: String,
        read_only: bool,
    },
    /// Named engine volume.
    Volume {
        name: String,
        container: String,
        read_only: bool,
    },
}

impl Mount {
    pub fn bind(host: impl AsRef<Path>, container: impl Into<String>) -> Self {
        Mount::Bind {
            host: host.as_ref().to_path_buf(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, container: impl Into<String>) -> Self {
        Mount::Volume {
            name: name.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// Path of the mount inside the container.
    pub fn container_path(&self) -> &str {
        match self {
            Mount::Bind { container, .. } | Mount::Volume { container, .. } => container,
        }
    }

    /// `source:target:mode` binding string.
    pub fn to_bind_string(&self) -> String {
        let (source, container, read_only) = match self {
            Mount::Bind {
                host,
                container,
                read_only,
            } => (host.to_string_lossy().to_string(), container, *read_only),
            Mount::Volume {
                name,
                container,
                read_only,
            } => (name.clone(), container, *read_only),
        };
        let mode = if read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", source, container, mode)
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Command overriding the image default; empty keeps the default.
    pub command: Vec<String>,
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Host path bound to `container_path`, if any.
    pub fn host_path_for(&self, container_path: &str) -> Option<&Path> {
        self.mounts.iter().find_map(|m| match m {
            Mount::Bind {
                host, container, ..
            } if container == container_path => Some(host.as_path()),
            _ => None,
        })
    }

    /// `KEY=value` strings in key order.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Combined stdout/stderr byte chunks of a container, until it exits.
pub type OutputStream = BoxStream<'static, Result<Vec<u8>, EngineError>>;

/// Operations the sandbox needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError>;

    /// Build `tag` from `dockerfile` using `context` as build context.
    async fn build_image(&self, dockerfile: &Path, context: &Path, tag: &str)
        -> Result<(), EngineError>;

    /// Create a bridge network unless it already exists.
    async fn ensure_network(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// Create a named volume unless it already exists.
    async fn ensure_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn container_status(&self, name: &str) -> Result<ContainerStatus, EngineError>;

    /// Follow the container's output from the beginning until it exits.
    fn output_stream(&self, name: &str) -> OutputStream;

    /// Output produced so far, without following.
    async fn container_output(&self, name: &str) -> Result<String, EngineError>;

    /// Wait for the container to exit and return its exit code.
    ///
    /// May be called before the container is started, and must still report
    /// an exit that happened before the call. A container that is already
    /// gone yields [`EngineError::NotFound`].
    async fn wait_container(&self, name: &str) -> Result<i64, EngineError>;

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), EngineError>;

    /// Run a container attached to the caller's terminal until it exits.
    ///
    /// Returns the exit code. Used for interactive tasks such as logging in
    /// to the agent's account.
    async fn run_interactive(&self, spec: &ContainerSpec) -> Result<i64, EngineError>;

    /// Force-remove a container.
    async fn remove_container(&self, name: &str) -> Result<(), EngineError>;

    /// Names of all containers, running or not, created from `image`.
    async fn list_containers_by_image(&self, image: &str) -> Result<Vec<String>, EngineError>;
}

//! Configuration, database and engine wiring shared by all commands.

use ags_core::{DatabaseManager, DockerEngine, ProjectRegistry, SandboxConfig, SessionManager};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resources resolved once per invocation.
pub struct CliContext {
    pub config: Arc<SandboxConfig>,
    pub db: DatabaseManager,
}

impl CliContext {
    /// Read the sandbox configuration from the environment and open the database.
    pub fn load(db_path: Option<PathBuf>) -> Result<Self> {
        let mut config = SandboxConfig::from_env().context("Failed to load sandbox configuration")?;
        if let Some(path) = db_path {
            config = config.with_database_path(path);
        }

        let db = DatabaseManager::with_path(&config.database_path).with_context(|| {
            format!(
                "Failed to open database at {}",
                config.database_path.display()
            )
        })?;
        tracing::debug!(database = %config.database_path.display(), "Opened session database");

        Ok(Self {
            config: Arc::new(config),
            db,
        })
    }

    /// Project registry backed by the local Docker daemon.
    pub fn registry(&self) -> Result<ProjectRegistry> {
        let engine = DockerEngine::connect().context("Failed to connect to Docker")?;
        Ok(ProjectRegistry::new(
            self.config.clone(),
            self.db.clone(),
            Arc::new(engine),
        ))
    }

    /// Session manager of the project checked out at `path`.
    pub async fn manager(&self, path: &Path) -> Result<Arc<SessionManager>> {
        let registry = self.registry()?;
        registry
            .manager(path)
            .await
            .with_context(|| format!("Failed to open project {}", path.display()))
    }

    /// Session manager of the project a stored session belongs to.
    pub async fn manager_for_session(&self, session: &str) -> Result<Arc<SessionManager>> {
        let record = self
            .db
            .get_session(session)?
            .with_context(|| format!("Session '{}' not found", session))?;
        self.manager(Path::new(&record.project)).await
    }
}

/// The current directory, for commands defaulting to it.
pub fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to determine current directory")
}

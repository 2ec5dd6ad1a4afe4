//! Per-project session managers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SandboxConfig;
use crate::container::ContainerEngine;
use crate::db::DatabaseManager;
use crate::orchestrator::ContainerOrchestrator;
use crate::session::{cleanup_resources, CleanupReport, SessionManager};

/// Lazily creates one [`SessionManager`] per project checkout.
///
/// Projects are identified by the canonical path of their checkout. All
/// managers share the registry's database, configuration and engine.
pub struct ProjectRegistry {
    config: Arc<SandboxConfig>,
    db: DatabaseManager,
    engine: Arc<dyn ContainerEngine>,
    managers: RwLock<HashMap<String, Arc<SessionManager>>>,
}

impl ProjectRegistry {
    pub fn new(
        config: Arc<SandboxConfig>,
        db: DatabaseManager,
        engine: Arc<dyn ContainerEngine>,
    ) -> Self {
        Self {
            config,
            db,
            engine,
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn config(&self) -> &Arc<SandboxConfig> {
        &self.config
    }

    /// Project identifier of a checkout path.
    pub fn project_id(path: &Path) -> crate::Result<String> {
        let canonical = path.canonicalize().map_err(|e| {
            crate::Error::configuration(format!(
                "Project path {} is not accessible: {}",
                path.display(),
                e
            ))
        })?;
        if !canonical.is_dir() {
            return Err(crate::Error::configuration(format!(
                "Project path {} is not a directory",
                canonical.display()
            )));
        }
        Ok(canonical.to_string_lossy().into_owned())
    }

    /// Manager for the checkout at `path`, created on first use.
    pub async fn manager(&self, path: &Path) -> crate::Result<Arc<SessionManager>> {
        let project = Self::project_id(path)?;
        if let Some(manager) = self.managers.read().await.get(&project) {
            return Ok(manager.clone());
        }

        let mut managers = self.managers.write().await;
        let manager = managers
            .entry(project.clone())
            .or_insert_with(|| {
                tracing::debug!(project = %project, "Creating session manager");
                Arc::new(SessionManager::new(
                    self.config.clone(),
                    self.db.clone(),
                    self.engine.clone(),
                    project.clone(),
                    project.clone(),
                ))
            })
            .clone();
        Ok(manager)
    }

    /// Projects with a manager, sorted.
    pub async fn projects(&self) -> Vec<String> {
        let mut projects: Vec<_> = self.managers.read().await.keys().cloned().collect();
        projects.sort();
        projects
    }

    /// Remove all sandbox containers, the shared network and every workspace,
    /// regardless of project.
    pub async fn cleanup_all(&self, purge_records: bool) -> crate::Result<CleanupReport> {
        let orchestrator =
            ContainerOrchestrator::new(self.engine.clone(), self.config.clone(), self.db.clone());
        let report =
            cleanup_resources(&orchestrator, &self.config, &self.db, purge_records).await?;
        for manager in self.managers.read().await.values() {
            manager.orchestrator().clear().await;
        }
        Ok(report)
    }

    /// Log the agent in interactively, filling the shared credentials volume.
    ///
    /// Returns the exit code of the login run.
    pub async fn authenticate(&self) -> crate::Result<i64> {
        ContainerOrchestrator::new(self.engine.clone(), self.config.clone(), self.db.clone())
            .authenticate()
            .await
    }

    /// Drop the manager of a project. Returns whether one existed.
    pub async fn remove(&self, path: &Path) -> crate::Result<bool> {
        let project = Self::project_id(path)?;
        Ok(self.managers.write().await.remove(&project).is_some())
    }
}

//! Workspace lifecycle: per-session git clones and the agent configuration inside them.

use ags_local_db::LogLevel;
use ags_repo::{GitRepo, VcsError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::container::ContainerEngine;
use crate::logs::LogSink;

/// Hook commands installed into every workspace, by hook event.
const HOOK_MATCHERS: &[(&str, &str, &str)] = &[
    ("PreToolUse", ".*", "/hooks/pre-any"),
    ("PreToolUse", "Bash", "/hooks/pre-bash"),
    ("PreToolUse", "Write|Edit|MultiEdit", "/hooks/pre-writes"),
    ("PostToolUse", "Write|Edit|MultiEdit", "/hooks/post-writes"),
    ("Stop", ".*", "/hooks/stop"),
];

/// Agent settings enabling the logging hooks.
pub fn agent_settings() -> serde_json::Value {
    let mut hooks = serde_json::Map::new();
    for (event, matcher, command) in HOOK_MATCHERS {
        let entry = serde_json::json!({
            "matcher": matcher,
            "hooks": [{ "type": "command", "command": command }]
        });
        let list = hooks
            .entry(event.to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(list) = list.as_array_mut() {
            list.push(entry);
        }
    }
    serde_json::json!({ "hooks": hooks })
}

/// Creates and removes session workspaces cloned from one project checkout.
pub struct WorkspaceManager {
    config: Arc<SandboxConfig>,
    engine: Arc<dyn ContainerEngine>,
    source_repo: PathBuf,
}

impl WorkspaceManager {
    pub fn new(
        config: Arc<SandboxConfig>,
        engine: Arc<dyn ContainerEngine>,
        source_repo: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            engine,
            source_repo: source_repo.into(),
        }
    }

    /// Checkout every workspace is cloned from.
    pub fn source_repo(&self) -> &Path {
        &self.source_repo
    }

    pub fn workspace_path(&self, session: &str) -> PathBuf {
        self.config.workspace_path(session)
    }

    /// Best-effort removal of leftovers from an earlier run with the same name.
    ///
    /// Never fails; problems are logged.
    pub async fn cleanup_existing(&self, session: &str, sink: &LogSink) {
        for name in [session.to_string(), self.config.proxy_container_name(session)] {
            let stopped = self
                .engine
                .stop_container(&name, self.config.stop_timeout_secs)
                .await;
            if let Err(e) = stopped {
                if !e.is_not_found() {
                    tracing::debug!(container = %name, error = %e, "Stop of stale container failed");
                }
            }
            match self.engine.remove_container(&name).await {
                Ok(()) => {
                    sink.workspace(LogLevel::Info, format!("Removed stale container {}", name))
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => sink.workspace(
                    LogLevel::Warn,
                    format!("Failed to remove stale container {}: {}", name, e),
                ),
            }
        }

        let path = self.workspace_path(session);
        if path.exists() {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => sink.workspace(
                    LogLevel::Info,
                    format!("Removed stale workspace {}", path.display()),
                ),
                Err(e) => sink.workspace(
                    LogLevel::Warn,
                    format!("Failed to remove stale workspace {}: {}", path.display(), e),
                ),
            }
        }
    }

    /// Clone the project into the session's workspace directory.
    pub async fn create_workspace(&self, session: &str) -> crate::Result<PathBuf> {
        let source = self.source_repo.clone();
        let destination = self.workspace_path(session);

        let cloned = tokio::task::spawn_blocking({
            let destination = destination.clone();
            move || GitRepo::clone_from(&source, &destination)
        })
        .await
        .map_err(|e| crate::Error::generic(format!("Clone task failed: {}", e)))?;

        match cloned {
            Ok(repo) => Ok(repo.root().to_path_buf()),
            Err(VcsError::CommandFailed { stderr, .. }) => Err(crate::Error::provisioning(
                format!("Failed to clone repo: {}", stderr.trim()),
            )),
            Err(e) => Err(crate::Error::provisioning(format!("Failed to clone repo: {}", e))),
        }
    }

    /// Write the agent settings that route tool events to the logging hooks.
    pub async fn apply_agent_config(&self, workspace: &Path) -> crate::Result<PathBuf> {
        let dir = workspace.join(&self.config.agent_config_dir);
        let path = dir.join("settings.json");
        let settings = serde_json::to_string_pretty(&agent_settings())?;

        let exclude = workspace.join(".git").join("info").join("exclude");
        let write = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, settings).await?;
            // Keep the settings out of the collected diff
            if let Some(info) = exclude.parent() {
                tokio::fs::create_dir_all(info).await?;
            }
            let mut patterns = match tokio::fs::read_to_string(&exclude).await {
                Ok(existing) => existing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e),
            };
            if !patterns.is_empty() && !patterns.ends_with('\n') {
                patterns.push('\n');
            }
            patterns.push_str(&format!("/{}/\n", self.config.agent_config_dir));
            tokio::fs::write(&exclude, patterns).await
        };
        write.await.map_err(|e| {
            crate::Error::provisioning(format!(
                "Failed to write agent settings {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(path)
    }

    /// Delete the session's workspace. Succeeds when it is already gone.
    pub async fn remove_workspace(&self, session: &str) -> crate::Result<()> {
        let path = self.workspace_path(session);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wipe every workspace, leaving an empty workspaces directory.
    pub async fn remove_all(&self) -> crate::Result<()> {
        remove_all_workspaces(&self.config).await
    }
}

/// Delete and recreate the workspaces root of `config`.
pub async fn remove_all_workspaces(config: &SandboxConfig) -> crate::Result<()> {
    let root = &config.workspaces_dir;
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(root).await?;
    Ok(())
}

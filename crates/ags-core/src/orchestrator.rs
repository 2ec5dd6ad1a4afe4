//! Container orchestration for agent sessions.
//!
//! A session moves through
//! `PENDING -> IMAGES_READY -> NETWORK_READY -> PROXY_RUNNING -> AGENT_RUNNING`
//! and ends in `AGENT_EXITED` or `AGENT_ERROR`. The phase of every session
//! handled by this orchestrator is kept in memory for cleanup and status
//! queries, and mirrored into the session log.

use ags_local_db::LogLevel;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncSeekExt;
use tokio::sync::RwLock;

use crate::config::SandboxConfig;
use crate::container::{ContainerEngine, ContainerSpec, EngineError, Mount};
use crate::db::DatabaseManager;
use crate::logs::{self, LogSink};

/// Environment variable carrying the goal into the agent container.
pub const GOAL_ENV: &str = "CLAUDE_GOAL";

/// Command run in the agent image to log in.
pub const AUTH_COMMAND: &str = "claude";

const AUTH_CONTAINER: &str = "ags-auth";

/// Container lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerPhase {
    Pending,
    ImagesReady,
    NetworkReady,
    ProxyRunning,
    AgentRunning,
    AgentExited,
    AgentError,
}

impl ContainerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerPhase::Pending => "PENDING",
            ContainerPhase::ImagesReady => "IMAGES_READY",
            ContainerPhase::NetworkReady => "NETWORK_READY",
            ContainerPhase::ProxyRunning => "PROXY_RUNNING",
            ContainerPhase::AgentRunning => "AGENT_RUNNING",
            ContainerPhase::AgentExited => "AGENT_EXITED",
            ContainerPhase::AgentError => "AGENT_ERROR",
        }
    }
}

impl fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn runtime_error(context: &str, e: EngineError) -> crate::Error {
    crate::Error::container_runtime(format!("{}: {}", context, e))
}

/// Drives images, network, proxy and agent containers for sessions.
#[derive(Clone)]
pub struct ContainerOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxConfig>,
    db: DatabaseManager,
    phases: Arc<RwLock<HashMap<String, ContainerPhase>>>,
}

impl ContainerOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: Arc<SandboxConfig>,
        db: DatabaseManager,
    ) -> Self {
        Self {
            engine,
            config,
            db,
            phases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Current phase of a session, if it is tracked.
    pub async fn phase(&self, session: &str) -> Option<ContainerPhase> {
        self.phases.read().await.get(session).copied()
    }

    /// Sessions currently tracked, with their phase.
    pub async fn tracked_sessions(&self) -> Vec<(String, ContainerPhase)> {
        let phases = self.phases.read().await;
        let mut sessions: Vec<_> = phases.iter().map(|(k, v)| (k.clone(), *v)).collect();
        sessions.sort();
        sessions
    }

    async fn set_phase(&self, sink: &LogSink, phase: ContainerPhase) {
        self.phases.write().await.insert(sink.session().to_string(), phase);
        let level = if phase == ContainerPhase::AgentError {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        sink.system(level, format!("Container phase: {}", phase));
    }

    /// Register a session as pending.
    pub async fn track(&self, session: &str) {
        self.phases
            .write()
            .await
            .insert(session.to_string(), ContainerPhase::Pending);
    }

    /// Stop tracking a finished session.
    pub async fn forget(&self, session: &str) {
        self.phases.write().await.remove(session);
    }

    /// Stop tracking every session.
    pub async fn clear(&self) {
        self.phases.write().await.clear();
    }

    /// Make sure the agent and proxy images exist, building them when needed.
    pub async fn ensure_images(&self, session: &str) -> crate::Result<()> {
        let sink = LogSink::new(self.db.clone(), session);
        self.ensure_image(&self.config.agent_image, &self.config.agent_dockerfile, Some(&sink))
            .await?;
        self.ensure_image(&self.config.proxy_image, &self.config.proxy_dockerfile, Some(&sink))
            .await?;
        self.set_phase(&sink, ContainerPhase::ImagesReady).await;
        Ok(())
    }

    async fn ensure_image(
        &self,
        tag: &str,
        dockerfile: &Path,
        sink: Option<&LogSink>,
    ) -> crate::Result<()> {
        if !self.config.rebuild_images {
            let exists = self.engine.image_exists(tag).await.map_err(|e| {
                crate::Error::provisioning(format!("Failed to inspect image {}: {}", tag, e))
            })?;
            if exists {
                return Ok(());
            }
        }

        let note = |message: String| match sink {
            Some(sink) => sink.system(LogLevel::Info, message),
            None => tracing::info!("{}", message),
        };
        note(format!("Building image {}", tag));
        let dockerfile = self.config.dockerfile_path(dockerfile);
        self.engine
            .build_image(&dockerfile, &self.config.build_context, tag)
            .await
            .map_err(|e| crate::Error::provisioning(e.to_string()))?;
        note(format!("Built image {}", tag));
        Ok(())
    }

    /// Create the shared network unless it exists.
    pub async fn ensure_network(&self, session: &str) -> crate::Result<()> {
        let sink = LogSink::new(self.db.clone(), session);
        self.engine
            .ensure_network(&self.config.network)
            .await
            .map_err(|e| runtime_error("Failed to create network", e))?;
        self.set_phase(&sink, ContainerPhase::NetworkReady).await;
        Ok(())
    }

    /// Create the credentials volume unless it exists.
    pub async fn ensure_credentials_volume(&self) -> crate::Result<()> {
        self.engine
            .ensure_volume(&self.config.credentials_volume)
            .await
            .map_err(|e| runtime_error("Failed to create credentials volume", e))
    }

    /// Start the session's egress proxy and return its endpoint URL.
    pub async fn start_proxy(&self, session: &str) -> crate::Result<String> {
        let sink = LogSink::new(self.db.clone(), session);
        let spec = ContainerSpec {
            name: self.config.proxy_container_name(session),
            image: self.config.proxy_image.clone(),
            network: Some(self.config.network.clone()),
            auto_remove: true,
            ..Default::default()
        };

        self.engine
            .create_container(&spec)
            .await
            .map_err(|e| runtime_error("Failed to create proxy container", e))?;
        self.engine
            .start_container(&spec.name)
            .await
            .map_err(|e| runtime_error("Failed to start proxy container", e))?;

        self.set_phase(&sink, ContainerPhase::ProxyRunning).await;
        Ok(self.config.proxy_endpoint(session))
    }

    /// Container definition of a session's agent.
    pub fn agent_spec(
        &self,
        session: &str,
        goal: &str,
        workspace: &Path,
        log_dir: &Path,
    ) -> ContainerSpec {
        let proxy = self.config.proxy_endpoint(session);
        let mut env = BTreeMap::new();
        env.insert(GOAL_ENV.to_string(), goal.to_string());
        env.insert("HTTP_PROXY".to_string(), proxy.clone());
        env.insert("HTTPS_PROXY".to_string(), proxy);

        ContainerSpec {
            name: session.to_string(),
            image: self.config.agent_image.clone(),
            network: Some(self.config.network.clone()),
            env,
            mounts: vec![
                Mount::bind(workspace, self.config.container_workdir.clone()),
                Mount::volume(
                    self.config.credentials_volume.clone(),
                    self.config.credentials_mount.clone(),
                ),
                Mount::bind(log_dir, self.config.container_log_dir.clone()),
            ],
            working_dir: Some(self.config.container_workdir.clone()),
            user: Some(self.config.container_user.clone()),
            command: Vec::new(),
            auto_remove: true,
        }
    }

    /// Container definition of the interactive login run.
    ///
    /// Only the credentials volume is mounted; the login writes its tokens there
    /// for later agent runs.
    pub fn auth_spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: AUTH_CONTAINER.to_string(),
            image: self.config.agent_image.clone(),
            mounts: vec![Mount::volume(
                self.config.credentials_volume.clone(),
                self.config.credentials_mount.clone(),
            )],
            working_dir: Some(self.config.container_workdir.clone()),
            user: Some(self.config.container_user.clone()),
            command: vec![AUTH_COMMAND.to_string()],
            auto_remove: true,
            ..Default::default()
        }
    }

    /// Log the agent in interactively and store its credentials in the
    /// credentials volume. Returns the exit code of the login run.
    pub async fn authenticate(&self) -> crate::Result<i64> {
        self.ensure_credentials_volume().await?;
        self.ensure_image(&self.config.agent_image, &self.config.agent_dockerfile, None)
            .await?;

        let spec = self.auth_spec();
        tracing::info!(volume = %self.config.credentials_volume, "Starting interactive login");
        self.engine
            .run_interactive(&spec)
            .await
            .map_err(|e| runtime_error("Failed to run login container", e))
    }

    /// Run the agent container to completion and return its exit code.
    ///
    /// Hook log and container output are captured into the session log while
    /// the agent runs; both producers have finished when this returns.
    pub async fn run_agent(
        &self,
        session: &str,
        goal: &str,
        workspace: &Path,
    ) -> crate::Result<i64> {
        let sink = LogSink::new(self.db.clone(), session);

        let log_dir = tempfile::Builder::new()
            .prefix(&format!("ags-{}-logs-", session))
            .tempdir()
            .map_err(|e| {
                crate::Error::container_runtime(format!("Failed to create log directory: {}", e))
            })?;
        let log_file = log_dir.path().join(&self.config.log_file_name);
        tokio::fs::write(&log_file, b"").await?;

        let spec = self.agent_spec(session, goal, workspace, log_dir.path());
        let result = self.execute_agent(&sink, &spec, &log_file).await;

        if let Err(e) = log_dir.close() {
            tracing::warn!(session = %session, error = %e, "Failed to remove agent log directory");
        }

        match result {
            Ok(exit_code) => {
                self.set_phase(&sink, ContainerPhase::AgentExited).await;
                sink.system(
                    LogLevel::Info,
                    format!("Agent container exited with code {}", exit_code),
                );
                Ok(exit_code)
            }
            Err(e) => {
                self.set_phase(&sink, ContainerPhase::AgentError).await;
                sink.system(
                    LogLevel::Error,
                    format!("Agent container failed (exit code -1): {}", e),
                );
                self.log_container_output(&sink, session).await;
                Err(e)
            }
        }
    }

    async fn execute_agent(
        &self,
        sink: &LogSink,
        spec: &ContainerSpec,
        log_file: &Path,
    ) -> crate::Result<i64> {
        let name = spec.name.clone();

        self.engine
            .create_container(spec)
            .await
            .map_err(|e| runtime_error("Failed to create agent container", e))?;

        // Positioned before start so no hook line is missed
        let mut hook_log = tokio::fs::File::open(log_file).await?;
        hook_log.seek(std::io::SeekFrom::End(0)).await?;

        let wait = tokio::spawn({
            let engine = self.engine.clone();
            let name = name.clone();
            async move { engine.wait_container(&name).await }
        });

        if let Err(e) = self.engine.start_container(&name).await {
            wait.abort();
            return Err(runtime_error("Failed to start agent container", e));
        }
        if let Err(e) = self.db.mark_started(&name) {
            tracing::warn!(session = %name, error = %e, "Failed to record agent start time");
        }
        self.set_phase(sink, ContainerPhase::AgentRunning).await;

        let tail = tokio::spawn(logs::tail_log_file(
            self.engine.clone(),
            name.clone(),
            hook_log,
            sink.clone(),
            self.config.log_poll_interval,
        ));
        let pump = tokio::spawn(logs::pump_output(self.engine.output_stream(&name), sink.clone()));

        let exit = match wait.await {
            Ok(result) => {
                result.map_err(|e| runtime_error("Failed waiting for agent container", e))
            }
            Err(e) => Err(crate::Error::generic(format!("Agent wait task failed: {}", e))),
        };
        if exit.is_err() {
            tail.abort();
            pump.abort();
        }

        match tail.await {
            Ok(Ok(count)) => tracing::debug!(session = %name, entries = count, "Hook log captured"),
            Ok(Err(e)) => tracing::warn!(session = %name, error = %e, "Hook log capture failed"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(session = %name, error = %e, "Hook log task failed"),
        }
        match pump.await {
            Ok(count) => {
                tracing::debug!(session = %name, lines = count, "Container output captured")
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(session = %name, error = %e, "Container output task failed"),
        }

        exit
    }

    async fn log_container_output(&self, sink: &LogSink, container: &str) {
        match self.engine.container_output(container).await {
            Ok(output) if !output.trim().is_empty() => {
                sink.system(LogLevel::Error, format!("Container output:\n{}", output.trim_end()));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(container = %container, error = %e, "No container output available")
            }
        }
    }

    /// Stop the agent and proxy containers of a session. Missing containers are ignored.
    pub async fn stop_containers(&self, session: &str) {
        let sink = LogSink::new(self.db.clone(), session);
        for name in [session.to_string(), self.config.proxy_container_name(session)] {
            match self.engine.stop_container(&name, self.config.stop_timeout_secs).await {
                Ok(()) => tracing::debug!(container = %name, "Stopped container"),
                Err(e) if e.is_not_found() => {}
                Err(e) => sink.system(
                    LogLevel::Warn,
                    format!("Failed to stop container {}: {}", name, e),
                ),
            }
        }
    }

    /// Remove every container created from the sandbox images and the shared network.
    ///
    /// Returns the names of the removed containers.
    pub async fn cleanup_all(&self) -> crate::Result<Vec<String>> {
        let mut removed = Vec::new();
        for image in [&self.config.agent_image, &self.config.proxy_image] {
            let containers = self
                .engine
                .list_containers_by_image(image)
                .await
                .map_err(|e| runtime_error("Failed to list containers", e))?;
            for name in containers {
                match self.engine.remove_container(&name).await {
                    Ok(()) => removed.push(name),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(container = %name, error = %e, "Failed to remove container")
                    }
                }
            }
        }

        match self.engine.remove_network(&self.config.network).await {
            Ok(()) => tracing::info!(network = %self.config.network, "Removed network"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(
                network = %self.config.network,
                error = %e,
                "Failed to remove network"
            ),
        }

        self.clear().await;
        Ok(removed)
    }
}

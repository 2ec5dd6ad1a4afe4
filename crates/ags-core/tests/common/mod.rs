//! Shared fixtures for ags-core integration tests.
#![allow(dead_code)]

use ags_core::container::{
    ContainerEngine, ContainerSpec, ContainerStatus, EngineError, OutputStream,
};
use ags_core::{DatabaseManager, SandboxConfig, SessionManager};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// What the simulated agent does once its container starts.
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    /// Files written into the workspace, relative to it.
    pub files: Vec<(String, String)>,
    /// Files deleted from the workspace.
    pub deleted: Vec<String>,
    /// Lines appended to the hook log.
    pub hook_lines: Vec<String>,
    /// Lines printed to stdout.
    pub output: Vec<String>,
    pub exit_code: i64,
}

impl AgentScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, path: &str, content: &str) -> Self {
        self.files.push((path.to_string(), content.to_string()));
        self
    }

    pub fn delete(mut self, path: &str) -> Self {
        self.deleted.push(path.to_string());
        self
    }

    pub fn hook(mut self, line: &str) -> Self {
        self.hook_lines.push(line.to_string());
        self
    }

    pub fn print(mut self, line: &str) -> Self {
        self.output.push(line.to_string());
        self
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
    exit_code: Option<i64>,
    output: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    images: Vec<String>,
    builds: Vec<String>,
    networks: Vec<String>,
    volumes: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    started: Vec<String>,
    stopped: Vec<String>,
    /// Containers with a wait registered while they still existed.
    waiters: HashSet<String>,
    /// Exit codes delivered to registered waiters of removed containers.
    reaped: HashMap<String, i64>,
    interactive: Vec<ContainerSpec>,
}

/// In-process container engine that simulates the agent with an [`AgentScript`].
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    script: Arc<Mutex<AgentScript>>,
    agent_image: String,
    fail_builds: bool,
    fail_start: bool,
    remove_on_exit: bool,
    exit_before_wait: bool,
    keep_running: bool,
}

impl FakeEngine {
    pub fn new(config: &SandboxConfig, script: AgentScript) -> Self {
        Self {
            state: Arc::default(),
            script: Arc::new(Mutex::new(script)),
            agent_image: config.agent_image.clone(),
            fail_builds: false,
            fail_start: false,
            remove_on_exit: false,
            exit_before_wait: false,
            keep_running: false,
        }
    }

    /// Keep the agent running after its script until the container is stopped.
    pub fn keeping_agent_running(mut self) -> Self {
        self.keep_running = true;
        self
    }

    /// Remove the agent container as soon as it exits, like an auto-remove
    /// container on a real daemon.
    pub fn removing_on_exit(mut self) -> Self {
        self.remove_on_exit = true;
        self
    }

    /// Let the agent exit (and be removed) before any pending wait is registered.
    pub fn exiting_before_wait(mut self) -> Self {
        self.exit_before_wait = true;
        self
    }

    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_images(self, images: &[&str]) -> Self {
        self.state
            .lock()
            .unwrap()
            .images
            .extend(images.iter().map(|i| i.to_string()));
        self
    }

    pub fn set_script(&self, script: AgentScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn builds(&self) -> Vec<String> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.spec.clone())
    }

    /// Specs of the interactive runs, in order.
    pub fn interactive_runs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().interactive.clone()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().unwrap().containers.keys().cloned().collect();
        names.sort();
        names
    }

    fn run_script(&self, spec: &ContainerSpec) -> std::io::Result<AgentScript> {
        let script = self.script.lock().unwrap().clone();

        if let Some(workspace) = spec.host_path_for("/workspace") {
            for (relative, content) in &script.files {
                let path = workspace.join(relative);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, content)?;
            }
            for relative in &script.deleted {
                std::fs::remove_file(workspace.join(relative))?;
            }
        }

        if let Some(log_dir) = spec.host_path_for("/var/log") {
            let mut log = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_dir.join("ags.log"))?;
            for line in &script.hook_lines {
                writeln!(log, "{}", line)?;
            }
        }

        Ok(script)
    }
}

fn not_found(name: &str) -> EngineError {
    EngineError::NotFound(format!("No such container: {}", name))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().images.iter().any(|i| i == tag))
    }

    async fn build_image(
        &self,
        _dockerfile: &Path,
        _context: &Path,
        tag: &str,
    ) -> Result<(), EngineError> {
        if self.fail_builds {
            return Err(EngineError::Build {
                image: tag.to_string(),
                message: "failed to solve: Dockerfile not found".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.builds.push(tag.to_string());
        state.images.push(tag.to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.iter().any(|n| n == name) {
            state.networks.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let before = state.networks.len();
        state.networks.retain(|n| n != name);
        if state.networks.len() == before {
            return Err(EngineError::NotFound(format!("network {} not found", name)));
        }
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.iter().any(|v| v == name) {
            state.volumes.push(name.to_string());
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Conflict(format!("name {} is already in use", spec.name)));
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: ContainerStatus::Created,
                exit_code: None,
                output: Vec::new(),
            },
        );
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        let spec = {
            let state = self.state.lock().unwrap();
            let container = state.containers.get(name).ok_or_else(|| not_found(name))?;
            container.spec.clone()
        };

        if spec.image != self.agent_image {
            let mut state = self.state.lock().unwrap();
            state.started.push(name.to_string());
            if let Some(container) = state.containers.get_mut(name) {
                container.status = ContainerStatus::Running;
            }
            return Ok(());
        }

        if self.fail_start {
            return Err(EngineError::Api(format!("cannot start container {}", name)));
        }

        if !self.exit_before_wait {
            // Give a spawned wait the chance to register first
            tokio::task::yield_now().await;
        }

        let script = self
            .run_script(&spec)
            .map_err(|e| EngineError::Api(format!("agent script failed: {}", e)))?;

        let mut state = self.state.lock().unwrap();
        state.started.push(name.to_string());
        if self.keep_running {
            if let Some(container) = state.containers.get_mut(name) {
                container.status = ContainerStatus::Running;
                container.output = script.output;
            }
        } else if self.remove_on_exit {
            state.containers.remove(name);
            if state.waiters.contains(name) {
                state.reaped.insert(name.to_string(), script.exit_code);
            }
        } else if let Some(container) = state.containers.get_mut(name) {
            container.status = ContainerStatus::Exited;
            container.exit_code = Some(script.exit_code);
            container.output = script.output;
        }
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.status)
            .unwrap_or(ContainerStatus::NotFound))
    }

    fn output_stream(&self, name: &str) -> OutputStream {
        let chunks: Vec<Result<Vec<u8>, EngineError>> = self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| {
                c.output
                    .iter()
                    .map(|line| Ok(format!("{}\n", line).into_bytes()))
                    .collect()
            })
            .unwrap_or_default();
        futures::stream::iter(chunks).boxed()
    }

    async fn container_output(&self, name: &str) -> Result<String, EngineError> {
        let state = self.state.lock().unwrap();
        let container = state.containers.get(name).ok_or_else(|| not_found(name))?;
        Ok(container.output.join("\n"))
    }

    async fn wait_container(&self, name: &str) -> Result<i64, EngineError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(code) = state.reaped.get(name) {
                    return Ok(*code);
                }
                let container = state.containers.get(name).ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "container {} was removed before its exit code could be read",
                        name
                    ))
                })?;
                if let Some(code) = container.exit_code {
                    return Ok(code);
                }
                state.waiters.insert(name.to_string());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop_container(&self, name: &str, _timeout_secs: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let container = state.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        container.status = ContainerStatus::Exited;
        // 128 + SIGTERM
        container.exit_code.get_or_insert(143);
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn run_interactive(&self, spec: &ContainerSpec) -> Result<i64, EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.iter().any(|i| *i == spec.image) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }
        state.interactive.push(spec.clone());
        Ok(0)
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn list_containers_by_image(&self, image: &str) -> Result<Vec<String>, EngineError> {
        let mut names: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.spec.image == image)
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Sandbox home, source checkout and a session manager wired to a fake engine.
pub struct TestSandbox {
    pub home: TempDir,
    pub project: ags_repo::test_helpers::SimpleGitRepo,
    pub config: Arc<SandboxConfig>,
    pub db: DatabaseManager,
    pub engine: FakeEngine,
    pub manager: SessionManager,
}

impl TestSandbox {
    pub async fn new(script: AgentScript) -> Self {
        Self::with_engine(script, |engine| engine).await
    }

    pub async fn with_engine(
        script: AgentScript,
        customize: impl FnOnce(FakeEngine) -> FakeEngine,
    ) -> Self {
        let home = TempDir::new().unwrap();
        let project = ags_repo::test_helpers::create_git_repo(Some(
            ags_repo::test_helpers::GitRepoConfig::new().file("main.py", "print('main')\n"),
        ))
        .await
        .unwrap();

        let config = Arc::new(
            SandboxConfig::default()
                .with_home(home.path())
                .with_build_context(home.path())
                .with_log_poll_interval(Duration::from_millis(5))
                .with_stop_grace(Duration::from_millis(50)),
        );
        let db = DatabaseManager::in_memory().unwrap();
        let engine = customize(FakeEngine::new(&config, script));
        let manager = SessionManager::new(
            config.clone(),
            db.clone(),
            Arc::new(engine.clone()),
            project.path.to_string_lossy().into_owned(),
            project.path.clone(),
        );

        Self {
            home,
            project,
            config,
            db,
            engine,
            manager,
        }
    }

    pub fn workspace_path(&self, session: &str) -> PathBuf {
        self.config.workspace_path(session)
    }
}

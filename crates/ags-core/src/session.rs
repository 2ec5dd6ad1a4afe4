//! Session lifecycle: provisioning, agent execution, result collection and cleanup.

use ags_local_db::{
    LogLevel, LogRecord, NewSession, ResultRecord, SessionFilter, SessionRecord, SessionStatus,
};
use ags_repo::GitRepo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collector::{
    collector_for, default_targets_for_phase, CollectedResult, QualityScorer, ResultKind,
    DEFAULT_PHASE, QUALITY_CHECK_PHASE,
};
use crate::config::SandboxConfig;
use crate::container::ContainerEngine;
use crate::db::DatabaseManager;
use crate::logs::LogSink;
use crate::orchestrator::ContainerOrchestrator;
use crate::workspace::WorkspaceManager;

/// Interval between status checks while a stop waits for the session owner.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Label used when a request does not name one.
pub const DEFAULT_LABEL: &str = "agent";

/// What to run and what to collect afterwards.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub goal: String,
    pub label: Option<String>,
    pub phase: String,
    /// Result kind tag, parsed with [`ResultKind::from_str`](std::str::FromStr).
    pub result_kind: String,
    pub target_files: Option<Vec<String>>,
}

impl SessionRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            label: None,
            phase: DEFAULT_PHASE.to_string(),
            result_kind: ResultKind::Diff.as_str().to_string(),
            target_files: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn result_kind(mut self, kind: impl Into<String>) -> Self {
        self.result_kind = kind.into();
        self
    }

    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_files = Some(targets.into_iter().map(Into::into).collect());
        self
    }
}

/// A session whose workspace and images are ready.
struct ProvisionedSession {
    name: String,
    goal: String,
    kind: ResultKind,
    phase: String,
    targets: Option<Vec<String>>,
    workspace: PathBuf,
    sink: LogSink,
}

/// What a bulk cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub containers_removed: Vec<String>,
    pub sessions_purged: usize,
}

struct Inner {
    project: String,
    config: Arc<SandboxConfig>,
    db: DatabaseManager,
    workspaces: WorkspaceManager,
    orchestrator: ContainerOrchestrator,
}

/// Runs agent sessions for one project checkout.
///
/// Cheap to clone; clones share the same orchestrator state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: Arc<SandboxConfig>,
        db: DatabaseManager,
        engine: Arc<dyn ContainerEngine>,
        project: impl Into<String>,
        source_repo: impl Into<PathBuf>,
    ) -> Self {
        let workspaces = WorkspaceManager::new(config.clone(), engine.clone(), source_repo);
        let orchestrator = ContainerOrchestrator::new(engine, config.clone(), db.clone());
        Self {
            inner: Arc::new(Inner {
                project: project.into(),
                config,
                db,
                workspaces,
                orchestrator,
            }),
        }
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.inner.db
    }

    pub fn orchestrator(&self) -> &ContainerOrchestrator {
        &self.inner.orchestrator
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    /// Run a session to completion and return its name.
    ///
    /// Errors are returned only when the session could not be provisioned;
    /// the record is then left in `ERROR`. Later failures are recorded on
    /// the session.
    pub async fn start_session(&self, request: SessionRequest) -> crate::Result<String> {
        let session = self.provision(request).await?;
        let name = session.name.clone();
        self.execute(session).await;
        Ok(name)
    }

    /// Provision a session on the caller's task and run it on a new one.
    pub async fn spawn_session(
        &self,
        request: SessionRequest,
    ) -> crate::Result<(String, JoinHandle<SessionStatus>)> {
        let session = self.provision(request).await?;
        let name = session.name.clone();
        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.execute(session).await });
        Ok((name, handle))
    }

    async fn provision(&self, request: SessionRequest) -> crate::Result<ProvisionedSession> {
        let kind: ResultKind = request.result_kind.parse()?;
        if request.goal.trim().is_empty() {
            return Err(crate::Error::configuration("Goal must not be empty"));
        }
        let phase = if request.phase.trim().is_empty() {
            DEFAULT_PHASE.to_string()
        } else {
            request.phase.trim().to_string()
        };

        let targets = match request.target_files {
            Some(targets) if !targets.is_empty() => Some(targets),
            _ if kind == ResultKind::Document => default_targets_for_phase(&phase),
            _ => None,
        };
        let goal = document_goal(&request.goal, kind, targets.as_deref());
        let name = generate_session_name(request.label.as_deref());

        self.inner.db.create_session(&NewSession {
            name: name.clone(),
            project: self.inner.project.clone(),
            goal: goal.clone(),
            phase: phase.clone(),
            result_kind: kind.as_str().to_string(),
            target_files: targets.clone(),
        })?;

        let sink = LogSink::new(self.inner.db.clone(), &name);
        sink.system(LogLevel::Info, format!("Starting session {}", name));
        sink.system(LogLevel::Info, format!("Goal: {}", goal));
        self.inner.orchestrator.track(&name).await;

        self.inner.workspaces.cleanup_existing(&name, &sink).await;

        match self.provision_resources(&name, &sink).await {
            Ok(workspace) => Ok(ProvisionedSession {
                name,
                goal,
                kind,
                phase,
                targets,
                workspace,
                sink,
            }),
            Err(e) => {
                sink.system(LogLevel::Error, format!("Provisioning failed: {}", e));
                self.inner.orchestrator.stop_containers(&name).await;
                if let Err(cleanup) = self.inner.workspaces.remove_workspace(&name).await {
                    sink.workspace(
                        LogLevel::Warn,
                        format!("Failed to remove workspace: {}", cleanup),
                    );
                }
                self.set_status(&sink, SessionStatus::Error, None, Some(&e.to_string()));
                self.inner.orchestrator.forget(&name).await;
                Err(e)
            }
        }
    }

    async fn provision_resources(&self, name: &str, sink: &LogSink) -> crate::Result<PathBuf> {
        let workspace = self.inner.workspaces.create_workspace(name).await?;
        sink.workspace(
            LogLevel::Info,
            format!("Created workspace {}", workspace.display()),
        );
        self.inner.workspaces.apply_agent_config(&workspace).await?;
        self.inner.orchestrator.ensure_images(name).await?;
        Ok(workspace)
    }

    async fn execute(&self, session: ProvisionedSession) -> SessionStatus {
        let sink = &session.sink;
        match self.run_containers(&session).await {
            Ok(0) => {
                sink.system(LogLevel::Info, "Agent completed successfully");
                self.set_status(sink, SessionStatus::AgentComplete, Some(0), None);
            }
            Ok(code) => {
                let message = format!("Agent failed with exit code {}", code);
                sink.system(LogLevel::Error, message.clone());
                self.set_status(sink, SessionStatus::AgentComplete, Some(code), Some(&message));
            }
            Err(e) => {
                sink.system(LogLevel::Error, format!("Agent failed: {}", e));
                self.set_status(sink, SessionStatus::AgentComplete, Some(-1), Some(&e.to_string()));
            }
        }
        self.finalize(&session).await
    }

    async fn run_containers(&self, session: &ProvisionedSession) -> crate::Result<i64> {
        let orchestrator = &self.inner.orchestrator;
        orchestrator.ensure_network(&session.name).await?;
        orchestrator.ensure_credentials_volume().await?;
        orchestrator.start_proxy(&session.name).await?;
        session
            .sink
            .system(LogLevel::Info, "Starting agent container");
        orchestrator
            .run_agent(&session.name, &session.goal, &session.workspace)
            .await
    }

    async fn finalize(&self, session: &ProvisionedSession) -> SessionStatus {
        let sink = &session.sink;
        sink.system(LogLevel::Info, "Cleaning up and collecting results");
        self.inner.orchestrator.stop_containers(&session.name).await;

        let status = match self.collect(session).await {
            Ok(collected) => {
                let status = if collected.is_empty() {
                    SessionStatus::DoneAndNone
                } else {
                    SessionStatus::Done
                };
                let completed = self.inner.db.complete_session(
                    &session.name,
                    &session.phase,
                    session.kind.as_str(),
                    &collected.content,
                    session.targets.as_deref(),
                    collected.metadata.as_ref(),
                    status,
                );
                match completed {
                    Ok(()) if status == SessionStatus::DoneAndNone => {
                        sink.system(LogLevel::Info, "No result content was produced");
                        status
                    }
                    Ok(()) => {
                        sink.system(
                            LogLevel::Info,
                            format!("Saved {} result for phase {}", session.kind, session.phase),
                        );
                        status
                    }
                    Err(e) => {
                        let message = format!("Failed to save result: {}", e);
                        sink.system(LogLevel::Error, message.clone());
                        self.set_status(sink, SessionStatus::Error, None, Some(&message));
                        SessionStatus::Error
                    }
                }
            }
            Err(e) => {
                let message = format!("Result collection failed: {}", e);
                sink.system(LogLevel::Error, message.clone());
                self.set_status(sink, SessionStatus::Error, None, Some(&message));
                SessionStatus::Error
            }
        };

        if let Err(e) = self.inner.workspaces.remove_workspace(&session.name).await {
            sink.workspace(LogLevel::Warn, format!("Failed to remove workspace: {}", e));
        }
        self.inner.orchestrator.forget(&session.name).await;
        tracing::info!(session = %session.name, status = %status, "Session finished");
        status
    }

    async fn collect(&self, session: &ProvisionedSession) -> crate::Result<CollectedResult> {
        let kind = session.kind;
        let workspace = session.workspace.clone();
        let targets = session.targets.clone();
        tokio::task::spawn_blocking(move || {
            collector_for(kind).collect(&workspace, targets.as_deref())
        })
        .await
        .map_err(|e| crate::Error::collection(format!("Collector task failed: {}", e)))?
    }

    fn set_status(
        &self,
        sink: &LogSink,
        status: SessionStatus,
        exit_code: Option<i64>,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .inner
            .db
            .update_status(sink.session(), status, exit_code, error_message)
        {
            tracing::warn!(
                session = %sink.session(),
                status = %status,
                error = %e,
                "Failed to update session status"
            );
        }
    }

    /// Stop a session that has not finished yet.
    ///
    /// Its containers are stopped right away. A session run by this manager is
    /// then finalized by its own task. Otherwise the owning process gets
    /// `stop_grace` to finalize it; a session nobody finalizes in time is
    /// collected and cleaned up here. Returns the status after the stop.
    pub async fn stop_session(&self, name: &str) -> crate::Result<SessionStatus> {
        let record = self.get_session(name)?;
        if record.status.is_terminal() {
            return Err(crate::Error::session(format!(
                "Session {} has already finished (status {})",
                name, record.status
            )));
        }

        let sink = LogSink::new(self.inner.db.clone(), name);
        sink.system(LogLevel::Warn, "Stop requested");
        self.inner.orchestrator.stop_containers(name).await;

        if self.inner.orchestrator.phase(name).await.is_some() {
            return Ok(record.status);
        }

        let deadline = Instant::now() + self.inner.config.stop_grace;
        loop {
            let current = self.get_session(name)?;
            if current.status.is_terminal() {
                return Ok(current.status);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }

        tracing::info!(session = %name, "No process finalized the session, collecting it here");
        let record = self.get_session(name)?;
        if record.status == SessionStatus::AgentRunning {
            let message = "Session stopped before the agent finished";
            sink.system(LogLevel::Error, message);
            self.set_status(&sink, SessionStatus::AgentComplete, Some(-1), Some(message));
        }

        let session = ProvisionedSession {
            workspace: self.inner.workspaces.workspace_path(name),
            kind: record.result_kind.parse()?,
            name: record.name,
            goal: record.goal,
            phase: record.phase,
            targets: record.target_files,
            sink,
        };
        Ok(self.finalize(&session).await)
    }

    /// Score the implementation diff of a finished session and store it under
    /// the quality check phase.
    ///
    /// Returns `None` and stores nothing when the session has no
    /// implementation diff to score.
    pub async fn run_quality_check(&self, session: &str) -> crate::Result<Option<CollectedResult>> {
        let record = self.get_session(session)?;
        if !record.status.is_terminal() {
            return Err(crate::Error::session(format!(
                "Session {} has not finished (status {})",
                session, record.status
            )));
        }

        let sink = LogSink::new(self.inner.db.clone(), session);
        let Some(diff) = self.inner.db.get_result(session, DEFAULT_PHASE)? else {
            sink.system(LogLevel::Info, "No implementation to check");
            return Ok(None);
        };

        let scorer = QualityScorer;
        let result = scorer.to_result(scorer.score(None, Some(&diff.content)));
        self.inner.db.save_result(
            session,
            QUALITY_CHECK_PHASE,
            ResultKind::Quality.as_str(),
            &result.content,
            None,
            result.metadata.as_ref(),
        )?;
        sink.system(LogLevel::Info, format!("Quality check stored: {}", result.content));
        Ok(Some(result))
    }

    /// Apply the stored diff of `(session, phase)` to a checkout.
    pub async fn apply_result(
        &self,
        session: &str,
        phase: &str,
        target_repo: &Path,
    ) -> crate::Result<()> {
        let result = self.get_result(session, phase)?;
        if result.kind.parse::<ResultKind>()? != ResultKind::Diff {
            return Err(crate::Error::session(format!(
                "Result of session {} phase {} is a {} and cannot be applied",
                session, phase, result.kind
            )));
        }
        if result.content.trim().is_empty() {
            return Err(crate::Error::session(format!(
                "Session {} produced no changes to apply",
                session
            )));
        }

        let target = target_repo.to_path_buf();
        tokio::task::spawn_blocking(move || {
            GitRepo::open(&target)?.apply_patch(&result.content)
        })
        .await
        .map_err(|e| crate::Error::generic(format!("Apply task failed: {}", e)))??;

        tracing::info!(
            session = %session,
            phase = %phase,
            target = %target_repo.display(),
            "Applied diff"
        );
        Ok(())
    }

    /// Remove every sandbox container, the shared network and all workspaces.
    ///
    /// With `purge_records` the session, log and result tables are emptied too.
    pub async fn cleanup_all(&self, purge_records: bool) -> crate::Result<CleanupReport> {
        cleanup_resources(
            &self.inner.orchestrator,
            &self.inner.config,
            &self.inner.db,
            purge_records,
        )
        .await
    }

    pub fn get_session(&self, name: &str) -> crate::Result<SessionRecord> {
        self.inner
            .db
            .get_session(name)?
            .ok_or_else(|| ags_local_db::Error::SessionNotFound(name.to_string()).into())
    }

    /// Sessions of this project, newest first.
    pub fn list_sessions(&self, filter: &SessionFilter) -> crate::Result<Vec<SessionRecord>> {
        let mut filter = filter.clone();
        filter.project = Some(self.inner.project.clone());
        self.inner.db.list_sessions(&filter)
    }

    pub fn logs(&self, session: &str) -> crate::Result<Vec<LogRecord>> {
        self.get_session(session)?;
        self.inner.db.list_logs(session)
    }

    pub fn get_result(&self, session: &str, phase: &str) -> crate::Result<ResultRecord> {
        self.inner.db.get_result(session, phase)?.ok_or_else(|| {
            crate::Error::session(format!("No {} result for session {}", phase, session))
        })
    }
}

/// Bulk cleanup shared by [`SessionManager::cleanup_all`] and the project registry.
pub(crate) async fn cleanup_resources(
    orchestrator: &ContainerOrchestrator,
    config: &SandboxConfig,
    db: &DatabaseManager,
    purge_records: bool,
) -> crate::Result<CleanupReport> {
    let containers_removed = orchestrator.cleanup_all().await?;
    crate::workspace::remove_all_workspaces(config).await?;
    let sessions_purged = if purge_records { db.purge_all()? } else { 0 };
    tracing::info!(
        containers = containers_removed.len(),
        sessions = sessions_purged,
        "Cleanup finished"
    );
    Ok(CleanupReport {
        containers_removed,
        sessions_purged,
    })
}

/// Append the instruction to write the first target file to a document goal.
pub fn document_goal(goal: &str, kind: ResultKind, targets: Option<&[String]>) -> String {
    match (kind, targets.and_then(|t| t.first())) {
        (ResultKind::Document, Some(target)) => format!(
            "{}\n\nIMPORTANT: Please create your response as a markdown document and save it to a file named '{}' in the workspace.",
            goal, target
        ),
        _ => goal.to_string(),
    }
}

/// Reduce a label to characters safe in container and directory names.
pub fn sanitize_label(label: &str) -> String {
    let mut sanitized = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            sanitized.push(c);
        } else if !sanitized.ends_with('-') {
            sanitized.push('-');
        }
    }
    // Docker names must start with an alphanumeric character.
    let sanitized = sanitized
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .trim_end_matches(|c| c == '-' || c == '.');
    if sanitized.is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        sanitized.to_string()
    }
}

/// `<label>-<YYYYmmdd-HHMMSS>-<4 hex>`
pub fn generate_session_name(label: Option<&str>) -> String {
    let label = sanitize_label(label.unwrap_or(DEFAULT_LABEL));
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", label, timestamp, &suffix[..4])
}

//! Session commands: start, list, show, logs and cleanup.

use crate::context::{current_dir, CliContext};
use ags_core::{
    LogLevel, LogRecord, ProjectRegistry, SessionFilter, SessionRecord, SessionRequest,
    SessionStatus,
};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Arguments for starting a session
#[derive(Args)]
pub struct StartArgs {
    /// What the agent should do
    #[arg(value_name = "GOAL")]
    pub goal: String,

    /// Project checkout to clone the workspace from (default: current directory)
    #[arg(long = "project", value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Human readable prefix of the session name
    #[arg(long = "label", value_name = "LABEL")]
    pub label: Option<String>,

    /// Workflow phase the result is stored under
    #[arg(long = "phase", value_name = "PHASE", default_value = ags_core::DEFAULT_PHASE)]
    pub phase: String,

    /// Result to collect: diff, document or quality
    #[arg(long = "kind", value_name = "KIND", default_value = "diff")]
    pub kind: String,

    /// File the result is collected from (repeatable, globs allowed)
    #[arg(long = "target", value_name = "FILE")]
    pub targets: Vec<String>,

    /// Do not stream the session log while the agent runs
    #[arg(long = "detach")]
    pub detach: bool,
}

impl StartArgs {
    pub fn request(&self) -> SessionRequest {
        let mut request = SessionRequest::new(self.goal.clone())
            .phase(self.phase.clone())
            .result_kind(self.kind.clone());
        if let Some(label) = &self.label {
            request = request.label(label.clone());
        }
        if !self.targets.is_empty() {
            request = request.targets(self.targets.iter().cloned());
        }
        request
    }

    pub async fn run(self, context: &CliContext) -> Result<()> {
        let project = match &self.project {
            Some(path) => path.clone(),
            None => current_dir()?,
        };
        let manager = context.manager(&project).await?;

        let (name, handle) = manager
            .spawn_session(self.request())
            .await
            .context("Failed to start session")?;
        println!("Session {} started", name);

        let status = if self.detach {
            handle.await.context("Session task failed")?
        } else {
            follow_logs(context, &name, handle).await?
        };

        let record = manager.get_session(&name)?;
        println!("Session {} finished: {}", name, status);
        if let Some(message) = &record.error_message {
            println!("  {}", message);
        }
        if status == SessionStatus::Error {
            anyhow::bail!("Session {} ended in ERROR", name);
        }
        Ok(())
    }
}

/// Print new log entries until the session task ends.
async fn follow_logs(
    context: &CliContext,
    session: &str,
    mut handle: tokio::task::JoinHandle<SessionStatus>,
) -> Result<SessionStatus> {
    let mut last_seen = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            status = &mut handle => {
                print_new_logs(context, session, &mut last_seen)?;
                return status.context("Session task failed");
            }
            _ = interval.tick() => print_new_logs(context, session, &mut last_seen)?,
        }
    }
}

fn print_new_logs(context: &CliContext, session: &str, last_seen: &mut i64) -> Result<()> {
    for entry in context.db.list_logs_after(session, *last_seen)? {
        *last_seen = entry.id;
        println!("{}", format_log_line(&entry));
    }
    Ok(())
}

/// One display line of a log entry.
pub fn format_log_line(entry: &LogRecord) -> String {
    let time = entry
        .timestamp
        .get(11..19)
        .unwrap_or(entry.timestamp.as_str());
    let message = entry.message.as_deref().unwrap_or("");
    match (entry.level, entry.tool_name.as_deref()) {
        (LogLevel::Tool, Some(tool)) => format!("{} [{}] {}", time, tool, message),
        (level, _) => format!("{} {:<5} {}", time, level.as_str(), message),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() > max {
        let head: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        first_line.to_string()
    }
}

fn parse_status(value: &str) -> std::result::Result<SessionStatus, String> {
    value
        .trim()
        .to_ascii_uppercase()
        .replace('-', "_")
        .parse()
        .map_err(|e: ags_local_db::Error| e.to_string())
}

/// Arguments for listing sessions
#[derive(Args)]
pub struct ListArgs {
    /// Only sessions of the project checked out at PATH
    #[arg(long = "project", value_name = "PATH")]
    pub project: Option<PathBuf>,

    /// Only sessions in STATUS (e.g. done, error, agent_running)
    #[arg(long = "status", value_name = "STATUS", value_parser = parse_status)]
    pub status: Option<SessionStatus>,

    /// Maximum number of sessions to show
    #[arg(long = "limit", value_name = "N", default_value_t = 20)]
    pub limit: usize,
}

impl ListArgs {
    pub fn filter(&self) -> Result<SessionFilter> {
        let mut filter = SessionFilter::default().limit(self.limit);
        if let Some(path) = &self.project {
            filter = filter.project(ProjectRegistry::project_id(path)?);
        }
        if let Some(status) = self.status {
            filter = filter.status(status);
        }
        Ok(filter)
    }

    pub fn run(self, context: &CliContext) -> Result<()> {
        let sessions = context.db.list_sessions(&self.filter()?)?;
        if sessions.is_empty() {
            println!("No sessions found");
            return Ok(());
        }

        println!(
            "{:<40} {:<15} {:<16} {:<9} {:<20} GOAL",
            "NAME", "STATUS", "PHASE", "KIND", "CREATED"
        );
        for session in &sessions {
            println!(
                "{:<40} {:<15} {:<16} {:<9} {:<20} {}",
                session.name,
                session.status.as_str(),
                session.phase,
                session.result_kind,
                session.created_at.get(..19).unwrap_or(&session.created_at),
                truncate(&session.goal, 50)
            );
        }
        Ok(())
    }
}

/// Arguments for showing a session
#[derive(Args)]
pub struct ShowArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,

    /// Print the record as JSON
    #[arg(long = "json")]
    pub json: bool,
}

impl ShowArgs {
    pub fn run(self, context: &CliContext) -> Result<()> {
        let record = find_session(context, &self.session)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&record)?);
            return Ok(());
        }
        print!("{}", describe_session(&record));

        let results = context.db.list_results(&record.name)?;
        if !results.is_empty() {
            println!("Results:");
            for result in results {
                println!(
                    "  {:<16} {:<9} {} bytes",
                    result.phase,
                    result.kind,
                    result.content.len()
                );
            }
        }
        Ok(())
    }
}

fn find_session(context: &CliContext, name: &str) -> Result<SessionRecord> {
    context
        .db
        .get_session(name)?
        .with_context(|| format!("Session '{}' not found", name))
}

/// Multi-line summary of a session record.
pub fn describe_session(record: &SessionRecord) -> String {
    let mut lines = vec![
        format!("Session:  {}", record.name),
        format!("Status:   {}", record.status),
        format!("Project:  {}", record.project),
        format!("Phase:    {}", record.phase),
        format!("Kind:     {}", record.result_kind),
        format!("Created:  {}", record.created_at),
    ];
    if let Some(targets) = &record.target_files {
        lines.push(format!("Targets:  {}", targets.join(", ")));
    }
    if let Some(started) = &record.started_at {
        lines.push(format!("Started:  {}", started));
    }
    if let Some(ended) = &record.ended_at {
        lines.push(format!("Ended:    {}", ended));
    }
    if let Some(code) = record.exit_code {
        lines.push(format!("Exit:     {}", code));
    }
    if let Some(message) = &record.error_message {
        lines.push(format!("Error:    {}", message));
    }
    lines.push(format!("Goal:\n  {}", record.goal.replace('\n', "\n  ")));

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Arguments for printing a session log
#[derive(Args)]
pub struct LogsArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,

    /// Print the raw captured lines instead of summaries
    #[arg(long = "raw")]
    pub raw: bool,
}

impl LogsArgs {
    pub fn run(self, context: &CliContext) -> Result<()> {
        let record = find_session(context, &self.session)?;
        for entry in context.db.list_logs(&record.name)? {
            if self.raw {
                if let Some(raw) = entry.raw_log.as_deref().or(entry.message.as_deref()) {
                    println!("{}", raw);
                }
            } else {
                println!("{}", format_log_line(&entry));
            }
        }
        Ok(())
    }
}

/// Arguments for stopping a session
#[derive(Args)]
pub struct StopArgs {
    /// Session name
    #[arg(value_name = "SESSION")]
    pub session: String,
}

impl StopArgs {
    pub async fn run(self, context: &CliContext) -> Result<()> {
        let manager = context.manager_for_session(&self.session).await?;
        let status = manager
            .stop_session(&self.session)
            .await
            .with_context(|| format!("Failed to stop session '{}'", self.session))?;
        if status.is_terminal() {
            println!("Session {} stopped: {}", self.session, status);
        } else {
            println!("Stop requested for session {}", self.session);
        }
        Ok(())
    }
}

/// Arguments for logging the agent in
#[derive(Args)]
pub struct AuthArgs {}

impl AuthArgs {
    pub async fn run(self, context: &CliContext) -> Result<()> {
        println!("Starting agent login; follow the prompts to authenticate.");
        let exit_code = context
            .registry()?
            .authenticate()
            .await
            .context("Login failed")?;
        if exit_code != 0 {
            anyhow::bail!("Login container exited with code {}", exit_code);
        }
        println!(
            "Credentials stored in volume {}",
            context.config.credentials_volume
        );
        Ok(())
    }
}

/// Arguments for the bulk cleanup
#[derive(Args)]
pub struct CleanupArgs {
    /// Also delete all session records, logs and results
    #[arg(long = "purge")]
    pub purge: bool,
}

impl CleanupArgs {
    pub async fn run(self, context: &CliContext) -> Result<()> {
        let registry = context.registry()?;
        let report = registry
            .cleanup_all(self.purge)
            .await
            .context("Cleanup failed")?;

        for name in &report.containers_removed {
            println!("Removed container {}", name);
        }
        println!(
            "Removed all workspaces under {}",
            context.config.workspaces_dir.display()
        );
        if self.purge {
            println!("Purged {} session(s)", report.sessions_purged);
        }
        Ok(())
    }
}

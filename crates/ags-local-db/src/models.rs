//! Database models and persistence operations.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time in the stored timestamp format.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format(crate::schema::TIMESTAMP_FORMAT).to_string()
}

/// Status of a session in its lifecycle.
///
/// Transitions only move forward: `AgentRunning` -> `AgentComplete` ->
/// one of the terminal states. Provisioning failures may jump straight from
/// `AgentRunning` to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "AGENT_RUNNING")]
    AgentRunning,
    #[serde(rename = "AGENT_COMPLETE")]
    AgentComplete,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "DONE_AND_NONE")]
    DoneAndNone,
    #[serde(rename = "ERROR")]
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::AgentRunning => "AGENT_RUNNING",
            SessionStatus::AgentComplete => "AGENT_COMPLETE",
            SessionStatus::Done => "DONE",
            SessionStatus::DoneAndNone => "DONE_AND_NONE",
            SessionStatus::Error => "ERROR",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SessionStatus::AgentRunning => 0,
            SessionStatus::AgentComplete => 1,
            SessionStatus::Done | SessionStatus::DoneAndNone | SessionStatus::Error => 2,
        }
    }

    /// Whether no further transition is allowed out of this status.
    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether a session in this status may move to `next`.
    ///
    /// Re-asserting a non-terminal status is allowed so that an error message
    /// can be refined without changing the state.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AGENT_RUNNING" => Ok(SessionStatus::AgentRunning),
            "AGENT_COMPLETE" => Ok(SessionStatus::AgentComplete),
            "DONE" => Ok(SessionStatus::Done),
            "DONE_AND_NONE" => Ok(SessionStatus::DoneAndNone),
            "ERROR" => Ok(SessionStatus::Error),
            other => Err(crate::Error::generic(format!("Unknown session status: {}", other))),
        }
    }
}

/// Severity of a log entry. `Tool` marks structured agent hook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Tool,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Tool => "TOOL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "TOOL" => Ok(LogLevel::Tool),
            other => Err(crate::Error::generic(format!("Unknown log level: {}", other))),
        }
    }
}

/// Producer of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSource {
    /// Orchestration progress written by the sandbox itself.
    System,
    /// Workspace provisioning and cleanup.
    Workspace,
    /// Lines from the agent container's output stream.
    Container,
    /// Structured events written by the agent's hook scripts.
    Hook,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::System => "SYSTEM",
            LogSource::Workspace => "WORKSPACE",
            LogSource::Container => "CONTAINER",
            LogSource::Hook => "HOOK",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYSTEM" => Ok(LogSource::System),
            "WORKSPACE" => Ok(LogSource::Workspace),
            "CONTAINER" => Ok(LogSource::Container),
            "HOOK" => Ok(LogSource::Hook),
            other => Err(crate::Error::generic(format!("Unknown log source: {}", other))),
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: crate::Error| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(SessionStatus);
text_enum_sql!(LogLevel);
text_enum_sql!(LogSource);

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn to_json_column<T: Serialize + ?Sized>(value: Option<&T>) -> crate::Result<Option<String>> {
    Ok(match value {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

/// Parameters for creating a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub name: String,
    pub project: String,
    pub goal: String,
    pub phase: String,
    pub result_kind: String,
    pub target_files: Option<Vec<String>>,
}

/// Database model for sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub name: String,
    pub project: String,
    pub goal: String,
    pub phase: String,
    pub result_kind: String,
    pub target_files: Option<Vec<String>>,
    pub status: SessionStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

impl SessionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SessionRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            project: row.get(2)?,
            goal: row.get(3)?,
            phase: row.get(4)?,
            result_kind: row.get(5)?,
            target_files: json_column(row, 6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            ended_at: row.get(10)?,
            exit_code: row.get(11)?,
            error_message: row.get(12)?,
        })
    }
}

const SESSION_COLUMNS: &str = "id, name, project, goal, phase, result_kind, target_files, status, \
     created_at, started_at, ended_at, exit_code, error_message";

/// Selection criteria for listing sessions. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Database operations for sessions.
pub struct SessionStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> SessionStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Insert a new session in `AGENT_RUNNING` state and return its row id.
    pub fn insert(&self, session: &NewSession) -> crate::Result<i64> {
        let target_files = to_json_column(session.target_files.as_ref())?;
        let result = self.conn.execute(
            r#"
            INSERT INTO sessions (name, project, goal, phase, result_kind, target_files, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                session.name,
                session.project,
                session.goal,
                session.phase,
                session.result_kind,
                target_files,
                SessionStatus::AgentRunning,
                now_timestamp()
            ],
        );

        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(crate::Error::DuplicateSession(session.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, name: &str) -> crate::Result<Option<SessionRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM sessions WHERE name = ?", SESSION_COLUMNS))?;

        let mut rows = stmt.query_map(params![name], SessionRecord::from_row)?;

        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: &SessionFilter) -> crate::Result<Vec<SessionRecord>> {
        let mut sql = format!(
            "SELECT {} FROM sessions WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, id DESC",
            SESSION_COLUMNS
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt.query_map(
            params![filter.project, filter.status],
            SessionRecord::from_row,
        )?;

        let mut sessions = Vec::new();
        for record in records {
            sessions.push(record?);
        }
        Ok(sessions)
    }

    /// Record that the agent container has been started.
    pub fn mark_started(&self, name: &str) -> crate::Result<()> {
        let updated = self.conn.execute(
            "UPDATE sessions SET started_at = ? WHERE name = ? AND started_at IS NULL",
            params![now_timestamp(), name],
        )?;
        if updated == 0 && self.get(name)?.is_none() {
            return Err(crate::Error::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Move a session to `status`, refusing regressions and exits from a terminal state.
    ///
    /// `exit_code` and `error_message` are only overwritten when provided.
    /// The end timestamp is stamped the first time the agent is no longer running.
    pub fn update_status(
        &self,
        name: &str,
        status: SessionStatus,
        exit_code: Option<i64>,
        error_message: Option<&str>,
    ) -> crate::Result<()> {
        let current = self
            .get(name)?
            .ok_or_else(|| crate::Error::SessionNotFound(name.to_string()))?;

        if !current.status.can_transition_to(status) {
            return Err(crate::Error::InvalidTransition {
                session: name.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let ended_at = match (&current.ended_at, status) {
            (Some(existing), _) => Some(existing.clone()),
            (None, SessionStatus::AgentRunning) => None,
            (None, _) => Some(now_timestamp()),
        };

        self.conn.execute(
            r#"
            UPDATE sessions
            SET status = ?,
                ended_at = ?,
                exit_code = COALESCE(?, exit_code),
                error_message = COALESCE(?, error_message)
            WHERE name = ?
            "#,
            params![status, ended_at, exit_code, error_message, name],
        )?;
        Ok(())
    }

    pub fn delete_all(&self) -> crate::Result<usize> {
        Ok(self.conn.execute("DELETE FROM sessions", params![])?)
    }
}

/// A log line to append to a session's activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    /// Event time; the insertion time is used when absent.
    pub timestamp: Option<String>,
    pub level: LogLevel,
    pub message: Option<String>,
    pub tool_name: Option<String>,
    pub hook_event: Option<String>,
    /// JSON-encoded tool arguments.
    pub tool_input: Option<String>,
    pub source: Option<LogSource>,
    pub raw_log: Option<String>,
}

impl NewLogEntry {
    pub fn message(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            level,
            message: Some(message.into()),
            tool_name: None,
            hook_event: None,
            tool_input: None,
            source: None,
            raw_log: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::message(LogLevel::Info, message)
    }

    pub fn with_source(mut self, source: LogSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw_log = Some(raw.into());
        self
    }

    pub fn at(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// Database model for log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub session_name: String,
    pub timestamp: String,
    pub level: LogLevel,
    pub message: Option<String>,
    pub tool_name: Option<String>,
    pub hook_event: Option<String>,
    pub tool_input: Option<String>,
    pub source: Option<LogSource>,
    pub raw_log: Option<String>,
}

/// Database operations for the activity log.
pub struct LogStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> LogStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, session_name: &str, entry: &NewLogEntry) -> crate::Result<i64> {
        let ts = entry.timestamp.clone().unwrap_or_else(now_timestamp);
        self.conn.execute(
            r#"
            INSERT INTO logs (session_name, ts, level, message, tool_name, hook_event, tool_input, source, raw_log)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                session_name,
                ts,
                entry.level,
                entry.message,
                entry.tool_name,
                entry.hook_event,
                entry.tool_input,
                entry.source,
                entry.raw_log
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All entries of a session in timestamp order, ties broken by insertion order.
    pub fn list_by_session(&self, session_name: &str) -> crate::Result<Vec<LogRecord>> {
        self.query(
            r#"
            SELECT id, session_name, ts, level, message, tool_name, hook_event, tool_input, source, raw_log
            FROM logs
            WHERE session_name = ?1
            ORDER BY ts ASC, id ASC
            "#,
            params![session_name],
        )
    }

    /// Entries of a session inserted after the entry `after_id`, in insertion order.
    pub fn list_after(&self, session_name: &str, after_id: i64) -> crate::Result<Vec<LogRecord>> {
        self.query(
            r#"
            SELECT id, session_name, ts, level, message, tool_name, hook_event, tool_input, source, raw_log
            FROM logs
            WHERE session_name = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
            params![session_name, after_id],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> crate::Result<Vec<LogRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt.query_map(params, |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                session_name: row.get(1)?,
                timestamp: row.get(2)?,
                level: row.get(3)?,
                message: row.get(4)?,
                tool_name: row.get(5)?,
                hook_event: row.get(6)?,
                tool_input: row.get(7)?,
                source: row.get(8)?,
                raw_log: row.get(9)?,
            })
        })?;

        let mut logs = Vec::new();
        for record in records {
            logs.push(record?);
        }
        Ok(logs)
    }

    pub fn delete_all(&self) -> crate::Result<usize> {
        Ok(self.conn.execute("DELETE FROM logs", params![])?)
    }
}

/// Database model for collected results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: i64,
    pub session_name: String,
    pub phase: String,
    pub kind: String,
    pub target_files: Option<Vec<String>>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

impl ResultRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ResultRecord {
            id: row.get(0)?,
            session_name: row.get(1)?,
            phase: row.get(2)?,
            kind: row.get(3)?,
            target_files: json_column(row, 4)?,
            content: row.get(5)?,
            metadata: json_column(row, 6)?,
            created_at: row.get(7)?,
        })
    }
}

/// Database operations for results.
pub struct ResultStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> ResultStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace the result for `(session_name, phase)`.
    pub fn upsert(
        &self,
        session_name: &str,
        phase: &str,
        kind: &str,
        content: &str,
        target_files: Option<&[String]>,
        metadata: Option<&serde_json::Value>,
    ) -> crate::Result<()> {
        let target_files = to_json_column(target_files)?;
        let metadata = to_json_column(metadata)?;
        self.conn.execute(
            r#"
            INSERT INTO results (session_name, phase, kind, target_files, content, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_name, phase) DO UPDATE SET
                kind = excluded.kind,
                target_files = excluded.target_files,
                content = excluded.content,
                metadata = excluded.metadata,
                created_at = excluded.created_at
            "#,
            params![
                session_name,
                phase,
                kind,
                target_files,
                content,
                metadata,
                now_timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, session_name: &str, phase: &str) -> crate::Result<Option<ResultRecord>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, session_name, phase, kind, target_files, content, metadata, created_at
                FROM results WHERE session_name = ? AND phase = ?
                "#,
                params![session_name, phase],
                ResultRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_by_session(&self, session_name: &str) -> crate::Result<Vec<ResultRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, session_name, phase, kind, target_files, content, metadata, created_at
            FROM results
            WHERE session_name = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )?;

        let records = stmt.query_map(params![session_name], ResultRecord::from_row)?;

        let mut results = Vec::new();
        for record in records {
            results.push(record?);
        }
        Ok(results)
    }

    pub fn delete_all(&self) -> crate::Result<usize> {
        Ok(self.conn.execute("DELETE FROM results", params![])?)
    }
}

//! Database integration for session persistence.

use ags_local_db::{
    Database, LogRecord, LogStore, NewLogEntry, NewSession, ResultRecord, ResultStore,
    SessionFilter, SessionRecord, SessionStatus, SessionStore,
};
use std::path::Path;

/// Persistence facade used by the orchestration layer.
///
/// Every operation takes the store's single connection lock; writes run in a
/// transaction so readers never see a partially applied change.
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    db: Database,
}

impl DatabaseManager {
    /// Create a new database manager with default database path.
    pub fn new() -> crate::Result<Self> {
        let db = Database::open_default()?;
        Ok(Self { db })
    }

    /// Create a new database manager with custom database path.
    pub fn with_path<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = Database::open(path)?;
        Ok(Self { db })
    }

    /// Create a database manager backed by an in-memory store.
    pub fn in_memory() -> crate::Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    /// Insert a session record in `AGENT_RUNNING` state.
    pub fn create_session(&self, session: &NewSession) -> crate::Result<i64> {
        Ok(self.db.transaction(|conn| SessionStore::new(conn).insert(session))?)
    }

    /// Validate and apply a status transition.
    pub fn update_status(
        &self,
        name: &str,
        status: SessionStatus,
        exit_code: Option<i64>,
        error_message: Option<&str>,
    ) -> crate::Result<()> {
        Ok(self.db.transaction(|conn| {
            SessionStore::new(conn).update_status(name, status, exit_code, error_message)
        })?)
    }

    /// Stamp the time the agent container started.
    pub fn mark_started(&self, name: &str) -> crate::Result<()> {
        Ok(self.db.transaction(|conn| SessionStore::new(conn).mark_started(name))?)
    }

    pub fn get_session(&self, name: &str) -> crate::Result<Option<SessionRecord>> {
        Ok(self.db.read(|conn| SessionStore::new(conn).get(name))?)
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> crate::Result<Vec<SessionRecord>> {
        Ok(self.db.read(|conn| SessionStore::new(conn).list(filter))?)
    }

    pub fn append_log(&self, session: &str, entry: &NewLogEntry) -> crate::Result<i64> {
        Ok(self.db.transaction(|conn| LogStore::new(conn).insert(session, entry))?)
    }

    /// Log entries of a session in timestamp order.
    pub fn list_logs(&self, session: &str) -> crate::Result<Vec<LogRecord>> {
        Ok(self.db.read(|conn| LogStore::new(conn).list_by_session(session))?)
    }

    /// Entries appended after `after_id`, in insertion order.
    pub fn list_logs_after(&self, session: &str, after_id: i64) -> crate::Result<Vec<LogRecord>> {
        Ok(self.db.read(|conn| LogStore::new(conn).list_after(session, after_id))?)
    }

    /// Insert or replace the result of `(session, phase)`.
    pub fn save_result(
        &self,
        session: &str,
        phase: &str,
        kind: &str,
        content: &str,
        target_files: Option<&[String]>,
        metadata: Option<&serde_json::Value>,
    ) -> crate::Result<()> {
        Ok(self.db.transaction(|conn| {
            ResultStore::new(conn).upsert(session, phase, kind, content, target_files, metadata)
        })?)
    }

    /// Store the collected result and move the session to its terminal
    /// `status` in one transaction.
    ///
    /// A rejected transition rolls the result back with it.
    pub fn complete_session(
        &self,
        session: &str,
        phase: &str,
        kind: &str,
        content: &str,
        target_files: Option<&[String]>,
        metadata: Option<&serde_json::Value>,
        status: SessionStatus,
    ) -> crate::Result<()> {
        Ok(self.db.transaction(|conn| {
            ResultStore::new(conn).upsert(session, phase, kind, content, target_files, metadata)?;
            SessionStore::new(conn).update_status(session, status, None, None)
        })?)
    }

    pub fn get_result(&self, session: &str, phase: &str) -> crate::Result<Option<ResultRecord>> {
        Ok(self.db.read(|conn| ResultStore::new(conn).get(session, phase))?)
    }

    pub fn list_results(&self, session: &str) -> crate::Result<Vec<ResultRecord>> {
        Ok(self.db.read(|conn| ResultStore::new(conn).list_by_session(session))?)
    }

    /// Delete every session, log entry and result. Returns the number of sessions removed.
    pub fn purge_all(&self) -> crate::Result<usize> {
        Ok(self.db.transaction(|conn| {
            ResultStore::new(conn).delete_all()?;
            LogStore::new(conn).delete_all()?;
            SessionStore::new(conn).delete_all()
        })?)
    }
}

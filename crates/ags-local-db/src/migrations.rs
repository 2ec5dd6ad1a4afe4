//! Database migration management.
//!
//! Every schema change is a numbered migration applied exactly once when the
//! store is opened. Runtime code never inspects table shape.

use rusqlite::{params, Connection};

/// Database migration manager.
pub struct MigrationManager;

impl MigrationManager {
    /// Apply all pending migrations to the database.
    pub fn migrate(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        let current_version = Self::current_version(conn)?.unwrap_or(0);

        if current_version > crate::schema::SCHEMA_VERSION {
            return Err(crate::Error::migration(format!(
                "Database schema version {} is newer than supported version {}",
                current_version,
                crate::schema::SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            tracing::debug!("Applying schema migration 1");
            Self::apply_migration_1(conn)?;
        }

        Ok(())
    }

    /// Migration 1: sessions, their activity log and collected results.
    fn apply_migration_1(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            BEGIN;

            -- One row per agent run, keyed by its generated unique name
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                project TEXT NOT NULL,
                goal TEXT NOT NULL,
                phase TEXT NOT NULL,
                result_kind TEXT NOT NULL,
                target_files TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                exit_code INTEGER,
                error_message TEXT
            );

            -- Agent activity: hook events, container output and system messages
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_name TEXT NOT NULL REFERENCES sessions(name) ON DELETE CASCADE,
                ts TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT,
                tool_name TEXT,
                hook_event TEXT,
                tool_input TEXT,
                source TEXT,
                raw_log TEXT
            );

            -- At most one collected result per session and phase
            CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_name TEXT NOT NULL REFERENCES sessions(name) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                kind TEXT NOT NULL,
                target_files TEXT,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(session_name, phase)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);
            CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);
            CREATE INDEX IF NOT EXISTS idx_logs_session_ts ON logs(session_name, ts);

            INSERT OR REPLACE INTO schema_migrations (version) VALUES (1);

            COMMIT;
            "#,
        )?;

        Ok(())
    }

    /// Get the current schema version.
    pub fn current_version(conn: &Connection) -> crate::Result<Option<u32>> {
        let mut stmt = conn.prepare("SELECT MAX(version) FROM schema_migrations")?;

        let version: Option<u32> = stmt.query_row(params![], |row| row.get(0))?;

        Ok(version)
    }
}

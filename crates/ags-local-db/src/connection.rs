//! Database connection management.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// File name of the session database inside the sandbox home.
pub const DATABASE_FILE_NAME: &str = "agents.db";

/// Shared handle to one physical store.
///
/// Cloning is cheap; every clone serializes through the same connection lock.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Get the default database path.
    ///
    /// Priority order:
    /// 1. `AGS_HOME` environment variable
    /// 2. `~/.ags` in the user's home directory
    pub fn default_path() -> crate::Result<PathBuf> {
        if let Ok(ags_home) = std::env::var("AGS_HOME") {
            return Ok(PathBuf::from(ags_home).join(DATABASE_FILE_NAME));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| crate::Error::generic("Could not determine home directory"))?;
        Ok(home.join(".ags").join(DATABASE_FILE_NAME))
    }

    /// Open the database at the default path.
    pub fn open_default() -> crate::Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path)
    }

    /// Open a new database connection at the specified path.
    ///
    /// Missing parent directories and the database file itself are created.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self::from_connection(Connection::open(path)?)?;
        tracing::debug!(path = %path.display(), "Opened session database");
        Ok(db)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> crate::Result<Self> {
        Self::prepare(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn prepare(conn: &Connection) -> crate::Result<()> {
        // WAL lets readers proceed while a write transaction is open
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::MigrationManager::migrate(conn)
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| crate::Error::generic("Session database lock poisoned"))
    }

    /// Run `f` inside a transaction; it commits when `f` succeeds and
    /// rolls back otherwise.
    pub fn transaction<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only closure while holding the connection lock.
    pub fn read<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        f(&*self.lock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state").join(DATABASE_FILE_NAME);

        let _db = Database::open(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: crate::Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO sessions (name, project, goal, phase, result_kind, status, created_at)
                 VALUES ('s', 'p', 'g', 'implementation', 'diff', 'AGENT_RUNNING', 'now')",
                [],
            )?;
            Err(crate::Error::generic("abort"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::Result;

/// Durable record store holding the `tasks` and `sessions` collections.
///
/// Structured fields live in columns; open-ended maps (task metadata, task
/// history, session metadata) are stored as JSON text. All business logic
/// lives in [`TaskManager`](super::tasks::TaskManager) and
/// [`SessionStore`](super::sessions::SessionStore); this type only owns the
/// connection and the schema.
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        Self::init_schema(&db)?;
        debug!("Record store opened at {}", path.as_ref().display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store. Used by tests; every handle cloned from this store
    /// shares the single connection, so data is visible across components.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                result TEXT,
                error TEXT,
                metadata TEXT NOT NULL,
                history TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                branch_name TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;

        Ok(())
    }

    /// Shared handle to the connection. The mutex around it is the single
    /// mutual-exclusion boundary for every record mutation; callers must not
    /// hold it across external calls.
    pub(crate) fn handle(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }
}

/// UTC timestamp with second precision, ISO 8601.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

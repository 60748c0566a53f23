//! Persisted set of processed manifests.
//!
//! Keeps the router from re-running manifests it already handled, across
//! polls and restarts. Backed by a small sqlite database with a versioned
//! schema.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Schema migrations, applied in order. The index into this slice plus one
/// is the schema version.
const VERSIONED_SCHEMAS: &[&str] = &[
    "CREATE TABLE synced_manifests (
        manifest_path TEXT PRIMARY KEY,
        job_id        TEXT NOT NULL,
        status        TEXT NOT NULL,
        synced_at     INTEGER NOT NULL
    )",
];

/// Terminal status of a manifest in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Failed,
    Invalid,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sqlite-backed processed-manifest set.
pub struct SeenStore {
    conn: Mutex<Connection>,
}

impl SeenStore {
    /// Open (and migrate) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
            [],
        )?;
        let current: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        let current = current.unwrap_or(0) as usize;
        for (i, schema) in VERSIONED_SCHEMAS.iter().enumerate().skip(current) {
            conn.execute_batch(schema)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![(i + 1) as i64],
            )?;
        }
        Ok(())
    }

    /// Whether this manifest already reached a terminal status.
    pub fn is_processed(&self, manifest_path: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let found: Option<String> = conn
            .query_row(
                "SELECT status FROM synced_manifests WHERE manifest_path = ?1",
                params![manifest_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a manifest's terminal status.
    pub fn mark(
        &self,
        manifest_path: &str,
        job_id: &str,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO synced_manifests
             (manifest_path, job_id, status, synced_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                manifest_path,
                job_id,
                status.as_str(),
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Number of recorded manifests, for diagnostics.
    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let count =
            conn.query_row("SELECT COUNT(*) FROM synced_manifests", [], |row| row.get(0))?;
        Ok(count)
    }
}

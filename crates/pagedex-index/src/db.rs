//! SQLite database holding the indexer's own state.
//!
//! Three tables live here:
//! - `indexed_units`: the last indexed text and fingerprint of every unit
//! - `link_edges`: the backlink graph
//! - `index_jobs`: the durable job queue
//!
//! The connection is shared behind a mutex; every statement is short, so the
//! stores call into it directly from async code.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

/// Handle to the indexer database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {:?}: {}", parent, e)))?;
            }
        }

        info!("Opening index database at {:?}", path);
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS indexed_units (
                    page_id TEXT NOT NULL,
                    unit_id TEXT NOT NULL,
                    text TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (page_id, unit_id)
                );

                CREATE TABLE IF NOT EXISTS link_edges (
                    source_page_id TEXT NOT NULL,
                    target_page_id TEXT NOT NULL,
                    target_unit_id TEXT NOT NULL DEFAULT '',
                    snippet TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (source_page_id, target_page_id, target_unit_id)
                );

                CREATE INDEX IF NOT EXISTS idx_link_edges_target
                    ON link_edges(target_page_id);

                CREATE TABLE IF NOT EXISTS index_jobs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    page_id TEXT NOT NULL,
                    snapshot TEXT NOT NULL,
                    processing INTEGER NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    not_before INTEGER NOT NULL DEFAULT 0,
                    dead INTEGER NOT NULL DEFAULT 0,
                    reindex INTEGER NOT NULL DEFAULT 0,
                    enqueued_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_index_jobs_page
                    ON index_jobs(page_id);",
            )?;

            // Queues created before reindex requests were recorded per job
            let has_reindex: bool = conn.query_row(
                "SELECT COUNT(*) FROM pragma_table_info('index_jobs') WHERE name = 'reindex'",
                [],
                |row| row.get(0),
            )?;
            if !has_reindex {
                conn.execute(
                    "ALTER TABLE index_jobs ADD COLUMN reindex INTEGER NOT NULL DEFAULT 0",
                    [],
                )?;
            }
            Ok(())
        })?;
        debug!("Index database schema ready");
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut conn)?)
    }
}

/// Current time as Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

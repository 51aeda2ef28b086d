//! SQLite durable tier
//!
//! One key/value table behind a schema version row. Opening a database whose
//! stored version differs from [`SCHEMA_VERSION`] clears it: the tier is
//! best-effort and may always be rebuilt from the backend.
//!
//! Schema:
//! - cache_metadata: key/value integers (schema version)
//! - cache_entries: durable key, JSON envelope, write time

use crate::cache::durable::DurableStore;
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Current schema version
///
/// Version History:
/// - v1: key/value table with JSON envelopes
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed [`DurableStore`] (thread-safe)
///
/// rusqlite calls run on the blocking pool so callers never stall the
/// async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Create or open a cache database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                message: format!("Failed to create cache directory {}: {}", parent.display(), e),
            })?;
        }

        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // WAL keeps readers unblocked while a write is in progress
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database (tests, ephemeral sessions)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_metadata (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        let stored_version: Option<i32> = conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version {
            Some(v) if v != SCHEMA_VERSION => {
                warn!(
                    stored = v,
                    current = SCHEMA_VERSION,
                    "Cache schema version mismatch, clearing durable tier"
                );
                conn.execute("DELETE FROM cache_entries", [])?;
                conn.execute(
                    "INSERT OR REPLACE INTO cache_metadata (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO cache_metadata (key, value) VALUES ('version', ?)",
                    params![SCHEMA_VERSION],
                )?;
                debug!("Cache schema version initialized to {}", SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        if let Some(ref p) = path {
            debug!(path = %p.display(), "Durable cache opened");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file, if not in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn run<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?;
        Ok(result?)
    }

    /// Entry count and payload size
    pub async fn stats(&self) -> Result<DurableStats, StoreError> {
        self.run(|conn| {
            let total_entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
            let total_size: Option<i64> = conn.query_row(
                "SELECT SUM(LENGTH(value)) FROM cache_entries",
                [],
                |row| row.get(0),
            )?;
            Ok(DurableStats {
                total_entries: total_entries as usize,
                total_size_bytes: total_size.unwrap_or(0) as usize,
            })
        })
        .await
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self
            .run(|conn| conn.execute("DELETE FROM cache_entries", []))
            .await?;
        debug!(removed, "Durable cache cleared");
        Ok(removed)
    }

    /// Reclaim space after large deletions
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        self.run(|conn| conn.execute("VACUUM", []).map(|_| ())).await
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT value FROM cache_entries WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value, updated_at) VALUES (?, ?, ?)",
                params![key, value, chrono::Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
            let keys = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if self.path.is_none() {
            return;
        }
        // Flush WAL into the main file so it doesn't grow across restarts
        let conn = self.conn.lock();
        if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
            warn!("Failed to checkpoint WAL on SqliteStore drop: {}", e);
        }
    }
}

/// Durable tier statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
}

//! Embedded SQLite store backing every ledger and checkpoint.
//!
//! One database file holds the request ledger, rate-limit state, response
//! cache, scan checkpoints and the download ledger. Schema creation is
//! idempotent and columns added after first release are migrated additively,
//! so an old database upgrades in place on open.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Milliseconds in the sliding rate-limit window (1 hour).
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// Milliseconds in the daily ceiling window (24 hours).
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Request records older than this are pruned opportunistically.
const REQUEST_RETENTION_MS: i64 = DAY_MS;

/// Scan rows older than this are pruned on demand (7 days).
const SCAN_RETENTION_MS: i64 = 7 * DAY_MS;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    category TEXT CHECK(category IN ('standard','restricted')) NOT NULL,
    status INTEGER,
    bytes INTEGER
);

CREATE TABLE IF NOT EXISTS rate_limit_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT CHECK(category IN ('standard','restricted')) NOT NULL UNIQUE,
    triggered_at_ms INTEGER NOT NULL,
    reset_at_ms INTEGER NOT NULL,
    requests_used INTEGER NOT NULL,
    limit_value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS api_cache (
    endpoint TEXT PRIMARY KEY,
    response_data TEXT NOT NULL,
    cached_at_ms INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at_ms INTEGER NOT NULL,
    user TEXT,
    remote_backup_item_id INTEGER,
    title TEXT,
    summary TEXT
);

CREATE TABLE IF NOT EXISTS scan_apps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    org_name TEXT NOT NULL,
    workspace_id INTEGER NOT NULL,
    workspace_name TEXT NOT NULL,
    app_id INTEGER NOT NULL,
    app_name TEXT NOT NULL,
    folder_path TEXT NOT NULL,
    FOREIGN KEY (scan_id) REFERENCES scans(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS scan_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    app_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    FOREIGN KEY (scan_id) REFERENCES scans(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS scan_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    app_id INTEGER NOT NULL,
    item_id INTEGER,
    file_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    size INTEGER,
    mimetype TEXT,
    download_url TEXT NOT NULL,
    folder_path TEXT NOT NULL,
    FOREIGN KEY (scan_id) REFERENCES scans(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    app_id INTEGER NOT NULL,
    item_id INTEGER,
    path TEXT NOT NULL,
    size INTEGER,
    status TEXT CHECK(status IN ('pending','done','error')) NOT NULL DEFAULT 'pending',
    last_try_ms INTEGER,
    tries INTEGER DEFAULT 0,
    UNIQUE (scan_id, file_id),
    FOREIGN KEY (scan_id) REFERENCES scans(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_requests_ts ON requests(ts_ms);
CREATE INDEX IF NOT EXISTS idx_requests_category ON requests(category, ts_ms);
CREATE INDEX IF NOT EXISTS idx_rate_limit_category ON rate_limit_status(category);
CREATE INDEX IF NOT EXISTS idx_api_cache_expires ON api_cache(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_scans_created ON scans(created_at_ms);
CREATE INDEX IF NOT EXISTS idx_scan_apps_scan ON scan_apps(scan_id);
CREATE INDEX IF NOT EXISTS idx_scan_items_scan ON scan_items(scan_id);
CREATE INDEX IF NOT EXISTS idx_scan_files_scan ON scan_files(scan_id);
CREATE INDEX IF NOT EXISTS idx_downloads_scan ON downloads(scan_id);
CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
";

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while preparing the database location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a JSON column failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row that the caller asserted exists is missing
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the embedded store. All mutations are single-statement writes
/// serialized through one connection, which is the atomicity the ledgers
/// rely on; no application-level locking is layered on top.
pub struct BackupStore {
    conn: Mutex<Connection>,
}

impl BackupStore {
    /// Open (or create) the store at `path` and bring the schema up to date.
    ///
    /// Schema creation failure is fatal to startup; everything downstream
    /// assumes the tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened backup store");
        Self::from_connection(conn)
    }

    /// Open an in-memory store. Used by tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Additive column migrations for fields introduced after first release.
    ///
    /// `scans.checkpoint` and `scans.cancelled` did not exist in early
    /// databases; `PRAGMA table_info` tells us whether to add them.
    fn migrate(conn: &Connection) -> StoreResult<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(scans)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;

        if !columns.iter().any(|c| c == "checkpoint") {
            debug!("Adding checkpoint column to scans");
            conn.execute_batch("ALTER TABLE scans ADD COLUMN checkpoint TEXT")?;
        }
        if !columns.iter().any(|c| c == "cancelled") {
            debug!("Adding cancelled column to scans");
            conn.execute_batch("ALTER TABLE scans ADD COLUMN cancelled INTEGER DEFAULT 0")?;
        }
        Ok(())
    }

    /// Borrow the connection. Recovers from a poisoned lock; the connection
    /// itself stays consistent because every statement is atomic.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delete request records older than the longest tracked window.
    ///
    /// Safe to run unconditionally: correctness depends only on counts
    /// inside the window, never on historical rows.
    pub fn prune_old_requests(&self, now_ms: i64) {
        let cutoff = now_ms - REQUEST_RETENTION_MS;
        match self
            .conn()
            .execute("DELETE FROM requests WHERE ts_ms < ?1", [cutoff])
        {
            Ok(n) if n > 0 => debug!(pruned = n, "Pruned old request records"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to prune old request records"),
        }
    }

    /// Delete scans (and their child rows) older than the retention window.
    pub fn prune_old_scans(&self, now_ms: i64) {
        let cutoff = now_ms - SCAN_RETENTION_MS;
        let conn = self.conn();
        // Cascade by hand: the connection may not have foreign_keys enabled.
        let result = conn
            .execute(
                "DELETE FROM scan_apps WHERE scan_id IN (SELECT id FROM scans WHERE created_at_ms < ?1)",
                [cutoff],
            )
            .and_then(|_| {
                conn.execute(
                    "DELETE FROM scan_items WHERE scan_id IN (SELECT id FROM scans WHERE created_at_ms < ?1)",
                    [cutoff],
                )
            })
            .and_then(|_| {
                conn.execute(
                    "DELETE FROM scan_files WHERE scan_id IN (SELECT id FROM scans WHERE created_at_ms < ?1)",
                    [cutoff],
                )
            })
            .and_then(|_| {
                conn.execute(
                    "DELETE FROM downloads WHERE scan_id IN (SELECT id FROM scans WHERE created_at_ms < ?1)",
                    [cutoff],
                )
            })
            .and_then(|_| conn.execute("DELETE FROM scans WHERE created_at_ms < ?1", [cutoff]));
        match result {
            Ok(n) if n > 0 => debug!(pruned = n, "Pruned old scan records"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to prune old scans"),
        }
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

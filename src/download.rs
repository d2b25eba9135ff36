//! Per-file download ledger.
//!
//! Each file a scan discovers gets exactly one row per scan. Enqueueing is
//! idempotent, so replaying enumeration after an interruption is harmless.
//! `done` is sticky: once a file has been fetched and written it is never
//! retried, which is what makes a resumed backup skip completed work.

use crate::store::{now_ms, BackupStore, StoreError, StoreResult, HOUR_MS};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Attempts before a file is reported as permanently failed.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// A backup counts as incomplete while this recent (48 hours).
const INCOMPLETE_WINDOW_MS: i64 = 48 * HOUR_MS;

/// Lifecycle of one queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Queued, not yet fetched.
    Pending,
    /// Fetched and written to disk. Terminal.
    Done,
    /// Last attempt failed; eligible for retry until tries run out.
    Error,
}

impl DownloadStatus {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Done => "done",
            DownloadStatus::Error => "error",
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "done" => Ok(DownloadStatus::Done),
            "error" => Ok(DownloadStatus::Error),
            _ => Err(format!("Invalid download status: {s}")),
        }
    }
}

/// One queued file as stored.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    /// Row id.
    pub id: i64,
    /// Owning scan.
    pub scan_id: i64,
    /// Remote file identifier.
    pub file_id: i64,
    /// Owning application.
    pub app_id: i64,
    /// Owning item, when attached to one.
    pub item_id: Option<i64>,
    /// Destination path relative to the backup root.
    pub path: String,
    /// Expected size in bytes, when known.
    pub size: Option<u64>,
    /// Current lifecycle state.
    pub status: DownloadStatus,
    /// When the last attempt ran (Unix ms).
    pub last_try_ms: Option<i64>,
    /// Attempts made so far.
    pub tries: u32,
}

/// Aggregate progress counters for one scan's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    /// Files queued.
    pub total: u64,
    /// Files completed.
    pub done: u64,
    /// Files not yet attempted or awaiting retry.
    pub pending: u64,
    /// Files whose last attempt failed.
    pub error: u64,
}

impl DownloadStats {
    /// Whether every queued file has completed.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

/// Download queue persistence backed by the store.
#[derive(Clone)]
pub struct DownloadLedger {
    store: Arc<BackupStore>,
}

impl DownloadLedger {
    /// Create a ledger over the shared store.
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self { store }
    }

    /// Queue a file for download. Idempotent per `(scan_id, file_id)`:
    /// re-enqueueing an existing row (whatever its status) is a no-op, so
    /// replayed enumeration never resets progress.
    pub fn enqueue(
        &self,
        scan_id: i64,
        file_id: i64,
        app_id: i64,
        item_id: Option<i64>,
        path: &str,
        size: Option<u64>,
    ) -> StoreResult<()> {
        self.store.conn().execute(
            "INSERT OR IGNORE INTO downloads (scan_id, file_id, app_id, item_id, path, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scan_id,
                file_id,
                app_id,
                item_id,
                path,
                size.map(|s| s as i64)
            ],
        )?;
        Ok(())
    }

    /// Mark a file done, recording the bytes actually written when known.
    /// Terminal; nothing moves a row out of `done`.
    pub fn mark_done(&self, scan_id: i64, file_id: i64, size: Option<u64>) -> StoreResult<()> {
        let updated = self.store.conn().execute(
            "UPDATE downloads SET status = 'done', last_try_ms = ?1, tries = tries + 1,
                    size = COALESCE(?2, size)
             WHERE scan_id = ?3 AND file_id = ?4",
            params![now_ms(), size.map(|s| s as i64), scan_id, file_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "download {file_id} in scan {scan_id}"
            )));
        }
        Ok(())
    }

    /// Record a failed attempt. Guarded so a late failure report can never
    /// demote a row that already completed.
    pub fn mark_error(&self, scan_id: i64, file_id: i64) -> StoreResult<()> {
        self.store.conn().execute(
            "UPDATE downloads SET status = 'error', last_try_ms = ?1, tries = tries + 1
             WHERE scan_id = ?2 AND file_id = ?3 AND status != 'done'",
            params![now_ms(), scan_id, file_id],
        )?;
        Ok(())
    }

    /// Move every `error` row with tries remaining back to `pending`.
    /// Returns how many rows were requeued.
    pub fn requeue_errors(&self, scan_id: i64, max_tries: u32) -> StoreResult<usize> {
        let requeued = self.store.conn().execute(
            "UPDATE downloads SET status = 'pending'
             WHERE scan_id = ?1 AND status = 'error' AND tries < ?2",
            params![scan_id, max_tries],
        )?;
        if requeued > 0 {
            debug!(scan_id, requeued, "Requeued failed downloads");
        }
        Ok(requeued)
    }

    /// Whether a file has already completed.
    pub fn is_done(&self, scan_id: i64, file_id: i64) -> StoreResult<bool> {
        let status: Option<String> = self
            .store
            .conn()
            .query_row(
                "SELECT status FROM downloads WHERE scan_id = ?1 AND file_id = ?2",
                params![scan_id, file_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some("done"))
    }

    /// Files still awaiting a (re)attempt, in enqueue order.
    pub fn pending(&self, scan_id: i64) -> StoreResult<Vec<DownloadRecord>> {
        self.query_by_status(scan_id, "SELECT id, scan_id, file_id, app_id, item_id, path, size, status, last_try_ms, tries
             FROM downloads WHERE scan_id = ?1 AND status = 'pending' ORDER BY id ASC")
    }

    /// Files whose last attempt failed, regardless of tries.
    pub fn failed(&self, scan_id: i64) -> StoreResult<Vec<DownloadRecord>> {
        self.query_by_status(scan_id, "SELECT id, scan_id, file_id, app_id, item_id, path, size, status, last_try_ms, tries
             FROM downloads WHERE scan_id = ?1 AND status = 'error' ORDER BY id ASC")
    }

    /// Files that exhausted their retry budget. These are surfaced as
    /// warnings in the final report, never retried silently.
    pub fn permanently_failed(&self, scan_id: i64, max_tries: u32) -> StoreResult<Vec<DownloadRecord>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT id, scan_id, file_id, app_id, item_id, path, size, status, last_try_ms, tries
             FROM downloads WHERE scan_id = ?1 AND status = 'error' AND tries >= ?2 ORDER BY id ASC",
        )?;
        let records = stmt
            .query_map(params![scan_id, max_tries], Self::row_to_record)?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    /// Progress counters for one scan's queue.
    pub fn stats(&self, scan_id: i64) -> StoreResult<DownloadStats> {
        self.store.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'done'), 0),
                    COALESCE(SUM(status = 'pending'), 0),
                    COALESCE(SUM(status = 'error'), 0)
             FROM downloads WHERE scan_id = ?1",
            [scan_id],
            |row| {
                Ok(DownloadStats {
                    total: row.get::<_, i64>(0)? as u64,
                    done: row.get::<_, i64>(1)? as u64,
                    pending: row.get::<_, i64>(2)? as u64,
                    error: row.get::<_, i64>(3)? as u64,
                })
            },
        ).map_err(StoreError::from)
    }

    /// Whether any recent scan still has unfinished downloads.
    pub fn has_incomplete_backup(&self) -> StoreResult<bool> {
        self.has_incomplete_backup_at(now_ms())
    }

    /// `has_incomplete_backup` at an explicit instant.
    pub fn has_incomplete_backup_at(&self, now: i64) -> StoreResult<bool> {
        let exists: bool = self.store.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM downloads d
                JOIN scans s ON s.id = d.scan_id
                WHERE s.created_at_ms >= ?1 AND d.status != 'done'
             )",
            [now - INCOMPLETE_WINDOW_MS],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn query_by_status(&self, scan_id: i64, sql: &str) -> StoreResult<Vec<DownloadRecord>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map([scan_id], Self::row_to_record)?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
        let status: String = row.get(7)?;
        Ok(DownloadRecord {
            id: row.get(0)?,
            scan_id: row.get(1)?,
            file_id: row.get(2)?,
            app_id: row.get(3)?,
            item_id: row.get(4)?,
            path: row.get(5)?,
            size: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
            status: DownloadStatus::from_str(&status).unwrap_or(DownloadStatus::Pending),
            last_try_ms: row.get(8)?,
            tries: row.get::<_, i64>(9)? as u32,
        })
    }
}

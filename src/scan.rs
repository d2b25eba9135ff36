//! Scan lifecycle and hierarchical checkpointing.
//!
//! One scan is a single discovery pass over the remote hierarchy
//! (organizations, workspaces, applications, items, files). Its checkpoint is
//! overwritten after every completed unit of enumeration so an interruption
//! loses at most one unit. An open scan with no summary and no cancelled
//! flag is the resting state of an interrupted process; it is detected on
//! restart and offered for resume.

use crate::store::{now_ms, BackupStore, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Position inside the hierarchy walk, persisted after every unit of work.
///
/// Totals are discovered incrementally; `workspaces_counted`/`apps_counted`
/// record whether the per-level totals for the current parent are known yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    /// Index of the organization being processed.
    pub org_index: u32,
    /// Number of organizations discovered.
    pub org_total: u32,
    /// Index of the workspace being processed within the current org.
    pub workspace_index: u32,
    /// Number of workspaces in the current org.
    pub workspace_total: u32,
    /// Index of the app being processed within the current workspace.
    pub app_index: u32,
    /// Number of apps in the current workspace.
    pub app_total: u32,
    /// Whether the workspace total for the current org has been counted.
    pub workspaces_counted: bool,
    /// Whether the app total for the current workspace has been counted.
    pub apps_counted: bool,
}

impl ScanCheckpoint {
    /// Clamp stored indices to freshly discovered totals.
    ///
    /// A resumed scan may find the remote hierarchy has shrunk since the
    /// checkpoint was written; clamping instead of erroring lets the walk
    /// continue from the nearest valid position.
    pub fn clamp_to(&mut self, org_total: u32, workspace_total: u32, app_total: u32) {
        self.org_total = org_total;
        self.workspace_total = workspace_total;
        self.app_total = app_total;
        self.org_index = self.org_index.min(org_total);
        self.workspace_index = self.workspace_index.min(workspace_total);
        self.app_index = self.app_index.min(app_total);
    }
}

/// Counts written once a scan completes successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Organizations enumerated.
    pub organizations: u64,
    /// Workspaces enumerated.
    pub workspaces: u64,
    /// Applications enumerated.
    pub applications: u64,
    /// Items enumerated.
    pub items: u64,
    /// Files discovered.
    pub files: u64,
    /// Total size of discovered files in bytes.
    pub backup_size: u64,
}

/// Caller-supplied identity for a new scan.
#[derive(Debug, Clone, Default)]
pub struct ScanMeta {
    /// Operator account name, if known.
    pub user: Option<String>,
    /// Identifier of the remote item tracking this backup, if one was created.
    pub remote_backup_item_id: Option<i64>,
    /// Human-readable title.
    pub title: Option<String>,
}

/// One scan row as stored.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    /// Scan identifier.
    pub id: i64,
    /// Creation time (Unix ms).
    pub created_at_ms: i64,
    /// Operator account name.
    pub user: Option<String>,
    /// Remote backup-item identifier.
    pub remote_backup_item_id: Option<i64>,
    /// Title.
    pub title: Option<String>,
    /// Completion summary; present only after `finalize`.
    pub summary: Option<ScanSummary>,
    /// Whether the operator cancelled this scan.
    pub cancelled: bool,
    /// Last persisted checkpoint, if the scan is mid-flight.
    pub checkpoint: Option<ScanCheckpoint>,
}

impl ScanRecord {
    /// An interrupted scan: open, never finalized, not cancelled.
    pub fn is_interrupted(&self) -> bool {
        self.summary.is_none() && !self.cancelled
    }
}

/// Application discovered during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanApp {
    /// Organization display name.
    pub org_name: String,
    /// Workspace identifier.
    pub workspace_id: i64,
    /// Workspace display name.
    pub workspace_name: String,
    /// Application identifier.
    pub app_id: i64,
    /// Application display name.
    pub app_name: String,
    /// Destination folder for this app's files.
    pub folder_path: String,
}

/// File discovered during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFile {
    /// Owning application.
    pub app_id: i64,
    /// Owning item, when the file is attached to one.
    pub item_id: Option<i64>,
    /// Remote file identifier.
    pub file_id: i64,
    /// File name.
    pub name: String,
    /// Size in bytes, when the remote API reported one.
    pub size: Option<u64>,
    /// MIME type, when reported.
    pub mimetype: Option<String>,
    /// URL the file is downloaded from.
    pub download_url: String,
    /// Destination folder.
    pub folder_path: String,
}

/// Persistence for scans, their checkpoints, and their enumeration results.
#[derive(Clone)]
pub struct ScanJournal {
    store: Arc<BackupStore>,
}

impl ScanJournal {
    /// Create a journal over the shared store.
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self { store }
    }

    /// Create a new scan row and return its id.
    ///
    /// This is a critical write: without a scan identity nothing downstream
    /// can be recorded, so failure propagates to the caller.
    pub fn begin(&self, meta: &ScanMeta) -> StoreResult<i64> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO scans (created_at_ms, user, remote_backup_item_id, title)
             VALUES (?1, ?2, ?3, ?4)",
            params![now_ms(), meta.user, meta.remote_backup_item_id, meta.title],
        )?;
        let id = conn.last_insert_rowid();
        info!(scan_id = id, title = ?meta.title, "Scan started");
        Ok(id)
    }

    /// Idempotently overwrite the checkpoint for a scan.
    pub fn save_checkpoint(&self, scan_id: i64, checkpoint: &ScanCheckpoint) -> StoreResult<()> {
        let json = serde_json::to_string(checkpoint)?;
        let updated = self.store.conn().execute(
            "UPDATE scans SET checkpoint = ?1 WHERE id = ?2",
            params![json, scan_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("scan {scan_id}")));
        }
        debug!(
            scan_id,
            org = checkpoint.org_index,
            workspace = checkpoint.workspace_index,
            app = checkpoint.app_index,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Read back the checkpoint for a scan, if one was ever saved.
    pub fn load_checkpoint(&self, scan_id: i64) -> StoreResult<Option<ScanCheckpoint>> {
        let json: Option<Option<String>> = self
            .store
            .conn()
            .query_row(
                "SELECT checkpoint FROM scans WHERE id = ?1",
                [scan_id],
                |row| row.get(0),
            )
            .optional()?;
        match json.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Mark a scan cancelled. Enumerated data is kept for audit; only the
    /// checkpoint is cleared so the scan is never offered for resume.
    pub fn cancel(&self, scan_id: i64) -> StoreResult<()> {
        self.store.conn().execute(
            "UPDATE scans SET cancelled = 1, checkpoint = NULL WHERE id = ?1",
            [scan_id],
        )?;
        info!(scan_id, "Scan marked cancelled");
        Ok(())
    }

    /// Write the completion summary, marking the scan completed.
    pub fn finalize(&self, scan_id: i64, summary: &ScanSummary) -> StoreResult<()> {
        let json = serde_json::to_string(summary)?;
        let updated = self.store.conn().execute(
            "UPDATE scans SET summary = ?1 WHERE id = ?2",
            params![json, scan_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("scan {scan_id}")));
        }
        info!(
            scan_id,
            files = summary.files,
            bytes = summary.backup_size,
            "Scan finalized"
        );
        Ok(())
    }

    /// Drop everything previously recorded for one app in this scan.
    ///
    /// Re-processing an app (after an interruption or a mid-app rate limit)
    /// replays its enumeration from the top; clearing first keeps the
    /// replay from double-counting.
    pub fn reset_app(&self, scan_id: i64, app_id: i64) -> StoreResult<()> {
        let conn = self.store.conn();
        conn.execute(
            "DELETE FROM scan_apps WHERE scan_id = ?1 AND app_id = ?2",
            params![scan_id, app_id],
        )?;
        conn.execute(
            "DELETE FROM scan_items WHERE scan_id = ?1 AND app_id = ?2",
            params![scan_id, app_id],
        )?;
        conn.execute(
            "DELETE FROM scan_files WHERE scan_id = ?1 AND app_id = ?2",
            params![scan_id, app_id],
        )?;
        Ok(())
    }

    /// Record a discovered application.
    pub fn add_app(&self, scan_id: i64, app: &ScanApp) -> StoreResult<()> {
        self.store.conn().execute(
            "INSERT INTO scan_apps (scan_id, org_name, workspace_id, workspace_name, app_id, app_name, folder_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scan_id,
                app.org_name,
                app.workspace_id,
                app.workspace_name,
                app.app_id,
                app.app_name,
                app.folder_path
            ],
        )?;
        Ok(())
    }

    /// Record a discovered item.
    pub fn add_item(&self, scan_id: i64, app_id: i64, item_id: i64) -> StoreResult<()> {
        self.store.conn().execute(
            "INSERT INTO scan_items (scan_id, app_id, item_id) VALUES (?1, ?2, ?3)",
            params![scan_id, app_id, item_id],
        )?;
        Ok(())
    }

    /// Record one discovered file.
    pub fn add_file(&self, scan_id: i64, file: &ScanFile) -> StoreResult<()> {
        self.store.conn().execute(
            "INSERT INTO scan_files (scan_id, app_id, item_id, file_id, name, size, mimetype, download_url, folder_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                scan_id,
                file.app_id,
                file.item_id,
                file.file_id,
                file.name,
                file.size.map(|s| s as i64),
                file.mimetype,
                file.download_url,
                file.folder_path
            ],
        )?;
        Ok(())
    }

    /// Record a batch of discovered files in one transaction.
    pub fn add_files_bulk(&self, scan_id: i64, files: &[ScanFile]) -> StoreResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scan_files (scan_id, app_id, item_id, file_id, name, size, mimetype, download_url, folder_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for file in files {
                stmt.execute(params![
                    scan_id,
                    file.app_id,
                    file.item_id,
                    file.file_id,
                    file.name,
                    file.size.map(|s| s as i64),
                    file.mimetype,
                    file.download_url,
                    file.folder_path
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch one scan by id.
    pub fn get(&self, scan_id: i64) -> StoreResult<Option<ScanRecord>> {
        let record = self
            .store
            .conn()
            .query_row(
                "SELECT id, created_at_ms, user, remote_backup_item_id, title, summary, cancelled, checkpoint
                 FROM scans WHERE id = ?1",
                [scan_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// The most recently created scan, if any.
    pub fn last_scan(&self) -> StoreResult<Option<ScanRecord>> {
        let record = self
            .store
            .conn()
            .query_row(
                "SELECT id, created_at_ms, user, remote_backup_item_id, title, summary, cancelled, checkpoint
                 FROM scans ORDER BY created_at_ms DESC, id DESC LIMIT 1",
                [],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// The newest interrupted scan, if one exists.
    ///
    /// Only one operation may run per instance, so the orchestrator refuses
    /// to begin a fresh scan while this returns a row (unless resuming it).
    pub fn find_resumable(&self) -> StoreResult<Option<ScanRecord>> {
        let record = self
            .store
            .conn()
            .query_row(
                "SELECT id, created_at_ms, user, remote_backup_item_id, title, summary, cancelled, checkpoint
                 FROM scans
                 WHERE summary IS NULL AND (cancelled IS NULL OR cancelled = 0)
                 ORDER BY created_at_ms DESC, id DESC LIMIT 1",
                [],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Applications recorded for a scan.
    pub fn apps(&self, scan_id: i64) -> StoreResult<Vec<ScanApp>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT org_name, workspace_id, workspace_name, app_id, app_name, folder_path
             FROM scan_apps WHERE scan_id = ?1 ORDER BY id ASC",
        )?;
        let apps = stmt
            .query_map([scan_id], |row| {
                Ok(ScanApp {
                    org_name: row.get(0)?,
                    workspace_id: row.get(1)?,
                    workspace_name: row.get(2)?,
                    app_id: row.get(3)?,
                    app_name: row.get(4)?,
                    folder_path: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(apps)
    }

    /// Files recorded for a scan.
    pub fn files(&self, scan_id: i64) -> StoreResult<Vec<ScanFile>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT app_id, item_id, file_id, name, size, mimetype, download_url, folder_path
             FROM scan_files WHERE scan_id = ?1 ORDER BY id ASC",
        )?;
        let files = stmt
            .query_map([scan_id], |row| {
                Ok(ScanFile {
                    app_id: row.get(0)?,
                    item_id: row.get(1)?,
                    file_id: row.get(2)?,
                    name: row.get(3)?,
                    size: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
                    mimetype: row.get(5)?,
                    download_url: row.get(6)?,
                    folder_path: row.get(7)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(files)
    }

    /// Distinct items recorded for a scan.
    pub fn items_count(&self, scan_id: i64) -> StoreResult<u64> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(DISTINCT item_id) FROM scan_items WHERE scan_id = ?1",
            [scan_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
        let summary_json: Option<String> = row.get(5)?;
        let checkpoint_json: Option<String> = row.get(7)?;
        Ok(ScanRecord {
            id: row.get(0)?,
            created_at_ms: row.get(1)?,
            user: row.get(2)?,
            remote_backup_item_id: row.get(3)?,
            title: row.get(4)?,
            summary: summary_json.and_then(|j| serde_json::from_str(&j).ok()),
            cancelled: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
            checkpoint: checkpoint_json.and_then(|j| serde_json::from_str(&j).ok()),
        })
    }
}

//! Backup orchestration: scan and download flows.
//!
//! The orchestrator owns one operation at a time. Scanning walks the remote
//! hierarchy sequentially and persists a checkpoint after every application,
//! so an interruption costs at most one application's worth of rework.
//! Backing up drains the download ledger with a bounded worker pool. Both
//! flows stop at unit boundaries for pause, cancel, and rate-limit
//! suspension, and both report progress through the event log rather than
//! callbacks.

mod worker;

use crate::client::{ClientError, RemoteClient, ResetHint, RetryHint, ITEM_PAGE_SIZE};
use crate::control::ControlSignals;
use crate::download::{DownloadLedger, DownloadStats};
use crate::events::EventLog;
use crate::ledger::RateCategory;
use crate::rate_limit::{RateLimitStatus, RateLimitTracker};
use crate::scan::{ScanCheckpoint, ScanFile, ScanJournal, ScanMeta, ScanRecord, ScanSummary};
use crate::session::BackupSession;
use crate::store::{now_ms, BackupStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Hold-off before retrying when the server is still throttling but the
/// computed reset has already passed.
pub(crate) const STALE_TRIP_BACKOFF: Duration = Duration::from_secs(30);

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote API failure that retries cannot absorb
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A non-terminal scan already exists; resume or cancel it first
    #[error("scan {scan_id} is still open; resume it or cancel it first")]
    ScanInProgress {
        /// The open scan
        scan_id: i64,
    },

    /// Resume was requested but no interrupted scan exists
    #[error("no interrupted scan to resume")]
    NoResumableScan,

    /// The referenced scan does not exist
    #[error("scan {0} not found")]
    ScanNotFound(i64),

    /// The operation was cancelled mid-unit
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Coarse lifecycle of the engine, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// No operation running.
    Idle,
    /// Enumerating the remote hierarchy.
    Scanning,
    /// Draining the download queue.
    BackingUp,
    /// Suspended waiting for a rate-limit reset.
    Suspended,
    /// Scan finished and was finalized.
    ScanComplete,
    /// Every queued download reached a terminal state.
    BackupComplete,
    /// The operator cancelled the operation.
    Cancelled,
}

/// Outcome of a scan run.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// The scan that ran.
    pub scan_id: i64,
    /// Completion summary; absent when the scan was cancelled.
    pub summary: Option<ScanSummary>,
    /// Whether the operator cancelled mid-scan.
    pub cancelled: bool,
}

/// Outcome of a backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    /// The scan whose queue was drained.
    pub scan_id: i64,
    /// Final queue counters.
    pub stats: DownloadStats,
    /// One line per file that exhausted its retry budget.
    pub warnings: Vec<String>,
    /// Whether the operator cancelled mid-backup.
    pub cancelled: bool,
}

/// Combined pull-based view of one scan for the presentation layer.
#[derive(Debug, Clone)]
pub struct ScanStatus {
    /// The scan row.
    pub scan: ScanRecord,
    /// Download queue counters for the scan.
    pub downloads: DownloadStats,
}

/// Drives scans and backups against a [`RemoteClient`].
pub struct BackupOrchestrator {
    session: BackupSession,
    client: Arc<dyn RemoteClient>,
    journal: ScanJournal,
    downloads: DownloadLedger,
    tracker: RateLimitTracker,
    signals: ControlSignals,
    events: EventLog,
    state_tx: watch::Sender<OrchestratorState>,
}

impl BackupOrchestrator {
    /// Create an orchestrator over the shared store and a client.
    pub fn new(
        session: BackupSession,
        client: Arc<dyn RemoteClient>,
        store: Arc<BackupStore>,
    ) -> Self {
        let tracker = RateLimitTracker::new(Arc::clone(&store), session.rate_limits);
        let (state_tx, _) = watch::channel(OrchestratorState::Idle);
        Self {
            session,
            client,
            journal: ScanJournal::new(Arc::clone(&store)),
            downloads: DownloadLedger::new(store),
            tracker,
            signals: ControlSignals::new(),
            events: EventLog::new(),
            state_tx,
        }
    }

    /// Signals steering this orchestrator's current operation.
    pub fn signals(&self) -> ControlSignals {
        self.signals.clone()
    }

    /// Progress event log.
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    /// Observe coarse state transitions.
    pub fn state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    /// Budget snapshots for both categories.
    pub fn rate_limit_status(&self) -> OrchestratorResult<Vec<RateLimitStatus>> {
        Ok(vec![
            self.tracker.status(RateCategory::Standard)?,
            self.tracker.status(RateCategory::Restricted)?,
        ])
    }

    /// The rate-limit tracker, for operator commands (`rate-limit clear`).
    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    /// The scan journal, for status queries outside a running operation.
    pub fn journal(&self) -> &ScanJournal {
        &self.journal
    }

    /// Pull-based status for one scan.
    pub fn scan_status(&self, scan_id: i64) -> OrchestratorResult<ScanStatus> {
        let scan = self
            .journal
            .get(scan_id)?
            .ok_or(OrchestratorError::ScanNotFound(scan_id))?;
        let downloads = self.downloads.stats(scan_id)?;
        Ok(ScanStatus { scan, downloads })
    }

    /// Run a scan to completion, resumption, cancellation, or error.
    ///
    /// With `resume` set, picks up the newest interrupted scan at its last
    /// checkpoint (clamped if the hierarchy shrank). Otherwise refuses to
    /// start while an interrupted scan exists.
    pub async fn scan(&self, resume: bool) -> OrchestratorResult<ScanOutcome> {
        let (scan_id, mut cp) = if resume {
            let record = self
                .journal
                .find_resumable()?
                .ok_or(OrchestratorError::NoResumableScan)?;
            let cp = record.checkpoint.clone().unwrap_or_default();
            self.events.info(format!(
                "Resuming scan {} at org {}/{} app {}/{}",
                record.id, cp.org_index, cp.org_total, cp.app_index, cp.app_total
            ));
            (record.id, cp)
        } else {
            if let Some(open) = self.journal.find_resumable()? {
                return Err(OrchestratorError::ScanInProgress { scan_id: open.id });
            }
            let meta = ScanMeta {
                user: self.session.user.clone(),
                remote_backup_item_id: None,
                title: Some(format!(
                    "Backup {}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M")
                )),
            };
            (self.journal.begin(&meta)?, ScanCheckpoint::default())
        };

        self.set_state(OrchestratorState::Scanning);
        match self.run_scan(scan_id, &mut cp).await {
            Ok(summary) => {
                self.set_state(OrchestratorState::ScanComplete);
                Ok(ScanOutcome {
                    scan_id,
                    summary: Some(summary),
                    cancelled: false,
                })
            }
            Err(OrchestratorError::Cancelled) => {
                self.journal.cancel(scan_id)?;
                self.events.info(format!("Scan {scan_id} cancelled"));
                self.set_state(OrchestratorState::Cancelled);
                Ok(ScanOutcome {
                    scan_id,
                    summary: None,
                    cancelled: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_scan(&self, scan_id: i64, cp: &mut ScanCheckpoint) -> OrchestratorResult<ScanSummary> {
        let orgs = self.fetch(|| self.client.organizations()).await?;
        cp.clamp_to(
            orgs.len() as u32,
            cp.workspace_total,
            cp.app_total,
        );

        while (cp.org_index as usize) < orgs.len() {
            let org = &orgs[cp.org_index as usize];
            self.events
                .info(format!("Scanning organization {}", org.name));

            let workspaces = self.fetch(|| self.client.workspaces(org.org_id)).await?;
            cp.workspace_total = workspaces.len() as u32;
            cp.workspaces_counted = true;
            cp.workspace_index = cp.workspace_index.min(cp.workspace_total);

            while cp.workspace_index < cp.workspace_total {
                let workspace = &workspaces[cp.workspace_index as usize];

                let apps = self.fetch(|| self.client.apps(workspace.space_id)).await?;
                cp.app_total = apps.len() as u32;
                cp.apps_counted = true;
                cp.app_index = cp.app_index.min(cp.app_total);

                while cp.app_index < cp.app_total {
                    let app = &apps[cp.app_index as usize];
                    let folder_path = format!(
                        "{}/{}/{}",
                        sanitize_component(&org.name),
                        sanitize_component(&workspace.name),
                        sanitize_component(&app.name)
                    );

                    loop {
                        if !self.gate(RateCategory::Standard).await? {
                            return Err(OrchestratorError::Cancelled);
                        }
                        match self
                            .process_app(scan_id, org, workspace, app, &folder_path)
                            .await
                        {
                            Ok(()) => break,
                            Err(OrchestratorError::Client(ClientError::RateLimited {
                                category,
                                hint,
                            })) => {
                                self.suspend_on_trip(category, hint).await?;
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    cp.app_index += 1;
                    self.checkpoint(scan_id, cp);
                }

                cp.workspace_index += 1;
                cp.app_index = 0;
                cp.apps_counted = false;
                self.checkpoint(scan_id, cp);
            }

            cp.org_index += 1;
            cp.workspace_index = 0;
            cp.workspaces_counted = false;
            self.checkpoint(scan_id, cp);
        }

        let summary = self.build_summary(scan_id, orgs.len() as u64)?;
        self.journal.finalize(scan_id, &summary)?;
        self.events.info(format!(
            "Scan {scan_id} complete: {} files, {} bytes",
            summary.files, summary.backup_size
        ));
        Ok(summary)
    }

    /// Enumerate one application: its item count, every item page with
    /// attachments, and files attached directly to the app.
    ///
    /// Idempotent: previously recorded rows for this app are dropped first,
    /// so replaying after an interruption or mid-app rate limit cannot
    /// double-count.
    async fn process_app(
        &self,
        scan_id: i64,
        org: &crate::client::Organization,
        workspace: &crate::client::Workspace,
        app: &crate::client::App,
        folder_path: &str,
    ) -> OrchestratorResult<()> {
        self.journal.reset_app(scan_id, app.app_id)?;
        self.journal.add_app(
            scan_id,
            &crate::scan::ScanApp {
                org_name: org.name.clone(),
                workspace_id: workspace.space_id,
                workspace_name: workspace.name.clone(),
                app_id: app.app_id,
                app_name: app.name.clone(),
                folder_path: folder_path.to_string(),
            },
        )?;

        let count = self.client.item_count(app.app_id).await?;
        let mut offset = 0u64;
        while offset < count {
            if !self.signals.wait_if_paused().await {
                return Err(OrchestratorError::Cancelled);
            }
            let items = self.client.items(app.app_id, offset, ITEM_PAGE_SIZE).await?;
            if items.is_empty() {
                break;
            }
            offset += items.len() as u64;
            for item in &items {
                self.journal.add_item(scan_id, app.app_id, item.item_id)?;
                let files: Vec<ScanFile> = item
                    .files
                    .iter()
                    .map(|f| scan_file_from_remote(f, app.app_id, Some(item.item_id), folder_path))
                    .collect();
                self.journal.add_files_bulk(scan_id, &files)?;
            }
        }

        let app_files = self.client.app_files(app.app_id).await?;
        let files: Vec<ScanFile> = app_files
            .iter()
            .map(|f| scan_file_from_remote(f, app.app_id, None, folder_path))
            .collect();
        self.journal.add_files_bulk(scan_id, &files)?;

        info!(
            scan_id,
            app_id = app.app_id,
            app = %app.name,
            files = files.len(),
            "Application scanned"
        );
        Ok(())
    }

    /// Drain the download queue for a scan with a bounded worker pool.
    pub async fn backup(&self, scan_id: i64) -> OrchestratorResult<BackupReport> {
        let scan = self
            .journal
            .get(scan_id)?
            .ok_or(OrchestratorError::ScanNotFound(scan_id))?;
        self.set_state(OrchestratorState::BackingUp);
        self.events
            .info(format!("Backing up scan {} ({:?})", scan.id, scan.title));

        // Enqueue everything the scan found; rows already done stay done.
        let files = self.journal.files(scan_id)?;
        let mut urls: HashMap<i64, String> = HashMap::with_capacity(files.len());
        let mut seen_paths: HashSet<String> = HashSet::with_capacity(files.len());
        for file in &files {
            let name = sanitize_component(&file.name);
            let mut path = format!("{}/{}", file.folder_path, name);
            if !seen_paths.insert(path.clone()) {
                // Same name twice in one folder; keep both.
                path = format!("{}/{}_{}", file.folder_path, file.file_id, name);
                seen_paths.insert(path.clone());
            }
            self.downloads.enqueue(
                scan_id,
                file.file_id,
                file.app_id,
                file.item_id,
                &path,
                file.size,
            )?;
            urls.insert(file.file_id, file.download_url.clone());
        }
        let urls = Arc::new(urls);

        // Failures from a previous run get their remaining tries back first.
        self.downloads
            .requeue_errors(scan_id, self.session.max_tries)?;

        let mut cancelled = false;
        loop {
            if self.signals.is_cancelled() {
                cancelled = true;
                break;
            }
            let pending = self.downloads.pending(scan_id)?;
            if pending.is_empty() {
                if self
                    .downloads
                    .requeue_errors(scan_id, self.session.max_tries)?
                    == 0
                {
                    break;
                }
                continue;
            }
            worker::run_pool(self.worker_context(scan_id, Arc::clone(&urls)), pending).await;
        }

        let stats = self.downloads.stats(scan_id)?;
        let warnings: Vec<String> = self
            .downloads
            .permanently_failed(scan_id, self.session.max_tries)?
            .iter()
            .map(|r| {
                format!(
                    "{} failed after {} attempts",
                    r.path, r.tries
                )
            })
            .collect();
        for warning in &warnings {
            self.events.warn(warning.clone());
        }

        if cancelled {
            self.set_state(OrchestratorState::Cancelled);
            self.events.info(format!("Backup of scan {scan_id} cancelled"));
        } else {
            self.set_state(OrchestratorState::BackupComplete);
            self.events.info(format!(
                "Backup of scan {scan_id} finished: {}/{} files",
                stats.done, stats.total
            ));
        }
        Ok(BackupReport {
            scan_id,
            stats,
            warnings,
            cancelled,
        })
    }

    fn worker_context(&self, scan_id: i64, urls: Arc<HashMap<i64, String>>) -> worker::WorkerContext {
        worker::WorkerContext {
            scan_id,
            client: Arc::clone(&self.client),
            downloads: self.downloads.clone(),
            tracker: self.tracker.clone(),
            signals: self.signals.clone(),
            events: self.events.clone(),
            backup_dir: self.session.backup_dir.clone(),
            urls,
            concurrency: self.session.concurrency,
        }
    }

    /// Retry wrapper for enumeration calls: waits out pauses and active
    /// cooldowns, arms the tracker when the server rejects the call, and
    /// surfaces cancellation as [`OrchestratorError::Cancelled`].
    async fn fetch<T, Fut>(&self, call: impl Fn() -> Fut) -> OrchestratorResult<T>
    where
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        loop {
            if !self.gate(RateCategory::Standard).await? {
                return Err(OrchestratorError::Cancelled);
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(ClientError::RateLimited { category, hint }) => {
                    self.suspend_on_trip(category, hint).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait until the category has budget, honoring pause and cancel.
    /// Returns `false` when cancelled.
    async fn gate(&self, category: RateCategory) -> OrchestratorResult<bool> {
        let was_suspended = self.tracker.is_active(category)?;
        if was_suspended {
            self.set_state(OrchestratorState::Suspended);
        }
        let keep_going =
            rate_limit_gate(&self.tracker, &self.signals, &self.events, category).await?;
        if was_suspended && keep_going {
            self.set_state(OrchestratorState::Scanning);
        }
        Ok(keep_going)
    }

    /// Arm the tracker from a server rejection, then wait a moment if the
    /// trip was discarded (stale window) so a still-limiting server is not
    /// hammered in a tight loop.
    async fn suspend_on_trip(
        &self,
        category: RateCategory,
        hint: Option<RetryHint>,
    ) -> OrchestratorResult<()> {
        if !arm_trip(&self.tracker, &self.events, category, hint)? {
            tokio::select! {
                _ = tokio::time::sleep(STALE_TRIP_BACKOFF) => {}
                _ = self.signals.cancelled() => return Err(OrchestratorError::Cancelled),
            }
        }
        Ok(())
    }

    fn checkpoint(&self, scan_id: i64, cp: &ScanCheckpoint) {
        // Losing a checkpoint write costs one redone unit, not the scan.
        if let Err(e) = self.journal.save_checkpoint(scan_id, cp) {
            warn!(scan_id, error = %e, "Failed to save scan checkpoint");
        }
    }

    fn build_summary(&self, scan_id: i64, organizations: u64) -> OrchestratorResult<ScanSummary> {
        let apps = self.journal.apps(scan_id)?;
        let workspaces: HashSet<i64> = apps.iter().map(|a| a.workspace_id).collect();
        let files = self.journal.files(scan_id)?;
        Ok(ScanSummary {
            organizations,
            workspaces: workspaces.len() as u64,
            applications: apps.len() as u64,
            items: self.journal.items_count(scan_id)?,
            files: files.len() as u64,
            backup_size: files.iter().filter_map(|f| f.size).sum(),
        })
    }

    fn set_state(&self, state: OrchestratorState) {
        // send() drops the value while nobody subscribes; send_replace keeps
        // the latest state visible to late subscribers.
        self.state_tx.send_replace(state);
    }
}

/// Park until `category` has budget again. Returns `false` on cancel.
pub(crate) async fn rate_limit_gate(
    tracker: &RateLimitTracker,
    signals: &ControlSignals,
    events: &EventLog,
    category: RateCategory,
) -> OrchestratorResult<bool> {
    loop {
        if !signals.wait_if_paused().await {
            return Ok(false);
        }
        let Some(state) = tracker.active_state(category)? else {
            return Ok(true);
        };
        // Sleep slightly past the reset so the follow-up check passes.
        let wait_ms = (state.reset_at_ms - now_ms()).max(0) + 1_000;
        events.warn(format!(
            "{category} budget exhausted; suspending for {}s",
            wait_ms / 1_000
        ));
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => {}
            _ = signals.cancelled() => return Ok(false),
        }
    }
}

/// Arm the tracker from a server rejection, preferring the server's own
/// cooldown timing and budget counters over the derived sliding window.
pub(crate) fn arm_trip(
    tracker: &RateLimitTracker,
    events: &EventLog,
    category: RateCategory,
    hint: Option<RetryHint>,
) -> OrchestratorResult<bool> {
    let status = tracker.status(category)?;
    let hint = hint.unwrap_or_default();
    let limit = hint.limit.unwrap_or(status.limit);
    let used = match (hint.limit, hint.remaining) {
        (Some(limit), Some(remaining)) => limit.saturating_sub(remaining),
        _ => status.used,
    };
    let armed = match hint.reset {
        Some(ResetHint::Seconds(seconds)) => {
            // Clamp so an absurd hint cannot overflow the reset arithmetic.
            let delay_ms = (seconds.min(i64::MAX as u64 / 1_000) as i64) * 1_000;
            tracker.trip_until(category, now_ms().saturating_add(delay_ms), used, limit)?
        }
        Some(ResetHint::EpochMs(at_ms)) => tracker.trip_until(category, at_ms, used, limit)?,
        None => tracker.trip(category, now_ms(), used, limit)?,
    };
    if armed {
        events.warn(format!("{category} rate limit tripped by server"));
    }
    Ok(armed)
}

fn scan_file_from_remote(
    file: &crate::client::RemoteFile,
    app_id: i64,
    item_id: Option<i64>,
    folder_path: &str,
) -> ScanFile {
    ScanFile {
        app_id,
        item_id,
        file_id: file.file_id,
        name: file.name.clone(),
        size: file.size,
        mimetype: file.mimetype.clone(),
        download_url: file.link.clone(),
        folder_path: folder_path.to_string(),
    }
}

/// Make a remote display name safe as a single path component.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

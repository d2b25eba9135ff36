//! Scan and backup command implementations

use super::{Cli, CliError};
use crate::cache::ResponseCache;
use crate::client::HttpRemoteClient;
use crate::control::ControlSignals;
use crate::download::DownloadLedger;
use crate::ledger::RequestLedger;
use crate::orchestrator::BackupOrchestrator;
use crate::store::BackupStore;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Scan command arguments
#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Resume the newest interrupted scan instead of starting fresh
    #[arg(long, default_value_t = false)]
    pub resume: bool,
}

impl ScanArgs {
    /// Run a scan to completion or cancellation.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = Arc::new(BackupStore::open(&cli.db)?);
        let session = cli.session();
        let client = Arc::new(
            HttpRemoteClient::new(
                session.base_url.clone(),
                session.token.clone(),
                RequestLedger::new(Arc::clone(&store)),
            )
            .with_cache(ResponseCache::new(Arc::clone(&store)), session.cache_ttl),
        );
        let orchestrator = BackupOrchestrator::new(session, client, store);
        wire_ctrl_c(orchestrator.signals());

        let outcome = orchestrator.scan(self.resume).await?;
        if outcome.cancelled {
            warn!(scan_id = outcome.scan_id, "Scan cancelled");
        } else if let Some(summary) = outcome.summary {
            info!(
                scan_id = outcome.scan_id,
                organizations = summary.organizations,
                workspaces = summary.workspaces,
                applications = summary.applications,
                items = summary.items,
                files = summary.files,
                bytes = summary.backup_size,
                "Scan complete"
            );
            println!(
                "Scan {} complete: {} files ({} bytes) across {} applications",
                outcome.scan_id, summary.files, summary.backup_size, summary.applications
            );
        }
        Ok(())
    }
}

/// Backup command arguments
#[derive(Parser, Debug)]
pub struct BackupArgs {
    /// Scan whose queue to drain; defaults to the most recent scan
    #[arg(long)]
    pub scan_id: Option<i64>,
}

impl BackupArgs {
    /// Drain the download queue for a scan.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = Arc::new(BackupStore::open(&cli.db)?);
        let session = cli.session();
        let client = Arc::new(HttpRemoteClient::new(
            session.base_url.clone(),
            session.token.clone(),
            RequestLedger::new(Arc::clone(&store)),
        ));
        let orchestrator = BackupOrchestrator::new(session, client, Arc::clone(&store));
        wire_ctrl_c(orchestrator.signals());

        let scan_id = match self.scan_id {
            Some(id) => id,
            None => orchestrator
                .journal()
                .last_scan()?
                .ok_or_else(|| {
                    CliError::InvalidArgument("no scan found; run `scan` first".to_string())
                })?
                .id,
        };

        let progress = tokio::spawn(progress_task(DownloadLedger::new(store), scan_id));
        let report = orchestrator.backup(scan_id).await;
        progress.abort();
        let report = report?;

        for warning in &report.warnings {
            warn!(scan_id, "{warning}");
        }
        if report.cancelled {
            warn!(scan_id, "Backup cancelled");
        }
        println!(
            "Backup of scan {}: {}/{} files downloaded, {} failed",
            report.scan_id,
            report.stats.done,
            report.stats.total,
            report.stats.error
        );
        Ok(())
    }
}

/// Cancel the running operation on Ctrl+C; progress is already on disk.
pub(crate) fn wire_ctrl_c(signals: ControlSignals) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received - stopping at the next file boundary...");
            signals.cancel();
        }
    });
}

/// Redraw a progress bar from the download ledger twice a second.
async fn progress_task(downloads: DownloadLedger, scan_id: i64) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} files {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    loop {
        if let Ok(stats) = downloads.stats(scan_id) {
            bar.set_length(stats.total);
            bar.set_position(stats.done);
            if stats.error > 0 {
                bar.set_message(format!("({} failed)", stats.error));
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

//! Status and rate-limit inspection commands
//!
//! These read the shared database directly, so they work while another
//! process is mid-scan; the store's self-cleaning reads keep what they
//! report current.

use super::{Cli, CliError};
use crate::download::DownloadLedger;
use crate::ledger::RateCategory;
use crate::rate_limit::RateLimitTracker;
use crate::scan::{ScanJournal, ScanRecord};
use crate::store::BackupStore;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// Status command arguments
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Scan to report on; defaults to the most recent scan
    #[arg(long)]
    pub scan_id: Option<i64>,
}

impl StatusArgs {
    /// Print scan and download progress.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = Arc::new(BackupStore::open(&cli.db)?);
        let journal = ScanJournal::new(Arc::clone(&store));
        let downloads = DownloadLedger::new(store);

        let scan = match self.scan_id {
            Some(id) => journal.get(id)?,
            None => journal.last_scan()?,
        };
        let Some(scan) = scan else {
            println!("No scans recorded yet.");
            return Ok(());
        };

        print_scan(&scan);
        let stats = downloads.stats(scan.id)?;
        if stats.total > 0 {
            println!(
                "Downloads: {}/{} done, {} pending, {} failed",
                stats.done, stats.total, stats.pending, stats.error
            );
        }
        if downloads.has_incomplete_backup()? {
            println!("A recent backup has unfinished downloads; run `backup` to continue.");
        }
        Ok(())
    }
}

fn print_scan(scan: &ScanRecord) {
    let started = Utc
        .timestamp_millis_opt(scan.created_at_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| scan.created_at_ms.to_string());
    println!(
        "Scan {} ({}) started {started}",
        scan.id,
        scan.title.as_deref().unwrap_or("untitled")
    );

    if let Some(summary) = &scan.summary {
        println!(
            "  Completed: {} orgs, {} workspaces, {} apps, {} items, {} files ({} bytes)",
            summary.organizations,
            summary.workspaces,
            summary.applications,
            summary.items,
            summary.files,
            summary.backup_size
        );
    } else if scan.cancelled {
        println!("  Cancelled");
    } else if let Some(cp) = &scan.checkpoint {
        println!(
            "  Interrupted at org {}/{}, workspace {}/{}, app {}/{}; resumable with `scan --resume`",
            cp.org_index,
            cp.org_total,
            cp.workspace_index,
            cp.workspace_total,
            cp.app_index,
            cp.app_total
        );
    } else {
        println!("  In progress (no checkpoint yet)");
    }
}

/// Rate-limit command arguments
#[derive(Parser, Debug)]
pub struct RateLimitArgs {
    /// Action to perform
    #[command(subcommand)]
    pub action: RateLimitAction,
}

/// Rate-limit subcommands
#[derive(Subcommand, Debug)]
pub enum RateLimitAction {
    /// Show budget usage and any active cooldown
    Show,
    /// Clear persisted cooldown state and force the next request through
    Clear {
        /// Category to clear; both when omitted
        #[arg(long)]
        category: Option<RateCategory>,
    },
}

impl RateLimitArgs {
    /// Inspect or clear rate-limit state.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = Arc::new(BackupStore::open(&cli.db)?);
        let tracker = RateLimitTracker::new(store, cli.session().rate_limits);

        match &self.action {
            RateLimitAction::Show => {
                for category in [RateCategory::Standard, RateCategory::Restricted] {
                    let status = tracker.status(category)?;
                    let cooldown = if status.tripped {
                        format!(
                            " [TRIPPED, resets in {}s]",
                            status.reset_in_seconds.unwrap_or(0)
                        )
                    } else {
                        String::new()
                    };
                    println!(
                        "{category}: {}/{} this hour, {}/{} today{cooldown}",
                        status.used, status.limit, status.daily_used, status.daily_limit
                    );
                }
            }
            RateLimitAction::Clear { category } => {
                let categories = match category {
                    Some(c) => vec![*c],
                    None => vec![RateCategory::Standard, RateCategory::Restricted],
                };
                for category in categories {
                    tracker.clear(category)?;
                    println!("Cleared {category} rate-limit state");
                }
            }
        }
        Ok(())
    }
}

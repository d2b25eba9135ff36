//! CLI command implementations

pub mod error;
pub mod run;
pub mod status;

pub use error::CliError;

use crate::rate_limit::RateLimitConfig;
use crate::session::BackupSession;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Upper bound on concurrent downloads to avoid self-inflicted throttling.
const MAX_CONCURRENCY: usize = 32;

/// Parse and validate a concurrency value.
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Workspace backup CLI
#[derive(Parser, Debug)]
#[command(name = "workspace-backup")]
#[command(about = "Scan and back up a remote workspace hierarchy", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the checkpoint database
    #[arg(long, global = true, env = "WORKSPACE_BACKUP_DB", default_value = "workspace-backup.db")]
    pub db: PathBuf,

    /// API base URL
    #[arg(long, global = true, env = "WORKSPACE_API_URL", default_value = "https://api.example.com")]
    pub base_url: String,

    /// Bearer token for the remote service
    #[arg(long, global = true, env = "WORKSPACE_API_TOKEN", default_value = "")]
    pub token: String,

    /// Directory downloads are written under
    #[arg(long, global = true, env = "WORKSPACE_BACKUP_DIR", default_value = "backup")]
    pub backup_dir: PathBuf,

    /// Operator account name recorded on scans
    #[arg(long, global = true, env = "WORKSPACE_BACKUP_USER")]
    pub user: Option<String>,

    /// Number of concurrent downloads (max: 32)
    #[arg(long, global = true, default_value = "4", value_parser = parse_concurrency)]
    pub concurrency: usize,

    /// Attempts per file before it is reported as permanently failed
    #[arg(long, global = true, default_value = "3", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_tries: u32,

    /// Hourly request budget per category
    #[arg(long, global = true, default_value = "5000")]
    pub hourly_limit: u64,

    /// Daily request budget per category
    #[arg(long, global = true, default_value = "60000")]
    pub daily_limit: u64,
}

impl Cli {
    /// Resolve the per-operation session from the parsed arguments.
    /// Nothing below this layer reads the environment.
    pub fn session(&self) -> BackupSession {
        let mut session = BackupSession::new(
            self.base_url.clone(),
            self.token.clone(),
            self.backup_dir.clone(),
        )
        .with_concurrency(self.concurrency)
        .with_max_tries(self.max_tries)
        .with_rate_limits(RateLimitConfig {
            hourly_limit: self.hourly_limit,
            daily_limit: self.daily_limit,
        });
        if let Some(user) = &self.user {
            session = session.with_user(user.clone());
        }
        session
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the remote hierarchy and record what a backup would fetch
    Scan(run::ScanArgs),

    /// Download everything a scan found
    Backup(run::BackupArgs),

    /// Show scan and download progress
    Status(status::StatusArgs),

    /// Inspect or clear rate-limit state
    RateLimit(status::RateLimitArgs),
}

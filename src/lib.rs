//! # Workspace Backup Library
//!
//! A resumable backup engine for hierarchical remote workspaces
//! (organizations, workspaces, applications, items, files). Built around an
//! embedded SQLite checkpoint database so that any interruption, whether a
//! crash, a Ctrl+C, or an API rate limit, loses at most one unit of work.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting**: local mirror of the service's hourly
//!   and daily budgets per request category, with reset prediction anchored
//!   to the earliest in-window request
//! - **Resumable scans**: hierarchical checkpoints persisted after every
//!   application, clamped automatically if the remote hierarchy shrank
//! - **Idempotent download ledger**: one row per file per scan, sticky
//!   completion, bounded retries with permanent-failure reporting
//! - **Response caching**: short-TTL read-through cache to avoid spending
//!   request budget on unchanged data
//! - **Cooperative control**: pause, resume, and cancel at unit boundaries,
//!   with a replayable progress event stream
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use workspace_backup::client::HttpRemoteClient;
//! use workspace_backup::ledger::RequestLedger;
//! use workspace_backup::orchestrator::BackupOrchestrator;
//! use workspace_backup::session::BackupSession;
//! use workspace_backup::store::BackupStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(BackupStore::open("workspace-backup.db")?);
//! let session = BackupSession::new("https://api.example.com", "token", "./backup");
//! let client = Arc::new(HttpRemoteClient::new(
//!     session.base_url.clone(),
//!     session.token.clone(),
//!     RequestLedger::new(Arc::clone(&store)),
//! ));
//!
//! let orchestrator = BackupOrchestrator::new(session, client, store);
//! let outcome = orchestrator.scan(false).await?;
//! orchestrator.backup(outcome.scan_id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`] - embedded SQLite store, schema, and migrations
//! - [`ledger`] - append-only request ledger feeding the rate-limit windows
//! - [`rate_limit`] - sliding-window tracking and cooldown prediction
//! - [`cache`] - short-TTL API response cache
//! - [`scan`] - scan lifecycle, checkpoints, and enumeration records
//! - [`download`] - per-file download ledger with retry accounting
//! - [`client`] - the [`client::RemoteClient`] seam and its HTTP implementation
//! - [`orchestrator`] - scan and backup flows with a bounded worker pool
//! - [`control`] / [`events`] - cooperative signalling and progress events

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Short-TTL API response cache
pub mod cache;

/// CLI command implementations
pub mod cli;

/// Remote workspace API client
pub mod client;

/// Cooperative pause and cancel signalling
pub mod control;

/// Per-file download ledger
pub mod download;

/// Replayable progress event stream
pub mod events;

/// Append-only request ledger
pub mod ledger;

/// Scan and backup orchestration
pub mod orchestrator;

/// Sliding-window rate-limit tracking
pub mod rate_limit;

/// Scan lifecycle and checkpointing
pub mod scan;

/// Per-operation settings
pub mod session;

/// Embedded SQLite store
pub mod store;

// Re-export the types most callers need.
pub use client::{ClientError, RemoteClient};
pub use control::ControlSignals;
pub use events::{Event, EventLevel, EventLog};
pub use ledger::RateCategory;
pub use orchestrator::{BackupOrchestrator, BackupReport, OrchestratorError, ScanOutcome};
pub use rate_limit::{RateLimitConfig, RateLimitStatus};
pub use scan::{ScanCheckpoint, ScanSummary};
pub use session::BackupSession;
pub use store::{BackupStore, StoreError};

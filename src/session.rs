//! Resolved per-operation settings.
//!
//! A session is built once at the outer edge (CLI argument parsing) and then
//! passed by value into the engine; nothing below this layer reads the
//! environment or global state.

use crate::download::DEFAULT_MAX_TRIES;
use crate::rate_limit::RateLimitConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Concurrent download workers by default.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Everything one scan or backup run needs to know.
#[derive(Debug, Clone)]
pub struct BackupSession {
    /// API base URL.
    pub base_url: String,
    /// Bearer token for the remote service.
    pub token: String,
    /// Operator account name recorded on scans, if known.
    pub user: Option<String>,
    /// Root directory downloads are written under.
    pub backup_dir: PathBuf,
    /// Concurrent download workers.
    pub concurrency: usize,
    /// Attempts per file before it is reported as permanently failed.
    pub max_tries: u32,
    /// Budget configuration for the rate-limit tracker.
    pub rate_limits: RateLimitConfig,
    /// Lifetime of cached API responses.
    pub cache_ttl: Duration,
}

impl BackupSession {
    /// Create a session with defaults for everything but the identity fields.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            user: None,
            backup_dir: backup_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            max_tries: DEFAULT_MAX_TRIES,
            rate_limits: RateLimitConfig::default(),
            cache_ttl: crate::cache::DEFAULT_TTL,
        }
    }

    /// Set the operator account name.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the worker count. Clamped to at least one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-file retry budget. Clamped to at least one attempt.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Set the rate-limit budgets.
    pub fn with_rate_limits(mut self, config: RateLimitConfig) -> Self {
        self.rate_limits = config;
        self
    }
}

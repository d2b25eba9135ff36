//! Append-only ledger of outbound API calls.
//!
//! Every request the client issues is recorded here; the rate-limit tracker
//! derives its sliding-window counts from these rows. Recording must never
//! fail the operation it is measuring, so write errors are logged and
//! swallowed.

use crate::store::{now_ms, BackupStore, StoreResult};
use rusqlite::params;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Classification of an API call against the remote service's budgets.
///
/// Which endpoints land in `Restricted` is decided by the client's
/// configuration; the ledger and tracker only care that the two categories
/// are accounted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateCategory {
    /// General API calls (enumeration, metadata).
    Standard,
    /// Calls the remote service throttles separately (file downloads, token grants).
    Restricted,
}

impl RateCategory {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Standard => "standard",
            RateCategory::Restricted => "restricted",
        }
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(RateCategory::Standard),
            "restricted" => Ok(RateCategory::Restricted),
            _ => Err(format!("Invalid rate category: {s}")),
        }
    }
}

/// One outbound API call. Immutable once written.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// When the call was issued (Unix ms).
    pub ts_ms: i64,
    /// HTTP method.
    pub method: String,
    /// Endpoint path.
    pub endpoint: String,
    /// Budget category.
    pub category: RateCategory,
    /// Response status code, if a response arrived.
    pub status: Option<u16>,
    /// Response body size in bytes, when known.
    pub bytes: Option<u64>,
}

/// Append-only request ledger backed by the store.
#[derive(Clone)]
pub struct RequestLedger {
    store: Arc<BackupStore>,
}

impl RequestLedger {
    /// Create a ledger over the shared store.
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self { store }
    }

    /// Record one outbound call. Side-effect only; a storage hiccup must not
    /// abort the request being measured, so failures are logged and dropped.
    pub fn record(
        &self,
        category: RateCategory,
        method: &str,
        endpoint: &str,
        status: Option<u16>,
        bytes: Option<u64>,
    ) {
        self.record_at(category, method, endpoint, status, bytes, now_ms());
    }

    /// `record` with an explicit timestamp.
    pub fn record_at(
        &self,
        category: RateCategory,
        method: &str,
        endpoint: &str,
        status: Option<u16>,
        bytes: Option<u64>,
        ts_ms: i64,
    ) {
        let result = self.store.conn().execute(
            "INSERT INTO requests (ts_ms, method, endpoint, category, status, bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ts_ms,
                method,
                endpoint,
                category.as_str(),
                status,
                bytes.map(|b| b as i64)
            ],
        );
        if let Err(e) = result {
            warn!(error = %e, endpoint, "Failed to record API request");
        }
    }

    /// Count records for a category at or after `since_ms`.
    ///
    /// Also prunes rows older than the longest tracked window; correctness
    /// depends only on in-window counts, so the side effect is safe.
    pub fn count_since(&self, category: RateCategory, since_ms: i64) -> StoreResult<u64> {
        self.store.prune_old_requests(now_ms());
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM requests WHERE category = ?1 AND ts_ms >= ?2",
            params![category.as_str(), since_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Timestamp of the earliest record for a category at or after
    /// `since_ms`. Anchors the sliding-window reset prediction.
    pub fn earliest_since(&self, category: RateCategory, since_ms: i64) -> StoreResult<Option<i64>> {
        let earliest: Option<i64> = self.store.conn().query_row(
            "SELECT MIN(ts_ms) FROM requests WHERE category = ?1 AND ts_ms >= ?2",
            params![category.as_str(), since_ms],
            |row| row.get(0),
        )?;
        Ok(earliest)
    }
}

//! Short-TTL cache of prior API responses.
//!
//! Read-through and last-write-wins: callers consult the cache before
//! spending request budget on data unlikely to have changed within the TTL.
//! An entry past its expiry is treated as absent regardless of presence in
//! storage. Cache writes are non-critical; failures are logged and dropped.

use crate::store::{now_ms, BackupStore, StoreResult};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default entry lifetime (1 hour).
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Read-through response cache backed by the store.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<BackupStore>,
}

impl ResponseCache {
    /// Create a cache over the shared store.
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self { store }
    }

    /// Fetch a cached payload, or `None` if missing or expired.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.get_at(key, now_ms())
    }

    /// `get` at an explicit instant.
    pub fn get_at(&self, key: &str, now: i64) -> Option<serde_json::Value> {
        let row: Option<String> = match self
            .store
            .conn()
            .query_row(
                "SELECT response_data FROM api_cache WHERE endpoint = ?1 AND expires_at_ms > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, key, "Failed to read API cache");
                return None;
            }
        };
        row.and_then(|data| serde_json::from_str(&data).ok())
    }

    /// Store a payload under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: &str, payload: &serde_json::Value, ttl: Duration) {
        self.set_at(key, payload, ttl, now_ms());
    }

    /// `set` at an explicit instant.
    pub fn set_at(&self, key: &str, payload: &serde_json::Value, ttl: Duration, now: i64) {
        let ttl_ms = ttl.as_millis() as i64;
        let result = self.store.conn().execute(
            "INSERT OR REPLACE INTO api_cache (endpoint, response_data, cached_at_ms, ttl_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, payload.to_string(), now, ttl_ms, now + ttl_ms],
        );
        if let Err(e) = result {
            warn!(error = %e, key, "Failed to write API cache");
        }
    }

    /// Drop expired entries. Purely a storage-bound optimization.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let purged = self
            .store
            .conn()
            .execute("DELETE FROM api_cache WHERE expires_at_ms <= ?1", [now_ms()])?;
        if purged > 0 {
            debug!(purged, "Purged expired API cache entries");
        }
        Ok(purged)
    }
}

//! Sliding-window rate-limit tracking and cooldown prediction.
//!
//! The remote service enforces a sliding 1-hour budget per category plus a
//! 24-hour ceiling. Counting alone cannot predict when capacity returns, so
//! the tracker anchors the reset clock to the *earliest* request still inside
//! the window, reproducing the server's sliding behavior locally. Once the
//! server itself rejects a call, the persisted tripped state becomes
//! authoritative until it expires.

use crate::ledger::{RateCategory, RequestLedger};
use crate::store::{now_ms, BackupStore, StoreResult, DAY_MS, HOUR_MS};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

/// Per-category budget configuration.
///
/// Both categories carry the same numeric limits by default; keeping them in
/// configuration means "restricted" stays a deployment decision rather than a
/// hardcoded distinction.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Requests allowed per sliding hour, per category.
    pub hourly_limit: u64,
    /// Requests allowed per sliding 24 hours, per category.
    pub daily_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 5_000,
            daily_limit: 60_000,
        }
    }
}

/// Snapshot of one category's budget, as reported to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitStatus {
    /// Budget category.
    pub category: RateCategory,
    /// Requests used inside the current hour window.
    pub used: u64,
    /// Requests remaining inside the current hour window.
    pub remaining: u64,
    /// Hourly limit in force.
    pub limit: u64,
    /// Predicted reset instant (Unix ms), if any request is in the window.
    pub reset_at_ms: Option<i64>,
    /// Seconds until the predicted reset.
    pub reset_in_seconds: Option<i64>,
    /// Requests used inside the 24-hour window.
    pub daily_used: u64,
    /// Daily ceiling in force.
    pub daily_limit: u64,
    /// Requests remaining under the daily ceiling.
    pub daily_remaining: u64,
    /// Whether an observed server rejection is still in force.
    pub tripped: bool,
}

/// Persisted cooldown recorded when the server rejected a call.
#[derive(Debug, Clone)]
pub struct TrippedState {
    /// Budget category.
    pub category: RateCategory,
    /// When the rejection was observed (Unix ms).
    pub triggered_at_ms: i64,
    /// When the cooldown ends (Unix ms).
    pub reset_at_ms: i64,
    /// Requests used at the moment of the trip.
    pub requests_used: u64,
    /// Limit the server reported or the config assumed.
    pub limit_value: u64,
}

/// Tracks usage per category and predicts when refused requests will be
/// accepted again.
#[derive(Clone)]
pub struct RateLimitTracker {
    store: Arc<BackupStore>,
    ledger: RequestLedger,
    config: RateLimitConfig,
}

impl RateLimitTracker {
    /// Create a tracker over the shared store.
    pub fn new(store: Arc<BackupStore>, config: RateLimitConfig) -> Self {
        let ledger = RequestLedger::new(store.clone());
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Budget configuration in force.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Current budget snapshot for a category.
    pub fn status(&self, category: RateCategory) -> StoreResult<RateLimitStatus> {
        self.status_at(category, now_ms())
    }

    /// `status` at an explicit instant.
    pub fn status_at(&self, category: RateCategory, now: i64) -> StoreResult<RateLimitStatus> {
        self.clear_expired_at(now)?;

        let used = self.ledger.count_since(category, now - HOUR_MS)?;
        let daily_used = self.ledger.count_since(category, now - DAY_MS)?;

        // Reset clock anchored to the earliest request still in the window.
        let mut reset_at_ms = self
            .ledger
            .earliest_since(category, now - HOUR_MS)?
            .map(|first| first + HOUR_MS);
        let mut limit = self.config.hourly_limit;
        let mut effective_used = used;

        // An observed server cooldown supersedes the derived view.
        let tripped = self.active_state_at(category, now)?;
        if let Some(state) = &tripped {
            reset_at_ms = Some(state.reset_at_ms);
            effective_used = state.requests_used;
            limit = state.limit_value;
        }

        let reset_in_seconds = reset_at_ms.map(|at| ((at - now).max(0) + 999) / 1000);

        Ok(RateLimitStatus {
            category,
            used: effective_used,
            remaining: limit.saturating_sub(effective_used),
            limit,
            reset_at_ms,
            reset_in_seconds,
            daily_used,
            daily_limit: self.config.daily_limit,
            daily_remaining: self.config.daily_limit.saturating_sub(daily_used),
            tripped: tripped.is_some(),
        })
    }

    /// Record an observed server rejection.
    ///
    /// Resolves the reset as one hour after the earliest in-window request,
    /// falling back to one hour after `triggered_at_ms` when the window is
    /// empty. If the computed reset is already in the past the limit has
    /// elapsed and the trip is discarded; recording it would re-arm a
    /// cooldown and push the sliding window backward.
    ///
    /// Returns `true` when a cooldown was armed.
    pub fn trip(
        &self,
        category: RateCategory,
        triggered_at_ms: i64,
        requests_used: u64,
        limit: u64,
    ) -> StoreResult<bool> {
        self.trip_at(category, triggered_at_ms, requests_used, limit, now_ms())
    }

    /// `trip` at an explicit instant.
    pub fn trip_at(
        &self,
        category: RateCategory,
        triggered_at_ms: i64,
        requests_used: u64,
        limit: u64,
        now: i64,
    ) -> StoreResult<bool> {
        let reset_at_ms = match self.ledger.earliest_since(category, now - HOUR_MS)? {
            Some(first) => first + HOUR_MS,
            None => triggered_at_ms + HOUR_MS,
        };
        self.arm(category, triggered_at_ms, reset_at_ms, requests_used, limit, now)
    }

    /// Record a server rejection that came with an explicit reset instant.
    ///
    /// Server hints beat the derived window; the same backward-clock guard
    /// applies, so a hint pointing into the past is discarded.
    pub fn trip_until(
        &self,
        category: RateCategory,
        reset_at_ms: i64,
        requests_used: u64,
        limit: u64,
    ) -> StoreResult<bool> {
        let now = now_ms();
        self.arm(category, now, reset_at_ms, requests_used, limit, now)
    }

    fn arm(
        &self,
        category: RateCategory,
        triggered_at_ms: i64,
        reset_at_ms: i64,
        requests_used: u64,
        limit: u64,
        now: i64,
    ) -> StoreResult<bool> {
        if reset_at_ms <= now {
            debug!(
                category = %category,
                reset_at_ms,
                "Computed rate-limit reset already elapsed; discarding trip"
            );
            return Ok(false);
        }

        self.store.conn().execute(
            "INSERT INTO rate_limit_status (category, triggered_at_ms, reset_at_ms, requests_used, limit_value)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(category) DO UPDATE SET
                triggered_at_ms = excluded.triggered_at_ms,
                reset_at_ms = excluded.reset_at_ms,
                requests_used = excluded.requests_used,
                limit_value = excluded.limit_value",
            params![
                category.as_str(),
                triggered_at_ms,
                reset_at_ms,
                requests_used as i64,
                limit as i64
            ],
        )?;
        info!(
            category = %category,
            reset_at_ms,
            reset_in_seconds = (reset_at_ms - now) / 1000,
            "Rate limit tripped"
        );
        Ok(true)
    }

    /// Whether a cooldown is currently in force for a category.
    ///
    /// Self-cleaning: expired states are deleted before answering, so a
    /// stale cooldown is never reported as active.
    pub fn is_active(&self, category: RateCategory) -> StoreResult<bool> {
        self.is_active_at(category, now_ms())
    }

    /// `is_active` at an explicit instant.
    pub fn is_active_at(&self, category: RateCategory, now: i64) -> StoreResult<bool> {
        Ok(self.active_state_at(category, now)?.is_some())
    }

    /// The live tripped state for a category, if any.
    pub fn active_state(&self, category: RateCategory) -> StoreResult<Option<TrippedState>> {
        self.active_state_at(category, now_ms())
    }

    fn active_state_at(
        &self,
        category: RateCategory,
        now: i64,
    ) -> StoreResult<Option<TrippedState>> {
        self.clear_expired_at(now)?;
        let state = self
            .store
            .conn()
            .query_row(
                "SELECT triggered_at_ms, reset_at_ms, requests_used, limit_value
                 FROM rate_limit_status WHERE category = ?1 AND reset_at_ms > ?2",
                params![category.as_str(), now],
                |row| {
                    Ok(TrippedState {
                        category,
                        triggered_at_ms: row.get(0)?,
                        reset_at_ms: row.get(1)?,
                        requests_used: row.get::<_, i64>(2)? as u64,
                        limit_value: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Manual reset for a category, used when the operator forces a retry.
    pub fn clear(&self, category: RateCategory) -> StoreResult<()> {
        let cleared = self.store.conn().execute(
            "DELETE FROM rate_limit_status WHERE category = ?1",
            [category.as_str()],
        )?;
        if cleared > 0 {
            info!(category = %category, "Cleared rate limit state");
        }
        Ok(())
    }

    /// Drop expired cooldowns. Runs before every read.
    fn clear_expired_at(&self, now: i64) -> StoreResult<()> {
        let cleared = self
            .store
            .conn()
            .execute("DELETE FROM rate_limit_status WHERE reset_at_ms <= ?1", [now])?;
        if cleared > 0 {
            debug!(cleared, "Cleared expired rate limit states");
        }
        Ok(())
    }
}

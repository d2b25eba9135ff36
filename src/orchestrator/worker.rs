//! Download worker pool.
//!
//! Workers pull one pending record at a time from a shared queue, so a slow
//! file never blocks the rest of the pool. A rate-limited attempt does not
//! consume a try; the record goes back to the front of the queue and the
//! worker parks until the cooldown ends.

use super::{arm_trip, rate_limit_gate, STALE_TRIP_BACKOFF};
use crate::client::{ClientError, RemoteClient};
use crate::control::ControlSignals;
use crate::download::{DownloadLedger, DownloadRecord};
use crate::events::EventLog;
use crate::ledger::RateCategory;
use crate::rate_limit::RateLimitTracker;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Everything a worker needs, cheap to clone per task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub scan_id: i64,
    pub client: Arc<dyn RemoteClient>,
    pub downloads: DownloadLedger,
    pub tracker: RateLimitTracker,
    pub signals: ControlSignals,
    pub events: EventLog,
    pub backup_dir: PathBuf,
    pub urls: Arc<HashMap<i64, String>>,
    pub concurrency: usize,
}

type Queue = Arc<Mutex<VecDeque<DownloadRecord>>>;

/// Run one batch of pending records to exhaustion or cancellation.
pub(crate) async fn run_pool(ctx: WorkerContext, pending: Vec<DownloadRecord>) {
    let workers = ctx.concurrency.min(pending.len()).max(1);
    let queue: Queue = Arc::new(Mutex::new(VecDeque::from(pending)));

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        pool.spawn(run_worker(ctx.clone(), Arc::clone(&queue)));
    }
    while pool.join_next().await.is_some() {}
}

async fn run_worker(ctx: WorkerContext, queue: Queue) {
    loop {
        if ctx.signals.is_cancelled() {
            return;
        }
        let record = pop_front(&queue);
        let Some(record) = record else {
            return;
        };

        match rate_limit_gate(
            &ctx.tracker,
            &ctx.signals,
            &ctx.events,
            RateCategory::Restricted,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled while parked; leave the record untouched.
                push_front(&queue, record);
                return;
            }
            Err(e) => {
                // Gate failure only loses the suspension, not the download.
                warn!(error = %e, "Rate-limit gate check failed");
            }
        }

        download_one(&ctx, record, &queue).await;
    }
}

async fn download_one(ctx: &WorkerContext, record: DownloadRecord, queue: &Queue) {
    let Some(url) = ctx.urls.get(&record.file_id) else {
        ctx.events.warn(format!(
            "No download URL recorded for file {}; skipping",
            record.file_id
        ));
        if let Err(e) = ctx.downloads.mark_error(ctx.scan_id, record.file_id) {
            warn!(file_id = record.file_id, error = %e, "Failed to record download error");
        }
        return;
    };

    let dest = ctx.backup_dir.join(&record.path);
    match ctx.client.download_file(url, &dest).await {
        Ok(bytes) => {
            if let Err(e) = ctx.downloads.mark_done(ctx.scan_id, record.file_id, Some(bytes)) {
                warn!(file_id = record.file_id, error = %e, "Failed to record download completion");
            }
            debug!(
                file_id = record.file_id,
                path = %record.path,
                bytes,
                "File downloaded"
            );
        }
        Err(ClientError::RateLimited { category, hint }) => {
            match arm_trip(&ctx.tracker, &ctx.events, category, hint) {
                // Armed: the gate parks this worker until the reset.
                Ok(true) => {}
                // Discarded (stale window) or unrecorded: hold off here so
                // the retry is not an instant re-poll of a limiting server.
                Ok(false) => back_off(ctx).await,
                Err(e) => {
                    warn!(error = %e, "Failed to record rate-limit trip");
                    back_off(ctx).await;
                }
            }
            // The attempt never ran to completion; no try is consumed.
            push_front(queue, record);
        }
        Err(e) => {
            ctx.events
                .warn(format!("Download of {} failed: {e}", record.path));
            if let Err(e) = ctx.downloads.mark_error(ctx.scan_id, record.file_id) {
                warn!(file_id = record.file_id, error = %e, "Failed to record download error");
            }
        }
    }
}

async fn back_off(ctx: &WorkerContext) {
    tokio::select! {
        _ = tokio::time::sleep(STALE_TRIP_BACKOFF) => {}
        _ = ctx.signals.cancelled() => {}
    }
}

fn pop_front(queue: &Queue) -> Option<DownloadRecord> {
    queue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
}

fn push_front(queue: &Queue, record: DownloadRecord) {
    queue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push_front(record);
}

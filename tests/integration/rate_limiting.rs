//! Integration tests for rate-limit trips and suspension

use crate::support::{file_url, MockRemoteClient};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use workspace_backup::ledger::RateCategory;
use workspace_backup::orchestrator::BackupOrchestrator;
use workspace_backup::session::BackupSession;
use workspace_backup::store::BackupStore;

fn orchestrator_with(
    mock: Arc<MockRemoteClient>,
    store: Arc<BackupStore>,
    dir: &TempDir,
) -> BackupOrchestrator {
    let session = BackupSession::new("https://api.example.com", "token", dir.path());
    BackupOrchestrator::new(session, mock, store)
}

#[tokio::test]
async fn test_throttled_enumeration_suspends_then_finishes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small().with_rate_limited_once("/org", 1));
    let orchestrator = orchestrator_with(mock, store, &dir);

    let started = Instant::now();
    let outcome = orchestrator.scan(false).await.unwrap();

    // The server hint was honored: the scan waited out the cooldown.
    assert!(started.elapsed().as_millis() >= 1_000);
    assert_eq!(outcome.summary.unwrap().files, 4);

    let events = orchestrator.events().replay();
    assert!(events.iter().any(|e| e.message.contains("suspending")));
    assert!(events
        .iter()
        .any(|e| e.message.contains("rate limit tripped")));

    // The cooldown expired, so nothing is left armed.
    assert!(!orchestrator
        .tracker()
        .is_active(RateCategory::Standard)
        .unwrap());
}

#[tokio::test]
async fn test_throttled_download_resumes_without_losing_a_try() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small().with_rate_limited_once(&file_url(9000), 1));
    let orchestrator = orchestrator_with(Arc::clone(&mock), Arc::clone(&store), &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    let report = orchestrator.backup(scan_id).await.unwrap();

    // Everything completed once the restricted budget came back.
    assert_eq!(report.stats.done, 4);
    assert_eq!(report.stats.error, 0);
    assert!(report.warnings.is_empty());

    // A throttled attempt is not a failed attempt: the file went straight
    // from pending to done once its retry succeeded.
    let downloads = workspace_backup::download::DownloadLedger::new(store);
    assert!(downloads.is_done(scan_id, 9000).unwrap());
    assert!(downloads.failed(scan_id).unwrap().is_empty());
    assert!(!orchestrator
        .tracker()
        .is_active(RateCategory::Restricted)
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_discarded_download_trip_backs_off_between_attempts() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    // The server keeps refusing this file while claiming the cooldown has
    // already passed, so every armed trip is discarded as stale.
    let mock = Arc::new(MockRemoteClient::small().with_rate_limited(&file_url(9000), 0));
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    mock.set_cancel_after(mock.total_calls() + 8, orchestrator.signals());

    let report = orchestrator.backup(scan_id).await.unwrap();
    assert!(report.cancelled);

    // The three healthy files completed. The refused one burned no tries
    // and sat out a backoff between attempts instead of re-polling the
    // server in a tight loop; without the backoff this run never reaches
    // the cancellation call count.
    assert_eq!(report.stats.done, 3);
    assert_eq!(report.stats.error, 0);
    assert_eq!(report.stats.pending, 1);
    assert_eq!(mock.download_calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_rate_limit_status_reports_both_categories() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(mock, store, &dir);

    orchestrator.scan(false).await.unwrap();

    let statuses = orchestrator.rate_limit_status().unwrap();
    assert_eq!(statuses.len(), 2);
    let standard = statuses
        .iter()
        .find(|s| s.category == RateCategory::Standard)
        .unwrap();
    // Enumeration against a mock spends no ledgered requests; the budget is
    // untouched and untripped.
    assert!(!standard.tripped);
    assert_eq!(standard.remaining, standard.limit);
}

//! Integration tests for the download phase

use crate::support::{file_url, MockRemoteClient, ALWAYS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use workspace_backup::orchestrator::{BackupOrchestrator, OrchestratorError};
use workspace_backup::session::BackupSession;
use workspace_backup::store::BackupStore;

fn orchestrator_with(
    mock: Arc<MockRemoteClient>,
    store: Arc<BackupStore>,
    dir: &TempDir,
) -> BackupOrchestrator {
    let session = BackupSession::new("https://api.example.com", "token", dir.path())
        .with_concurrency(2)
        .with_max_tries(3);
    BackupOrchestrator::new(session, mock, store)
}

#[tokio::test]
async fn test_backup_downloads_every_scanned_file() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    let report = orchestrator.backup(scan_id).await.unwrap();

    assert!(!report.cancelled);
    assert!(report.warnings.is_empty());
    assert_eq!(report.stats.total, 4);
    assert_eq!(report.stats.done, 4);
    assert_eq!(report.stats.error, 0);

    let contract = dir.path().join("Acme/Sales/Leads/contract.pdf");
    assert_eq!(std::fs::read(&contract).unwrap(), b"payload");
    assert!(dir.path().join("Acme/HR/People/handbook.txt").exists());
}

#[tokio::test]
async fn test_second_backup_skips_completed_files() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    orchestrator.backup(scan_id).await.unwrap();
    assert_eq!(mock.download_calls.load(Ordering::SeqCst), 4);

    // Done is sticky; a re-run finds nothing to fetch.
    let report = orchestrator.backup(scan_id).await.unwrap();
    assert_eq!(report.stats.done, 4);
    assert_eq!(mock.download_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_transient_failure_is_retried_to_success() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small().with_flaky(&file_url(9001), 1));
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    let report = orchestrator.backup(scan_id).await.unwrap();

    assert_eq!(report.stats.done, 4);
    assert_eq!(report.stats.error, 0);
    assert!(report.warnings.is_empty());
    // Four files plus one retry of the flaky one.
    assert_eq!(mock.download_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_exhausted_file_is_reported_not_retried_forever() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small().with_flaky(&file_url(9001), ALWAYS));
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    let report = orchestrator.backup(scan_id).await.unwrap();

    assert_eq!(report.stats.done, 3);
    assert_eq!(report.stats.error, 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("quote.pdf"));
    assert!(report.warnings[0].contains("3 attempts"));
    // Three attempts for the broken file, one each for the other three.
    assert_eq!(mock.download_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_backup_of_unknown_scan_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(mock, store, &dir);

    assert!(matches!(
        orchestrator.backup(999).await,
        Err(OrchestratorError::ScanNotFound(999))
    ));
}

#[tokio::test]
async fn test_cancel_mid_backup_preserves_progress() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), store, &dir);

    let scan_id = orchestrator.scan(false).await.unwrap().scan_id;
    // Every scan call is already made; cancel once the second download starts.
    mock.set_cancel_after(mock.total_calls() + 2, orchestrator.signals());

    let report = orchestrator.backup(scan_id).await.unwrap();
    assert!(report.cancelled);
    // Whatever finished before the cancel stays done for the next run.
    assert!(report.stats.done >= 1);
    assert!(report.stats.done < 4);
    assert!(report.stats.pending >= 1);
}

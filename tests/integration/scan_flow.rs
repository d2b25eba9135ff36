//! Integration tests for scan enumeration, checkpointing, and resume

use crate::support::MockRemoteClient;
use std::sync::Arc;
use tempfile::TempDir;
use workspace_backup::orchestrator::{BackupOrchestrator, OrchestratorError, OrchestratorState};
use workspace_backup::scan::{ScanApp, ScanCheckpoint, ScanFile, ScanMeta};
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
async fn test_full_scan_persists_hierarchy() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), Arc::clone(&store), &dir);

    let outcome = orchestrator.scan(false).await.unwrap();
    assert!(!outcome.cancelled);

    let summary = outcome.summary.unwrap();
    assert_eq!(summary.organizations, 1);
    assert_eq!(summary.workspaces, 2);
    assert_eq!(summary.applications, 3);
    assert_eq!(summary.items, 3);
    assert_eq!(summary.files, 4);
    assert_eq!(summary.backup_size, 165);

    let apps = orchestrator.journal().apps(outcome.scan_id).unwrap();
    assert_eq!(apps.len(), 3);
    assert!(apps.iter().any(|a| a.folder_path == "Acme/Sales/Leads"));

    // Completed scans are never offered for resume.
    assert!(orchestrator.journal().find_resumable().unwrap().is_none());
}

#[tokio::test]
async fn test_new_scan_refused_while_one_is_open() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(mock, Arc::clone(&store), &dir);

    let open_id = orchestrator
        .journal()
        .begin(&ScanMeta::default())
        .unwrap();

    match orchestrator.scan(false).await {
        Err(OrchestratorError::ScanInProgress { scan_id }) => assert_eq!(scan_id, open_id),
        other => panic!("expected ScanInProgress, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_skips_apps_before_the_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), Arc::clone(&store), &dir);
    let journal = orchestrator.journal();

    // An earlier run enumerated the Leads app (app 100) and was interrupted
    // before the Deals app.
    let scan_id = journal.begin(&ScanMeta::default()).unwrap();
    journal
        .add_app(
            scan_id,
            &ScanApp {
                org_name: "Acme".into(),
                workspace_id: 10,
                workspace_name: "Sales".into(),
                app_id: 100,
                app_name: "Leads".into(),
                folder_path: "Acme/Sales/Leads".into(),
            },
        )
        .unwrap();
    journal.add_item(scan_id, 100, 1000).unwrap();
    journal.add_item(scan_id, 100, 1001).unwrap();
    journal
        .add_files_bulk(
            scan_id,
            &[
                ScanFile {
                    app_id: 100,
                    item_id: Some(1000),
                    file_id: 9000,
                    name: "contract.pdf".into(),
                    size: Some(100),
                    mimetype: None,
                    download_url: "https://files.example/9000".into(),
                    folder_path: "Acme/Sales/Leads".into(),
                },
                ScanFile {
                    app_id: 100,
                    item_id: Some(1001),
                    file_id: 9001,
                    name: "quote.pdf".into(),
                    size: Some(50),
                    mimetype: None,
                    download_url: "https://files.example/9001".into(),
                    folder_path: "Acme/Sales/Leads".into(),
                },
            ],
        )
        .unwrap();
    journal
        .save_checkpoint(
            scan_id,
            &ScanCheckpoint {
                org_index: 0,
                org_total: 1,
                workspace_index: 0,
                workspace_total: 2,
                app_index: 1,
                app_total: 2,
                workspaces_counted: true,
                apps_counted: true,
            },
        )
        .unwrap();

    let outcome = orchestrator.scan(true).await.unwrap();
    assert_eq!(outcome.scan_id, scan_id);

    // The finished scan still accounts for the work done before the
    // interruption.
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.applications, 3);
    assert_eq!(summary.items, 3);
    assert_eq!(summary.files, 4);
    assert_eq!(summary.backup_size, 165);

    // The already-checkpointed app was not re-enumerated.
    let counted: Vec<i64> = mock.count_calls.lock().unwrap().clone();
    assert!(!counted.contains(&100));
    assert!(counted.contains(&101));
    assert!(counted.contains(&200));
}

#[tokio::test]
async fn test_resume_without_interrupted_scan_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(mock, store, &dir);

    assert!(matches!(
        orchestrator.scan(true).await,
        Err(OrchestratorError::NoResumableScan)
    ));
}

#[tokio::test]
async fn test_scan_state_visible_to_late_subscribers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(mock, store, &dir);

    orchestrator.scan(false).await.unwrap();

    // Nothing subscribed while the scan ran; a subscriber arriving after
    // the fact still sees the terminal state rather than Idle.
    assert_eq!(
        *orchestrator.state().borrow(),
        OrchestratorState::ScanComplete
    );
}

#[tokio::test]
async fn test_cancel_mid_scan_marks_scan_cancelled() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open_in_memory().unwrap());
    let mock = Arc::new(MockRemoteClient::small());
    let orchestrator = orchestrator_with(Arc::clone(&mock), Arc::clone(&store), &dir);

    // Cancel once enumeration is a few calls in.
    mock.set_cancel_after(4, orchestrator.signals());

    let outcome = orchestrator.scan(false).await.unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.summary.is_none());

    let record = orchestrator
        .journal()
        .get(outcome.scan_id)
        .unwrap()
        .unwrap();
    assert!(record.cancelled);
    // Cancelled scans drop their checkpoint and are not resumable.
    assert!(record.checkpoint.is_none());
    assert!(orchestrator.journal().find_resumable().unwrap().is_none());
}

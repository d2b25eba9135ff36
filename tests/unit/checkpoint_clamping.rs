//! Checkpoint serialization and shrink-clamping behavior

use workspace_backup::scan::ScanCheckpoint;

fn mid_scan_checkpoint() -> ScanCheckpoint {
    ScanCheckpoint {
        org_index: 2,
        org_total: 4,
        workspace_index: 5,
        workspace_total: 8,
        app_index: 7,
        app_total: 10,
        workspaces_counted: true,
        apps_counted: true,
    }
}

#[test]
fn test_clamp_is_a_noop_when_nothing_shrank() {
    let mut cp = mid_scan_checkpoint();
    cp.clamp_to(4, 8, 10);
    assert_eq!(cp, mid_scan_checkpoint());
}

#[test]
fn test_clamp_pulls_indices_back_to_new_totals() {
    let mut cp = mid_scan_checkpoint();
    cp.clamp_to(4, 3, 10);
    assert_eq!(cp.workspace_index, 3);
    assert_eq!(cp.workspace_total, 3);
    // Other levels untouched.
    assert_eq!(cp.org_index, 2);
    assert_eq!(cp.app_index, 7);
}

#[test]
fn test_clamp_to_empty_hierarchy() {
    let mut cp = mid_scan_checkpoint();
    cp.clamp_to(0, 0, 0);
    assert_eq!(cp.org_index, 0);
    assert_eq!(cp.workspace_index, 0);
    assert_eq!(cp.app_index, 0);
}

#[test]
fn test_growth_never_moves_an_index() {
    let mut cp = mid_scan_checkpoint();
    cp.clamp_to(20, 20, 20);
    assert_eq!(cp.org_index, 2);
    assert_eq!(cp.workspace_index, 5);
    assert_eq!(cp.app_index, 7);
    assert_eq!(cp.org_total, 20);
}

#[test]
fn test_checkpoint_json_field_names_are_stable() {
    // Persisted checkpoints must survive upgrades; field renames would
    // strand every in-flight scan.
    let json = serde_json::to_string(&mid_scan_checkpoint()).unwrap();
    for field in [
        "org_index",
        "org_total",
        "workspace_index",
        "workspace_total",
        "app_index",
        "app_total",
        "workspaces_counted",
        "apps_counted",
    ] {
        assert!(json.contains(field), "missing field {field} in {json}");
    }

    let parsed: ScanCheckpoint = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, mid_scan_checkpoint());
}

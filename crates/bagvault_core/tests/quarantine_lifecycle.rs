use bagvault_core::{
    ArchiveRequest, CancelToken, ErrorKind, EventQuery, EventType, ProjectId, ProjectListQuery,
    ProjectState, Vault,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn archived_vault(name: &str) -> (TempDir, TempDir, Vault, ProjectId) {
    let root = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    fs::create_dir(inputs.path().join("docs")).unwrap();
    fs::write(inputs.path().join("docs").join("report.txt"), b"quarterly numbers").unwrap();
    fs::write(inputs.path().join("photo.raw"), vec![7u8; 4096]).unwrap();

    let vault = Vault::open(root.path()).unwrap();
    let outcome = vault
        .archive(
            &ArchiveRequest {
                name: name.to_string(),
                description: None,
                paths: vec![inputs.path().to_path_buf()],
            },
            &CancelToken::new(),
        )
        .unwrap();
    let project_id = outcome.project.project_id;
    (root, inputs, vault, project_id)
}

fn tree_bytes(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            (rel, fs::read(entry.path()).unwrap())
        })
        .collect()
}

#[test]
fn quarantine_then_restore_keeps_package_bytes_and_metadata() {
    let (_root, _inputs, vault, project_id) = archived_vault("Keep");
    let before = vault.locate(project_id).unwrap();
    let bag = before.bag.clone().unwrap();
    let bag_bytes = tree_bytes(&bag);
    let package_before = vault.archiver().package(project_id).unwrap();

    let entry = vault.quarantine(project_id, "no longer needed").unwrap();
    assert_eq!(entry.purge_at - entry.quarantined_at, 30 * DAY_MS);
    assert_eq!(entry.reason.as_deref(), Some("no longer needed"));
    assert_eq!(vault.project(project_id).unwrap().state, ProjectState::Quarantined);
    assert!(!bag.exists());
    assert!(!before.user_copy.as_ref().unwrap().exists());
    let held = vault.locate(project_id).unwrap();
    assert!(held.bag.unwrap().starts_with(vault.layout().quarantine_dir()));
    assert!(vault
        .list_projects(&ProjectListQuery::default())
        .unwrap()
        .is_empty());

    let restored = vault.restore(project_id).unwrap();
    assert_eq!(restored.state, ProjectState::Active);
    assert_eq!(vault.locate(project_id).unwrap(), before);
    assert_eq!(tree_bytes(&bag), bag_bytes);
    assert_eq!(vault.archiver().package(project_id).unwrap(), package_before);
    assert!(vault.quarantine_manager().list_entries().unwrap().is_empty());
    assert!(!vault
        .layout()
        .quarantine_slot(&project_id.to_string())
        .exists());

    vault
        .archiver()
        .validate_package(project_id, &CancelToken::new())
        .unwrap();
}

#[test]
fn double_quarantine_and_restore_without_entry_conflict() {
    let (_root, _inputs, vault, project_id) = archived_vault("Twice");

    let err = vault.restore(project_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);

    vault.quarantine(project_id, "first").unwrap();
    let err = vault.quarantine(project_id, "second").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);

    vault.restore(project_id).unwrap();
    let err = vault.restore(project_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);
}

#[test]
fn restore_into_occupied_location_changes_nothing() {
    let (_root, _inputs, vault, project_id) = archived_vault("Occupied");
    let original_bag = vault.locate(project_id).unwrap().bag.unwrap();
    let entry = vault.quarantine(project_id, "hold").unwrap();
    let held = vault.locate(project_id).unwrap();
    let slot = vault.layout().resolve(&entry.quarantine_path);
    let slot_bytes = tree_bytes(&slot);

    fs::create_dir_all(&original_bag).unwrap();
    fs::write(original_bag.join("squatter.txt"), b"not ours").unwrap();

    let err = vault.restore(project_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);

    assert_eq!(vault.project(project_id).unwrap().state, ProjectState::Quarantined);
    let still_held = vault.quarantine_manager().entry(project_id).unwrap();
    assert_eq!(still_held.quarantine_path, entry.quarantine_path);
    assert_eq!(still_held.purge_at, entry.purge_at);
    assert_eq!(vault.locate(project_id).unwrap(), held);
    assert_eq!(tree_bytes(&slot), slot_bytes);
    assert_eq!(
        fs::read(original_bag.join("squatter.txt")).unwrap(),
        b"not ours"
    );

    fs::remove_dir_all(&original_bag).unwrap();
    vault.restore(project_id).unwrap();
    assert!(!slot.exists());
}

#[test]
fn purge_before_expiry_is_rejected_unless_forced() {
    let (_root, _inputs, vault, project_id) = archived_vault("Early");
    let manager = vault.quarantine_manager();
    let entry = vault.quarantine(project_id, "cleanup").unwrap();
    let slot = vault.layout().resolve(&entry.quarantine_path);

    let err = manager.purge(project_id, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);
    assert!(slot.exists());
    assert_eq!(vault.project(project_id).unwrap().state, ProjectState::Quarantined);

    let report = manager.purge_expired_at(entry.purge_at - 1).unwrap();
    assert!(report.purged.is_empty());
    assert!(report.failed.is_empty());

    manager.purge(project_id, true).unwrap();
    assert!(!slot.exists());
    let purged = vault.project(project_id).unwrap();
    assert_eq!(purged.state, ProjectState::Purged);
    assert_eq!(purged.package_id, None);
    assert_eq!(
        vault.archiver().package(project_id).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let err = manager.purge(project_id, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);
    let err = vault.restore(project_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuarantineConflict);
}

#[test]
fn sweep_purges_entry_rescheduled_into_the_past() {
    let (_root, _inputs, vault, project_id) = archived_vault("Sweep");
    let manager = vault.quarantine_manager();
    let entry = vault.quarantine(project_id, "expired").unwrap();
    let held_bag = vault.locate(project_id).unwrap().bag.unwrap();
    assert!(held_bag.exists());

    let rescheduled = manager
        .reschedule_purge(project_id, entry.quarantined_at - DAY_MS)
        .unwrap();
    assert_eq!(rescheduled.purge_at, entry.quarantined_at - DAY_MS);

    let report = manager.purge_expired().unwrap();
    assert_eq!(report.purged, vec![project_id]);
    assert!(report.failed.is_empty());

    assert_eq!(vault.project(project_id).unwrap().state, ProjectState::Purged);
    assert!(!held_bag.exists());
    assert!(!vault.layout().resolve(&entry.quarantine_path).exists());

    let purged_events = vault
        .events(&EventQuery {
            event_type: Some(EventType::ProjectPurged),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(purged_events.len(), 1);
    assert_eq!(purged_events[0].aggregate_uuid, project_id);

    let types: Vec<EventType> = vault
        .history(project_id)
        .unwrap()
        .iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        &types[types.len() - 3..],
        &[
            EventType::ProjectQuarantined,
            EventType::PurgeRescheduled,
            EventType::ProjectPurged,
        ]
    );
    assert!(vault
        .archiver()
        .audit_project(project_id)
        .unwrap()
        .is_consistent());
}

#[test]
fn quarantine_requires_active_project() {
    let root = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    fs::write(inputs.path().join("a.txt"), b"payload").unwrap();
    let vault = Vault::open(root.path()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = vault
        .archive(
            &ArchiveRequest {
                name: "Broken".to_string(),
                description: None,
                paths: vec![inputs.path().join("a.txt")],
            },
            &cancel,
        )
        .unwrap_err();
    let failed = vault
        .list_projects(&ProjectListQuery::in_states(&[ProjectState::Failed]))
        .unwrap();
    assert_eq!(failed.len(), 1, "archive error: {err}");

    let err = vault.quarantine(failed[0].project_id, "nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

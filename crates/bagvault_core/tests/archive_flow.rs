use bagvault_core::fsops::set_tree_readonly;
use bagvault_core::{
    Algorithm, ArchiveRequest, CancelToken, ChecksumEngine, ErrorKind, EventType,
    ProjectListQuery, ProjectState, Vault, VaultError,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_inputs(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for (name, byte) in [("c.txt", b'c'), ("a.txt", b'a'), ("b.txt", b'b')] {
        let path = dir.join(name);
        fs::write(&path, vec![byte; 500]).unwrap();
        paths.push(path);
    }
    paths
}

fn request(name: &str, paths: Vec<PathBuf>) -> ArchiveRequest {
    ArchiveRequest {
        name: name.to_string(),
        description: Some("three sample files".to_string()),
        paths,
    }
}

fn open_vault() -> (TempDir, Vault) {
    let root = tempfile::tempdir().unwrap();
    let vault = Vault::open(root.path()).unwrap();
    (root, vault)
}

#[test]
fn archive_three_files_produces_sorted_manifest() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let paths = write_inputs(inputs.path());

    let outcome = vault
        .archive(&request("Alpha", paths), &CancelToken::new())
        .unwrap();
    assert_eq!(outcome.project.state, ProjectState::Active);
    assert_eq!(outcome.project.file_count, 3);
    assert_eq!(outcome.project.total_size, 1500);
    assert_eq!(outcome.project.package_id, Some(outcome.package.package_id));
    assert_eq!(outcome.package.payload_files, 3);
    assert_eq!(outcome.package.payload_bytes, 1500);
    assert!(outcome.package.is_valid);

    let again = vault
        .create_package(outcome.project.project_id, &CancelToken::new())
        .unwrap();
    assert_eq!(again, outcome.package);

    let locations = vault.locate(outcome.project.project_id).unwrap();
    let bag = locations.bag.unwrap();
    let manifest = fs::read_to_string(bag.join("manifest-sha256.txt")).unwrap();
    let lines: Vec<&str> = manifest.lines().collect();
    assert_eq!(lines.len(), 3);
    let engine = ChecksumEngine::new([Algorithm::Sha256]);
    for (line, expected_path) in lines.iter().zip(["data/a.txt", "data/b.txt", "data/c.txt"]) {
        let (digest, path) = line.split_once("  ").unwrap();
        assert_eq!(path, expected_path);
        let on_disk = engine
            .digest_file(&bag.join(path), &CancelToken::new())
            .unwrap();
        assert_eq!(on_disk[&Algorithm::Sha256], digest);
    }

    let user_copy = locations.user_copy.unwrap();
    assert_eq!(fs::read(user_copy.join("b.txt")).unwrap(), vec![b'b'; 500]);
}

#[test]
fn input_order_does_not_change_manifest_bytes() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let paths = write_inputs(inputs.path());
    let mut reversed = paths.clone();
    reversed.reverse();

    let first = vault
        .archive(&request("Forward", paths), &CancelToken::new())
        .unwrap();
    let second = vault
        .archive(&request("Reverse", reversed), &CancelToken::new())
        .unwrap();

    let read_manifest = |project_id| {
        let bag = vault.locate(project_id).unwrap().bag.unwrap();
        fs::read(bag.join("manifest-sha256.txt")).unwrap()
    };
    assert_eq!(
        read_manifest(first.project.project_id),
        read_manifest(second.project.project_id)
    );
    assert_eq!(first.package.manifest_digest, second.package.manifest_digest);
}

#[test]
fn invalid_input_is_rejected_without_recording_anything() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();

    let cases = [
        request("Empty", Vec::new()),
        request("Relative", vec![PathBuf::from("relative/file.txt")]),
        request("Missing", vec![inputs.path().join("absent.txt")]),
        request("   ", write_inputs(inputs.path())),
    ];
    for case in &cases {
        let err = vault.archive(case, &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputInvalid, "case {:?}", case.name);
    }

    let listed = vault
        .list_projects(&ProjectListQuery::in_states(&[
            ProjectState::Pending,
            ProjectState::Failed,
            ProjectState::Active,
        ]))
        .unwrap();
    assert!(listed.is_empty());
}

#[test]
fn cancelled_packaging_keeps_failed_project_for_retry() {
    let (root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = vault
        .archive(&request("Retry", write_inputs(inputs.path())), &cancel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let project_id = match err {
        VaultError::PackagingFailed { project_id, .. } => project_id,
        other => panic!("unexpected error: {other}"),
    };

    let failed = vault.project(project_id).unwrap();
    assert_eq!(failed.state, ProjectState::Failed);
    assert_eq!(failed.package_id, None);
    let history = vault.history(project_id).unwrap();
    assert_eq!(
        history.last().map(|event| event.event_type),
        Some(EventType::PackagingFailed)
    );
    assert_eq!(history.last().unwrap().payload["error_kind"], "cancelled");
    assert_eq!(fs::read_dir(root.path().join(".bags")).unwrap().count(), 0);

    let package = vault.create_package(project_id, &CancelToken::new()).unwrap();
    assert_eq!(package.payload_files, 3);
    assert_eq!(vault.project(project_id).unwrap().state, ProjectState::Active);

    let archiver = vault.archiver();
    assert_eq!(archiver.cleanup_failed_packages(project_id).unwrap(), 1);
    assert_eq!(archiver.cleanup_failed_packages(project_id).unwrap(), 0);
    assert!(archiver.audit_project(project_id).unwrap().is_consistent());
}

#[test]
fn validation_records_tampering_with_offending_path() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let outcome = vault
        .archive(&request("Tamper", write_inputs(inputs.path())), &CancelToken::new())
        .unwrap();
    let project_id = outcome.project.project_id;
    let archiver = vault.archiver();

    let validated = archiver
        .validate_package(project_id, &CancelToken::new())
        .unwrap();
    assert_eq!(validated.files_verified, 3);
    assert!(validated.package.is_valid);

    let bag = vault.locate(project_id).unwrap().bag.unwrap();
    set_tree_readonly(&bag, false).unwrap();
    fs::write(bag.join("data").join("a.txt"), vec![b'z'; 500]).unwrap();

    let err = archiver
        .validate_package(project_id, &CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    assert_eq!(err.paths(), vec!["data/a.txt".to_string()]);
    assert!(!archiver.package(project_id).unwrap().is_valid);

    let history = vault.history(project_id).unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.event_type, EventType::PackageValidated);
    assert_eq!(last.payload["is_valid"], false);
}

#[test]
fn rebuild_restores_deleted_user_copy_from_bag() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let outcome = vault
        .archive(&request("Rebuild", write_inputs(inputs.path())), &CancelToken::new())
        .unwrap();
    let project_id = outcome.project.project_id;
    let user_copy = vault.locate(project_id).unwrap().user_copy.unwrap();
    fs::remove_file(user_copy.join("c.txt")).unwrap();
    fs::write(user_copy.join("a.txt"), b"edited").unwrap();

    vault
        .archiver()
        .rebuild_user_copy(project_id, &CancelToken::new())
        .unwrap();

    assert_eq!(fs::read(user_copy.join("a.txt")).unwrap(), vec![b'a'; 500]);
    assert_eq!(fs::read(user_copy.join("c.txt")).unwrap(), vec![b'c'; 500]);
    let history = vault.history(project_id).unwrap();
    assert_eq!(
        history.last().map(|event| event.event_type),
        Some(EventType::UserCopyRebuilt)
    );
}

#[test]
fn archive_history_replays_to_active() {
    let (_root, vault) = open_vault();
    let inputs = tempfile::tempdir().unwrap();
    let outcome = vault
        .archive(&request("History", write_inputs(inputs.path())), &CancelToken::new())
        .unwrap();

    let history = vault.history(outcome.project.project_id).unwrap();
    let types: Vec<EventType> = history.iter().map(|event| event.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ProjectCreated,
            EventType::PackagingStarted,
            EventType::PackageCreated,
            EventType::ProjectArchived,
        ]
    );
    let sequences: Vec<i64> = history.iter().map(|event| event.aggregate_seq).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    let audit = vault
        .archiver()
        .audit_project(outcome.project.project_id)
        .unwrap();
    assert_eq!(audit.replayed_state, Some(ProjectState::Active));
    assert!(audit.is_consistent());
}

#[test]
fn reopening_fails_packaging_interrupted_by_a_crash() {
    let root = tempfile::tempdir().unwrap();
    let inputs = tempfile::tempdir().unwrap();
    let vault = Vault::open(root.path()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let project_id = match vault
        .archive(&request("Interrupted", write_inputs(inputs.path())), &cancel)
        .unwrap_err()
    {
        VaultError::PackagingFailed { project_id, .. } => project_id,
        other => panic!("unexpected error: {other}"),
    };
    let started = vault
        .history(project_id)
        .unwrap()
        .into_iter()
        .find(|event| event.event_type == EventType::PackagingStarted)
        .unwrap();
    let package_id = started.payload["package_id"].as_str().unwrap().to_string();
    let db_path = vault.layout().db_path();
    let staging = vault
        .layout()
        .staging_dir()
        .join(format!("{project_id}--{package_id}"));
    let bag = vault
        .layout()
        .bags_dir()
        .join(format!("Interrupted-{}", &package_id[..8]));
    drop(vault);

    // Leave the state a process killed right after finalizing would leave.
    fs::rename(&staging, &bag).unwrap();
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE projects SET state = 'packaging' WHERE uuid = ?1;",
        [project_id.to_string()],
    )
    .unwrap();
    drop(conn);

    let vault = Vault::open(root.path()).unwrap();
    let recovered = vault.project(project_id).unwrap();
    assert_eq!(recovered.state, ProjectState::Failed);
    assert!(!bag.exists());
    assert!(staging.exists());
    let last = vault.history(project_id).unwrap().pop().unwrap();
    assert_eq!(last.event_type, EventType::PackagingFailed);
    assert_eq!(last.payload["error_kind"], "interrupted");
    assert_eq!(last.payload["staging_retained"], true);

    let package = vault.create_package(project_id, &CancelToken::new()).unwrap();
    assert_eq!(package.payload_files, 3);
    let archiver = vault.archiver();
    assert_eq!(archiver.cleanup_failed_packages(project_id).unwrap(), 1);
    assert!(archiver.audit_project(project_id).unwrap().is_consistent());
}

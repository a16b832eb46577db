//! Vault integrity scanning.
//!
//! # Responsibility
//! - Walk the user-visible layer (`projects/`) and the bag layer
//!   (`.bags/`), digest every file and fold each layer into one aggregate.
//! - Compare with the latest snapshot, classify anomalies and always store
//!   a new snapshot.
//!
//! # Invariants
//! - Scans take no project locks and never modify vault files.
//! - Anomalies are reported, never repaired.
//! - A layer whose aggregate is unchanged produces no anomalies.

use crate::bagit::DATA_DIR;
use crate::cancel::CancelToken;
use crate::checksum::{Algorithm, ChecksumEngine, ChecksumError};
use crate::error::{VaultError, VaultResult};
use crate::fsops::walk_error_to_io;
use crate::layout::{BAGS_DIR, PROJECTS_DIR};
use crate::model::event::{EventType, NewEvent};
use crate::model::now_epoch_ms;
use crate::model::package::LocationKind;
use crate::model::project::ProjectState;
use crate::model::snapshot::{Anomaly, AnomalyKind, Layer, Severity, SnapshotEntry, VaultSnapshot};
use crate::repo::event_store::{EventStore, SqliteEventStore};
use crate::repo::package_repo::{LocationRepository, PackageRepository, SqlitePackageRepository};
use crate::repo::project_repo::{ProjectListQuery, ProjectRepository, SqliteProjectRepository};
use crate::repo::snapshot_repo::{SnapshotRepository, SqliteSnapshotRepository};
use crate::service::vault::Vault;
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileRecord {
    digest: String,
    size: u64,
}

type LayerFiles = BTreeMap<String, FileRecord>;

/// Vault-relative paths owned by `Active` projects, with the recorded
/// scan-algorithm digest when one exists.
type ExpectedPaths = BTreeMap<String, Option<String>>;

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub snapshot_id: Uuid,
    pub scanned_at: i64,
    pub algorithm: Algorithm,
    pub user_checksum: String,
    pub bag_checksum: String,
    pub user_changed: bool,
    pub bag_changed: bool,
    /// No comparable earlier snapshot existed.
    pub baseline: bool,
    pub files_scanned: u64,
    pub anomalies: Vec<Anomaly>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn count(&self, kind: AnomalyKind) -> usize {
        self.anomalies
            .iter()
            .filter(|anomaly| anomaly.kind == kind)
            .count()
    }
}

/// On-demand scanner over one vault.
pub struct IntegrityScanner<'v> {
    vault: &'v Vault,
}

impl<'v> IntegrityScanner<'v> {
    pub fn new(vault: &'v Vault) -> Self {
        Self { vault }
    }

    /// Walks both layers, classifies anomalies and stores a snapshot.
    ///
    /// Expected paths are read before and after the walk; a path counts
    /// as tracked for missing/corrupt checks only when both reads agree,
    /// and as untracked only when neither does. Operations that complete
    /// during the walk therefore do not produce false alarms.
    pub fn scan(&self, cancel: &CancelToken) -> VaultResult<IntegrityReport> {
        let started = Instant::now();
        let layout = self.vault.layout();
        let algorithm = self.vault.config().scan_algorithm;
        let engine = ChecksumEngine::new([algorithm]);

        let before = self.expected_paths(algorithm)?;
        let user = self.walk_layer(&layout.projects_dir(), &engine, algorithm, cancel)?;
        let bag = self.walk_layer(&layout.bags_dir(), &engine, algorithm, cancel)?;
        let after = self.expected_paths(algorithm)?;
        let expectations = Expectations {
            before: &before,
            after: &after,
        };

        let prior = self.vault.with_db(|conn| {
            let snapshots = SqliteSnapshotRepository::new(conn);
            match snapshots.latest_snapshot()? {
                Some(snapshot) if snapshot.algorithm == algorithm => {
                    let entries = snapshots.list_entries(snapshot.seq)?;
                    Ok(Some((snapshot, entries)))
                }
                _ => Ok(None),
            }
        })?;
        let baseline = prior.is_none();

        let user_checksum = aggregate(&engine, algorithm, &user);
        let bag_checksum = aggregate(&engine, algorithm, &bag);
        let user_changed = prior
            .as_ref()
            .map_or(true, |(snapshot, _)| snapshot.user_checksum != user_checksum);
        let bag_changed = prior
            .as_ref()
            .map_or(true, |(snapshot, _)| snapshot.bag_checksum != bag_checksum);

        let mut anomalies = Vec::new();
        for (layer, current, changed) in [
            (Layer::User, &user, user_changed),
            (Layer::Bag, &bag, bag_changed),
        ] {
            if !changed {
                continue;
            }
            let prior_layer = prior.as_ref().map(|(_, entries)| {
                entries
                    .iter()
                    .filter(|entry| entry.layer == layer)
                    .map(|entry| (entry.rel_path.clone(), entry.digest.clone()))
                    .collect::<BTreeMap<_, _>>()
            });
            anomalies.extend(classify(layer, current, prior_layer.as_ref(), &expectations));
        }

        let snapshot = VaultSnapshot {
            seq: 0,
            uuid: Uuid::new_v4(),
            scanned_at: now_epoch_ms(),
            algorithm,
            user_checksum,
            bag_checksum,
            user_files: user.len() as u64,
            bag_files: bag.len() as u64,
            anomalies,
        };
        let entries: Vec<SnapshotEntry> = [(Layer::User, &user), (Layer::Bag, &bag)]
            .into_iter()
            .flat_map(|(layer, files)| {
                files.iter().map(move |(path, record)| SnapshotEntry {
                    layer,
                    rel_path: path.clone(),
                    digest: record.digest.clone(),
                    size: record.size,
                })
            })
            .collect();

        let stored = self.vault.with_tx(|tx| {
            let stored = SqliteSnapshotRepository::new(tx).create_snapshot(&snapshot, &entries)?;
            if !stored.anomalies.is_empty() {
                let severity_count = |severity: Severity| {
                    stored
                        .anomalies
                        .iter()
                        .filter(|anomaly| anomaly.severity == severity)
                        .count()
                };
                let paths: Vec<&str> = stored
                    .anomalies
                    .iter()
                    .flat_map(|anomaly| anomaly.paths.iter().map(String::as_str))
                    .collect();
                SqliteEventStore::new(tx).append_at(
                    &NewEvent::new(
                        EventType::AnomalyDetected,
                        stored.uuid,
                        json!({
                            "snapshot_seq": stored.seq,
                            "anomalies": stored.anomalies.len(),
                            "critical": severity_count(Severity::Critical),
                            "warning": severity_count(Severity::Warning),
                            "paths": paths,
                        }),
                    ),
                    stored.scanned_at,
                )?;
            }
            Ok(stored)
        })?;

        let report = IntegrityReport {
            snapshot_id: stored.uuid,
            scanned_at: stored.scanned_at,
            algorithm,
            user_checksum: stored.user_checksum,
            bag_checksum: stored.bag_checksum,
            user_changed,
            bag_changed,
            baseline,
            files_scanned: stored.user_files + stored.bag_files,
            anomalies: stored.anomalies,
        };
        let status = if report.is_healthy() { "ok" } else { "anomaly" };
        info!(
            "event=integrity_scan module=scanner status={} snapshot_id={} files={} anomalies={} baseline={} duration_ms={}",
            status,
            report.snapshot_id,
            report.files_scanned,
            report.anomalies.len(),
            report.baseline,
            started.elapsed().as_millis()
        );
        Ok(report)
    }

    pub fn latest_snapshot(&self) -> VaultResult<Option<VaultSnapshot>> {
        self.vault
            .with_db(|conn| Ok(SqliteSnapshotRepository::new(conn).latest_snapshot()?))
    }

    /// Stored snapshots, newest first.
    pub fn snapshots(&self, limit: u32) -> VaultResult<Vec<VaultSnapshot>> {
        self.vault
            .with_db(|conn| Ok(SqliteSnapshotRepository::new(conn).list_snapshots(limit)?))
    }

    fn expected_paths(&self, algorithm: Algorithm) -> VaultResult<ExpectedPaths> {
        self.vault.with_db(|conn| {
            let projects = SqliteProjectRepository::new(conn)
                .list_projects(&ProjectListQuery::in_states(&[ProjectState::Active]))?;
            let packages = SqlitePackageRepository::new(conn);
            let mut expected = ExpectedPaths::new();
            for project in projects {
                let Some(package) = packages.get_package_for_project(project.uuid)? else {
                    continue;
                };
                let files = packages.list_files(package.uuid)?;
                if let Some(bag_rel) = packages.get_location(package.uuid, LocationKind::Bag)? {
                    for name in package.tag_file_names() {
                        expected.insert(format!("{bag_rel}/{name}"), None);
                    }
                    for file in &files {
                        expected.insert(
                            format!("{bag_rel}/{DATA_DIR}/{}", file.rel_path),
                            file.digests.get(&algorithm).cloned(),
                        );
                    }
                }
                let user_copy = packages.get_location(project.uuid, LocationKind::UserCopy)?;
                if let Some(user_rel) = user_copy {
                    for file in &files {
                        expected.insert(
                            format!("{user_rel}/{}", file.rel_path),
                            file.digests.get(&algorithm).cloned(),
                        );
                    }
                }
            }
            Ok(expected)
        })
    }

    fn walk_layer(
        &self,
        root: &Path,
        engine: &ChecksumEngine,
        algorithm: Algorithm,
        cancel: &CancelToken,
    ) -> VaultResult<LayerFiles> {
        let mut files = LayerFiles::new();
        if !root.exists() {
            return Ok(files);
        }
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if is_not_found(err.io_error()) => continue,
                Err(err) => {
                    let path = err
                        .path()
                        .unwrap_or(root)
                        .display()
                        .to_string();
                    return Err(VaultError::io(path, walk_error_to_io(err)));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel_path) = self.vault.layout().relative(entry.path()) else {
                warn!(
                    "event=integrity_scan module=scanner status=warn reason=non_utf8_path path={}",
                    entry.path().display()
                );
                continue;
            };
            let digests = match engine.digest_file(entry.path(), cancel) {
                Ok(digests) => digests,
                Err(ChecksumError::Cancelled { .. }) => return Err(VaultError::Cancelled),
                // Vanished between listing and reading.
                Err(ChecksumError::Io { source, .. })
                    if source.kind() == io::ErrorKind::NotFound =>
                {
                    continue
                }
                Err(ChecksumError::Io { source_id, source }) => {
                    return Err(VaultError::io(source_id, source))
                }
            };
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) if is_not_found(err.io_error()) => continue,
                Err(err) => return Err(VaultError::io(rel_path, walk_error_to_io(err))),
            };
            if let Some(digest) = digests.get(&algorithm) {
                files.insert(
                    rel_path,
                    FileRecord {
                        digest: digest.clone(),
                        size,
                    },
                );
            }
        }
        Ok(files)
    }
}

fn is_not_found(err: Option<&io::Error>) -> bool {
    err.is_some_and(|err| err.kind() == io::ErrorKind::NotFound)
}

// Digest over sorted `<path>\0<digest>\n` records.
fn aggregate(engine: &ChecksumEngine, algorithm: Algorithm, files: &LayerFiles) -> String {
    let mut records = String::new();
    for (path, record) in files {
        records.push_str(path);
        records.push('\0');
        records.push_str(&record.digest);
        records.push('\n');
    }
    engine
        .digest_bytes(records.as_bytes())
        .remove(&algorithm)
        .unwrap_or_default()
}

struct Expectations<'a> {
    before: &'a ExpectedPaths,
    after: &'a ExpectedPaths,
}

impl Expectations<'_> {
    fn tracked(&self, path: &str) -> bool {
        self.before.contains_key(path) && self.after.contains_key(path)
    }

    fn untracked(&self, path: &str) -> bool {
        !self.before.contains_key(path) && !self.after.contains_key(path)
    }

    fn recorded_digest(&self, path: &str) -> Option<&str> {
        self.after
            .get(path)
            .or_else(|| self.before.get(path))
            .and_then(|digest| digest.as_deref())
    }
}

fn layer_prefix(layer: Layer) -> String {
    match layer {
        Layer::User => format!("{PROJECTS_DIR}/"),
        Layer::Bag => format!("{BAGS_DIR}/"),
    }
}

fn anomaly(
    kind: AnomalyKind,
    severity: Severity,
    layer: Layer,
    paths: Vec<String>,
    detail: &str,
) -> Anomaly {
    Anomaly {
        kind,
        severity,
        layer,
        paths,
        detail: detail.to_string(),
    }
}

/// Classifies one changed layer. `prior` is `None` on a baseline scan.
fn classify(
    layer: Layer,
    current: &LayerFiles,
    prior: Option<&BTreeMap<String, String>>,
    expectations: &Expectations<'_>,
) -> Vec<Anomaly> {
    let prefix = layer_prefix(layer);
    let mut anomalies = Vec::new();

    // Expected paths of this layer that are gone, whether or not a prior
    // snapshot ever saw them.
    let mut missing: BTreeMap<String, Option<String>> = expectations
        .before
        .keys()
        .filter(|path| {
            path.starts_with(&prefix) && !current.contains_key(*path) && expectations.tracked(path)
        })
        .map(|path| {
            let digest = prior
                .and_then(|prior| prior.get(path))
                .map(String::as_str)
                .or_else(|| expectations.recorded_digest(path));
            (path.clone(), digest.map(str::to_string))
        })
        .collect();
    if let Some(prior) = prior {
        for (path, digest) in prior {
            if !current.contains_key(path) && expectations.tracked(path) {
                missing
                    .entry(path.clone())
                    .or_insert_with(|| Some(digest.clone()));
            }
        }
    }

    let mut appeared: BTreeMap<&str, &str> = current
        .iter()
        .filter(|(path, _)| {
            expectations.untracked(path) && prior.map_or(true, |prior| !prior.contains_key(*path))
        })
        .map(|(path, record)| (path.as_str(), record.digest.as_str()))
        .collect();

    for (path, record) in current {
        let previous = prior.and_then(|prior| prior.get(path)).map(String::as_str);
        if expectations.tracked(path) {
            let reference = expectations.recorded_digest(path).or(previous);
            if reference.is_some_and(|reference| reference != record.digest) {
                anomalies.push(anomaly(
                    AnomalyKind::CorruptedFile,
                    Severity::Critical,
                    layer,
                    vec![path.clone()],
                    "content digest differs from the recorded value",
                ));
            }
        } else if expectations.untracked(path)
            && previous.is_some_and(|previous| previous != record.digest)
        {
            anomalies.push(anomaly(
                AnomalyKind::ExternalModification,
                Severity::Warning,
                layer,
                vec![path.clone()],
                "untracked file changed since the last scan",
            ));
        }
    }

    for (path, digest) in missing {
        let moved_to = digest.as_deref().and_then(|digest| {
            appeared
                .iter()
                .find(|(_, candidate)| **candidate == digest)
                .map(|(candidate, _)| candidate.to_string())
        });
        match moved_to {
            Some(new_path) => {
                appeared.remove(new_path.as_str());
                anomalies.push(anomaly(
                    AnomalyKind::ExternalModification,
                    Severity::Warning,
                    layer,
                    vec![path, new_path],
                    "tracked file was moved outside the vault's control",
                ));
            }
            None => anomalies.push(anomaly(
                AnomalyKind::MissingFile,
                Severity::Critical,
                layer,
                vec![path],
                "tracked file is missing",
            )),
        }
    }

    for path in appeared.keys() {
        anomalies.push(anomaly(
            AnomalyKind::ExternalModification,
            Severity::Warning,
            layer,
            vec![path.to_string()],
            "file is not tracked by any active project",
        ));
    }

    anomalies.sort_by(|left, right| {
        (left.severity, &left.paths).cmp(&(right.severity, &right.paths))
    });
    anomalies
}

/// Periodic scans on a background thread.
///
/// Results reach callers only through stored snapshots and events.
pub struct IntegrityScheduler {
    cancel: CancelToken,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IntegrityScheduler {
    /// Uses the vault's configured `scan_interval_secs`.
    pub fn spawn_configured(vault: Arc<Vault>) -> VaultResult<Self> {
        let interval = vault.config().scan_interval();
        Self::spawn(vault, interval)
    }

    /// Scans immediately, then every `interval` until stopped.
    pub fn spawn(vault: Arc<Vault>, interval: Duration) -> VaultResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("bagvault-integrity".to_string())
            .spawn(move || loop {
                match vault.scanner().scan(&worker_cancel) {
                    Ok(report) => debug!(
                        "event=integrity_schedule module=scanner status=ok snapshot_id={} anomalies={}",
                        report.snapshot_id,
                        report.anomalies.len()
                    ),
                    Err(VaultError::Cancelled) => break,
                    Err(err) => warn!(
                        "event=integrity_schedule module=scanner status=error error_kind={} error={}",
                        err.kind(),
                        err
                    ),
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|err| VaultError::io("integrity scheduler thread", err))?;
        info!(
            "event=integrity_schedule module=scanner status=started interval_secs={}",
            interval.as_secs()
        );
        Ok(Self {
            cancel,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Cancels an in-flight scan and joins the worker.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("event=integrity_schedule module=scanner status=error reason=worker_panicked");
            } else {
                info!("event=integrity_schedule module=scanner status=stopped");
            }
        }
    }
}

impl Drop for IntegrityScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, Expectations, ExpectedPaths, FileRecord, LayerFiles};
    use crate::model::snapshot::{AnomalyKind, Layer, Severity};
    use std::collections::BTreeMap;

    fn files(entries: &[(&str, &str)]) -> LayerFiles {
        entries
            .iter()
            .map(|(path, digest)| {
                (
                    path.to_string(),
                    FileRecord {
                        digest: digest.to_string(),
                        size: 1,
                    },
                )
            })
            .collect()
    }

    fn expected(entries: &[(&str, Option<&str>)]) -> ExpectedPaths {
        entries
            .iter()
            .map(|(path, digest)| (path.to_string(), digest.map(str::to_string)))
            .collect()
    }

    fn prior(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(path, digest)| (path.to_string(), digest.to_string()))
            .collect()
    }

    #[test]
    fn baseline_reports_absent_tracked_file() {
        let tracked = expected(&[
            ("projects/p/a.txt", Some("aa")),
            ("projects/p/b.txt", Some("bb")),
        ]);
        let expectations = Expectations {
            before: &tracked,
            after: &tracked,
        };
        let current = files(&[("projects/p/a.txt", "aa")]);

        let anomalies = classify(Layer::User, &current, None, &expectations);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::MissingFile);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert_eq!(anomalies[0].paths, vec!["projects/p/b.txt"]);
    }

    #[test]
    fn tracked_file_never_snapshotted_is_missing() {
        let tracked = expected(&[
            ("projects/old/a.txt", Some("aa")),
            ("projects/new/b.txt", Some("bb")),
            ("projects/new/c.txt", Some("cc")),
        ]);
        let expectations = Expectations {
            before: &tracked,
            after: &tracked,
        };
        let before = prior(&[("projects/old/a.txt", "aa")]);
        let current = files(&[("projects/old/a.txt", "aa"), ("projects/new/b.txt", "bb")]);

        let anomalies = classify(Layer::User, &current, Some(&before), &expectations);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::MissingFile);
        assert_eq!(anomalies[0].paths, vec!["projects/new/c.txt"]);
    }

    #[test]
    fn moved_file_is_one_warning_naming_both_paths() {
        let tracked = expected(&[("projects/p/a.txt", Some("aa"))]);
        let expectations = Expectations {
            before: &tracked,
            after: &tracked,
        };
        let before = prior(&[("projects/p/a.txt", "aa")]);
        let current = files(&[("projects/elsewhere.txt", "aa")]);

        let anomalies = classify(Layer::User, &current, Some(&before), &expectations);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::ExternalModification);
        assert_eq!(
            anomalies[0].paths,
            vec!["projects/p/a.txt", "projects/elsewhere.txt"]
        );
    }

    #[test]
    fn corrupted_tracked_file_is_critical() {
        let tracked = expected(&[(".bags/p-1/data/a.txt", Some("aa"))]);
        let expectations = Expectations {
            before: &tracked,
            after: &tracked,
        };
        let before = prior(&[(".bags/p-1/data/a.txt", "aa")]);
        let current = files(&[(".bags/p-1/data/a.txt", "zz")]);

        let anomalies = classify(Layer::Bag, &current, Some(&before), &expectations);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::CorruptedFile);
    }

    #[test]
    fn paths_tracked_on_one_side_of_the_walk_are_ignored() {
        let before_walk = expected(&[("projects/p/a.txt", Some("aa"))]);
        let after_walk = ExpectedPaths::new();
        let expectations = Expectations {
            before: &before_walk,
            after: &after_walk,
        };
        let before = prior(&[("projects/p/a.txt", "aa")]);

        let anomalies = classify(Layer::User, &LayerFiles::new(), Some(&before), &expectations);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn untracked_new_and_changed_files_are_warnings() {
        let none = ExpectedPaths::new();
        let expectations = Expectations {
            before: &none,
            after: &none,
        };
        let before = prior(&[("projects/notes.txt", "n1")]);
        let current = files(&[("projects/notes.txt", "n2"), ("projects/new.txt", "xx")]);

        let anomalies = classify(Layer::User, &current, Some(&before), &expectations);
        let paths: Vec<_> = anomalies.iter().map(|anomaly| anomaly.paths[0].as_str()).collect();
        assert_eq!(paths, vec!["projects/new.txt", "projects/notes.txt"]);
        assert!(anomalies
            .iter()
            .all(|anomaly| anomaly.kind == AnomalyKind::ExternalModification
                && anomaly.severity == Severity::Warning));
    }
}

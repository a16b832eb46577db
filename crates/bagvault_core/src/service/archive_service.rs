//! Archiver use-case service.
//!
//! # Responsibility
//! - Validate input file sets and record archived projects.
//! - Drive `BagBuilder` runs and commit their results with the audit trail.
//! - Offer explicit follow-up operations: validation, staging cleanup,
//!   user-copy rebuild and history audit.
//!
//! # Invariants
//! - Input validation fails before any row or directory is created.
//! - The packaging claim and the final commit each happen under the
//!   project lock; hashing and copying run without it.
//! - A project only becomes `Active` in the same transaction that stores
//!   its package, locations and `PackageCreated` event.

use crate::bagit::{BagBuilder, BagReader, BagRequest, FinalizedBag, DATA_DIR};
use crate::cancel::CancelToken;
use crate::error::{VaultError, VaultResult};
use crate::fsops::{
    copy_tree, expand_inputs, remove_tree, rename_with_retry, sanitize_dir_name, SourceFile,
};
use crate::model::event::{replay_project_state, EventType, NewEvent};
use crate::model::now_epoch_ms;
use crate::model::package::{BagitPackage, LocationKind, PackageFile, PackageSummary};
use crate::model::project::{ArchivedProject, ProjectId, ProjectState, ProjectSummary};
use crate::repo::event_store::{EventStore, SqliteEventStore};
use crate::repo::package_repo::{LocationRepository, PackageRepository, SqlitePackageRepository};
use crate::repo::project_repo::{ProjectListQuery, ProjectRepository, SqliteProjectRepository};
use crate::service::vault::Vault;
use crate::service::{load_project, short_id, state_error};
use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// `last_error` and `error_kind` of a packaging run lost to a crash.
const INTERRUPTED: &str = "interrupted";

/// Input for `Archiver::archive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub name: String,
    pub description: Option<String>,
    /// Absolute file or directory paths.
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub project: ProjectSummary,
    pub package: PackageSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub package: PackageSummary,
    pub files_verified: u64,
}

/// Recorded project state next to the state folded from its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectAudit {
    pub project_id: ProjectId,
    pub recorded_state: ProjectState,
    pub replayed_state: Option<ProjectState>,
    pub events: usize,
}

impl ProjectAudit {
    pub fn is_consistent(&self) -> bool {
        self.replayed_state == Some(self.recorded_state)
    }
}

/// Ingestion and packaging operations of one vault.
pub struct Archiver<'v> {
    vault: &'v Vault,
}

impl<'v> Archiver<'v> {
    pub fn new(vault: &'v Vault) -> Self {
        Self { vault }
    }

    /// Records a new project for `request.paths` and packages it.
    ///
    /// # Contract
    /// - Invalid names or paths fail with `InputInvalid` and record nothing.
    /// - A packaging failure returns `PackagingFailed`; the project stays
    ///   recorded in `Failed` and can be retried with `create_package`.
    pub fn archive(
        &self,
        request: &ArchiveRequest,
        cancel: &CancelToken,
    ) -> VaultResult<ArchiveOutcome> {
        let started = Instant::now();
        let now = now_epoch_ms();
        let project = ArchivedProject::new(request.name.clone(), request.description.clone(), now);
        project.validate()?;
        let sources = expand_inputs(&request.paths)?;
        let total_size: u64 = sources.iter().map(|source| source.size).sum();

        self.vault.with_tx(|tx| {
            let projects = SqliteProjectRepository::new(tx);
            projects.create_project(&project)?;
            projects.replace_sources(project.uuid, &request.paths)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::ProjectCreated,
                    project.uuid,
                    json!({
                        "name": project.name,
                        "input_paths": request.paths.len(),
                        "file_count": sources.len(),
                        "total_size": total_size,
                    }),
                ),
                now,
            )?;
            Ok(())
        })?;
        info!(
            "event=project_create module=archiver status=ok project_id={} files={} bytes={}",
            project.uuid,
            sources.len(),
            total_size
        );

        let package = self.package_project(project.uuid, sources, cancel)?;
        let summary = self.project(project.uuid)?;
        info!(
            "event=archive module=archiver status=ok project_id={} package_id={} duration_ms={}",
            project.uuid,
            package.package_id,
            started.elapsed().as_millis()
        );
        Ok(ArchiveOutcome {
            project: summary,
            package,
        })
    }

    /// Packages a recorded project, or returns its existing package.
    pub fn create_package(
        &self,
        project_id: ProjectId,
        cancel: &CancelToken,
    ) -> VaultResult<PackageSummary> {
        let (project, existing) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            let existing = SqlitePackageRepository::new(conn).get_package_for_project(project_id)?;
            Ok((project, existing))
        })?;

        match project.state {
            ProjectState::Active => existing.map(|package| package.summary()).ok_or_else(|| {
                VaultError::NotFound {
                    entity: "package",
                    id: project_id.to_string(),
                }
            }),
            ProjectState::Pending | ProjectState::Failed => {
                let paths = self.vault.with_db(|conn| {
                    Ok(SqliteProjectRepository::new(conn).list_sources(project_id)?)
                })?;
                let sources = expand_inputs(&paths)?;
                self.package_project(project_id, sources, cancel)
            }
            _ => Err(state_error(&project, "package")),
        }
    }

    /// Re-verifies the project's package and records the outcome.
    pub fn validate_package(
        &self,
        project_id: ProjectId,
        cancel: &CancelToken,
    ) -> VaultResult<ValidationOutcome> {
        let started = Instant::now();
        let _guard = self.vault.locks().acquire(project_id);
        let (package, files, bag_root) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            if project.state != ProjectState::Active {
                return Err(state_error(&project, "validate"));
            }
            let packages = SqlitePackageRepository::new(conn);
            let package = load_package(&packages, project_id)?;
            let files = packages.list_files(package.uuid)?;
            let bag_rel = load_location(&packages, package.uuid, LocationKind::Bag)?;
            Ok((package, files, self.vault.layout().resolve(&bag_rel)))
        })?;

        let result = BagReader::open(&bag_root)
            .and_then(|reader| reader.verify(cancel))
            .map_err(VaultError::from)
            .and_then(|verified| {
                let mismatches = compare_with_recorded(&files, &verified.digests);
                if mismatches.is_empty() {
                    Ok(verified.payload_files)
                } else {
                    Err(VaultError::ChecksumMismatch { paths: mismatches })
                }
            });

        let now = now_epoch_ms();
        match result {
            Ok(files_verified) => {
                self.record_validation(&package, true, None, now)?;
                info!(
                    "event=package_validate module=archiver status=ok project_id={} files={} duration_ms={}",
                    project_id,
                    files_verified,
                    started.elapsed().as_millis()
                );
                let mut package = package;
                package.is_valid = true;
                package.validated_at = Some(now);
                Ok(ValidationOutcome {
                    package: package.summary(),
                    files_verified,
                })
            }
            Err(err @ (VaultError::ChecksumMismatch { .. }
            | VaultError::InvalidPackageStructure { .. })) => {
                self.record_validation(&package, false, Some(&err), now)?;
                warn!(
                    "event=package_validate module=archiver status=error project_id={} error_kind={} paths={}",
                    project_id,
                    err.kind(),
                    err.paths().len()
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Removes staging directories retained by failed packaging attempts.
    ///
    /// Returns the number of directories removed.
    pub fn cleanup_failed_packages(&self, project_id: ProjectId) -> VaultResult<u64> {
        let _guard = self.vault.locks().acquire(project_id);
        let project = self.vault.with_db(|conn| load_project(conn, project_id))?;
        if project.state == ProjectState::Packaging {
            return Err(state_error(&project, "clean up"));
        }

        let staging = self.vault.layout().staging_dir();
        let prefix = format!("{project_id}--");
        let mut removed = 0u64;
        let entries = match fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(VaultError::io(staging.display(), err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| VaultError::io(staging.display(), err))?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            remove_tree(&path).map_err(|err| VaultError::io(path.display(), err))?;
            removed += 1;
        }

        if removed > 0 {
            self.vault.with_tx(|tx| {
                SqliteEventStore::new(tx).append(&NewEvent::new(
                    EventType::StagingCleaned,
                    project_id,
                    json!({ "removed": removed }),
                ))?;
                Ok(())
            })?;
        }
        info!(
            "event=staging_cleanup module=archiver status=ok project_id={} removed={}",
            project_id, removed
        );
        Ok(removed)
    }

    /// Replaces the user-visible copy with the payload of the verified bag.
    pub fn rebuild_user_copy(
        &self,
        project_id: ProjectId,
        cancel: &CancelToken,
    ) -> VaultResult<ProjectSummary> {
        let _guard = self.vault.locks().acquire(project_id);
        let layout = self.vault.layout();
        let (project, bag_root, user_rel) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            if project.state != ProjectState::Active {
                return Err(state_error(&project, "rebuild"));
            }
            let packages = SqlitePackageRepository::new(conn);
            let package = load_package(&packages, project_id)?;
            let bag_rel = load_location(&packages, package.uuid, LocationKind::Bag)?;
            let user_rel = packages.get_location(project_id, LocationKind::UserCopy)?;
            Ok((project, layout.resolve(&bag_rel), user_rel))
        })?;

        let verified = BagReader::open(&bag_root)?.verify(cancel)?;
        let user_rel = match user_rel {
            Some(rel) => rel,
            None => user_copy_rel(&project),
        };
        let user_dest = layout.resolve(&user_rel);
        let staged = self.stage_user_copy(&bag_root)?;

        let displaced = if user_dest.exists() {
            let aside = layout.tmp_dir().join(format!("displaced-{}", Uuid::new_v4().simple()));
            if let Err(err) = rename_with_retry(&user_dest, &aside, &self.vault.retry_policy()) {
                discard(&staged);
                return Err(VaultError::io(user_dest.display(), err));
            }
            Some(aside)
        } else {
            None
        };
        if let Err(err) = self.install_user_copy(&staged, &user_dest) {
            if let Some(aside) = &displaced {
                let retry = self.vault.retry_policy();
                if let Err(undo) = rename_with_retry(aside, &user_dest, &retry) {
                    error!(
                        "event=user_copy_rebuild module=archiver status=error project_id={} stage=undo error={}",
                        project_id, undo
                    );
                }
            }
            return Err(err);
        }
        if let Some(aside) = &displaced {
            discard(aside);
        }

        self.vault.with_tx(|tx| {
            SqlitePackageRepository::new(tx).set_location(
                project_id,
                LocationKind::UserCopy,
                &user_rel,
                now_epoch_ms(),
            )?;
            SqliteEventStore::new(tx).append(&NewEvent::new(
                EventType::UserCopyRebuilt,
                project_id,
                json!({
                    "files": verified.payload_files,
                    "bytes": verified.payload_bytes,
                    "replaced_existing": displaced.is_some(),
                }),
            ))?;
            Ok(())
        })?;
        info!(
            "event=user_copy_rebuild module=archiver status=ok project_id={} files={}",
            project_id, verified.payload_files
        );
        Ok(project.summary())
    }

    /// Project summaries ordered newest first.
    pub fn list_projects(&self, query: &ProjectListQuery) -> VaultResult<Vec<ProjectSummary>> {
        self.vault.with_db(|conn| {
            let projects = SqliteProjectRepository::new(conn).list_projects(query)?;
            Ok(projects.iter().map(ArchivedProject::summary).collect())
        })
    }

    pub fn project(&self, project_id: ProjectId) -> VaultResult<ProjectSummary> {
        self.vault
            .with_db(|conn| load_project(conn, project_id).map(|project| project.summary()))
    }

    pub fn package(&self, project_id: ProjectId) -> VaultResult<PackageSummary> {
        self.vault.with_db(|conn| {
            load_package(&SqlitePackageRepository::new(conn), project_id)
                .map(|package| package.summary())
        })
    }

    /// Recorded fixity of every payload file of the project's package.
    pub fn package_files(&self, project_id: ProjectId) -> VaultResult<Vec<PackageFile>> {
        self.vault.with_db(|conn| {
            let packages = SqlitePackageRepository::new(conn);
            let package = load_package(&packages, project_id)?;
            Ok(packages.list_files(package.uuid)?)
        })
    }

    /// Compares the recorded state with the state replayed from events.
    pub fn audit_project(&self, project_id: ProjectId) -> VaultResult<ProjectAudit> {
        self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            let history = SqliteEventStore::new(conn).history(project_id)?;
            Ok(ProjectAudit {
                project_id,
                recorded_state: project.state,
                replayed_state: replay_project_state(&history),
                events: history.len(),
            })
        })
    }

    /// Fails every project left in `Packaging` by an interrupted process.
    ///
    /// A bag finalized by the lost attempt is moved back to staging and a
    /// user copy it installed is removed, so a retry starts clean. Runs on
    /// open, before any packaging can be in flight.
    pub(crate) fn recover_interrupted(&self) -> VaultResult<Vec<ProjectId>> {
        let stuck = self.vault.with_db(|conn| {
            let projects = SqliteProjectRepository::new(conn)
                .list_projects(&ProjectListQuery::in_states(&[ProjectState::Packaging]))?;
            let events = SqliteEventStore::new(conn);
            let mut stuck = Vec::with_capacity(projects.len());
            for project in projects {
                let package_id = events
                    .history(project.uuid)?
                    .iter()
                    .rev()
                    .find(|event| event.event_type == EventType::PackagingStarted)
                    .and_then(|event| event.payload["package_id"].as_str())
                    .and_then(|text| Uuid::parse_str(text).ok());
                stuck.push((project, package_id));
            }
            Ok(stuck)
        })?;

        let layout = self.vault.layout();
        let mut recovered = Vec::with_capacity(stuck.len());
        for (project, package_id) in stuck {
            let _guard = self.vault.locks().acquire(project.uuid);
            let staging = package_id.map(|package_id| {
                layout
                    .staging_dir()
                    .join(format!("{}--{package_id}", project.uuid))
            });
            if let (Some(package_id), Some(staging)) = (package_id, staging.as_deref()) {
                let bag = layout.bags_dir().join(format!(
                    "{}-{}",
                    sanitize_dir_name(&project.name),
                    short_id(package_id)
                ));
                if bag.exists() && !staging.exists() {
                    self.unfinalize(&bag, staging);
                }
                discard(&layout.resolve(&user_copy_rel(&project)));
            }
            let retained = staging.as_deref().is_some_and(Path::exists);

            self.vault.with_tx(|tx| {
                let mut failed = load_project(tx, project.uuid)?;
                if failed.state != ProjectState::Packaging {
                    return Ok(());
                }
                let now = now_epoch_ms();
                failed.state = ProjectState::Failed;
                failed.last_error = Some(INTERRUPTED.to_string());
                failed.updated_at = now;
                SqliteProjectRepository::new(tx).update_project(&failed)?;
                SqliteEventStore::new(tx).append_at(
                    &NewEvent::new(
                        EventType::PackagingFailed,
                        project.uuid,
                        json!({
                            "package_id": package_id,
                            "error_kind": INTERRUPTED,
                            "paths": Vec::<String>::new(),
                            "staging_retained": retained,
                        }),
                    ),
                    now,
                )?;
                Ok(())
            })?;
            warn!(
                "event=package_recover module=archiver status=recovered project_id={} staging_retained={}",
                project.uuid, retained
            );
            recovered.push(project.uuid);
        }
        Ok(recovered)
    }

    fn package_project(
        &self,
        project_id: ProjectId,
        sources: Vec<SourceFile>,
        cancel: &CancelToken,
    ) -> VaultResult<PackageSummary> {
        let started = Instant::now();
        let package_id = Uuid::new_v4();
        let project = self.claim_for_packaging(project_id, package_id, sources.len())?;

        let layout = self.vault.layout();
        let staging = layout
            .staging_dir()
            .join(format!("{project_id}--{package_id}"));
        let bag_dest = layout.bags_dir().join(format!(
            "{}-{}",
            sanitize_dir_name(&project.name),
            short_id(package_id)
        ));
        let user_rel = user_copy_rel(&project);

        let built = self
            .build_bag(&project, package_id, &staging, &bag_dest, sources, cancel)
            .and_then(|finalized| {
                let user_dest = layout.resolve(&user_rel);
                match self
                    .stage_user_copy(&finalized.root)
                    .and_then(|staged| self.install_user_copy(&staged, &user_dest))
                {
                    Ok(()) => Ok(finalized),
                    Err(err) => {
                        self.unfinalize(&finalized.root, &staging);
                        Err(err)
                    }
                }
            });

        let _guard = self.vault.locks().acquire(project_id);
        let outcome = built.and_then(|finalized| {
            self.commit_package(&project, package_id, &finalized, &user_rel)
                .map_err(|err| {
                    discard(&layout.resolve(&user_rel));
                    self.unfinalize(&finalized.root, &staging);
                    err
                })
        });

        match outcome {
            Ok(summary) => {
                info!(
                    "event=package_create module=archiver status=ok project_id={} package_id={} files={} bytes={} duration_ms={}",
                    project_id,
                    package_id,
                    summary.payload_files,
                    summary.payload_bytes,
                    started.elapsed().as_millis()
                );
                Ok(summary)
            }
            Err(err) => {
                self.record_failure(project_id, package_id, &staging, &err);
                Err(VaultError::PackagingFailed {
                    project_id,
                    source: Box::new(err),
                })
            }
        }
    }

    fn claim_for_packaging(
        &self,
        project_id: ProjectId,
        package_id: Uuid,
        files: usize,
    ) -> VaultResult<ArchivedProject> {
        let _guard = self.vault.locks().acquire(project_id);
        self.vault.with_tx(|tx| {
            let projects = SqliteProjectRepository::new(tx);
            let mut project = load_project(tx, project_id)?;
            if !project.state.can_start_packaging() {
                return Err(state_error(&project, "package"));
            }
            let now = now_epoch_ms();
            project.state = ProjectState::Packaging;
            project.updated_at = now;
            projects.update_project(&project)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::PackagingStarted,
                    project_id,
                    json!({ "package_id": package_id, "files": files }),
                ),
                now,
            )?;
            Ok(project)
        })
    }

    fn build_bag(
        &self,
        project: &ArchivedProject,
        package_id: Uuid,
        staging: &Path,
        dest: &Path,
        sources: Vec<SourceFile>,
        cancel: &CancelToken,
    ) -> VaultResult<FinalizedBag> {
        let config = self.vault.config();
        let request = BagRequest {
            package_id,
            project_id: project.uuid,
            project_name: project.name.clone(),
            description: project.description.clone(),
            software_agent: config.software_agent.clone(),
            source_organization: config.source_organization.clone(),
            manifest_algorithms: config.manifest_algorithms.clone(),
            fixity_algorithms: config.fixity_algorithms.clone(),
            bagging_date: Utc::now().date_naive(),
        };
        let mut builder =
            BagBuilder::reserve(request, staging, sources, self.vault.retry_policy())?;
        Ok(builder.run(cancel, dest)?)
    }

    fn commit_package(
        &self,
        project: &ArchivedProject,
        package_id: Uuid,
        finalized: &FinalizedBag,
        user_rel: &str,
    ) -> VaultResult<PackageSummary> {
        let bag_rel = self.vault.layout().relative(&finalized.root).ok_or_else(|| {
            VaultError::InvalidPackageStructure {
                path: finalized.root.display().to_string(),
                reason: "package root is outside the vault".to_string(),
            }
        })?;
        let now = now_epoch_ms();
        let package = BagitPackage {
            uuid: package_id,
            project_uuid: project.uuid,
            root_path: bag_rel.clone(),
            manifest_algorithms: self.vault.config().manifest_algorithms.clone(),
            manifest_digest: finalized.manifest_digest.clone(),
            bag_size: finalized.bag_bytes,
            payload_bytes: finalized.payload_bytes,
            payload_files: finalized.payload_files,
            is_valid: true,
            validated_at: Some(now),
            created_at: now,
        };
        let files: Vec<PackageFile> = finalized
            .entries
            .iter()
            .map(|entry| PackageFile {
                rel_path: entry.rel_path.clone(),
                size: entry.size,
                digests: entry.digests.clone(),
            })
            .collect();

        self.vault.with_tx(|tx| {
            let projects = SqliteProjectRepository::new(tx);
            let packages = SqlitePackageRepository::new(tx);
            let events = SqliteEventStore::new(tx);

            let mut current = load_project(tx, project.uuid)?;
            if current.state != ProjectState::Packaging {
                return Err(state_error(&current, "commit package for"));
            }
            packages.create_package(&package, &files)?;
            packages.set_location(package_id, LocationKind::Bag, &bag_rel, now)?;
            packages.set_location(project.uuid, LocationKind::UserCopy, user_rel, now)?;
            events.append_at(
                &NewEvent::new(
                    EventType::PackageCreated,
                    project.uuid,
                    json!({
                        "package_id": package_id,
                        "root_path": bag_rel,
                        "manifest_algorithm": finalized.manifest_algorithm,
                        "manifest_digest": finalized.manifest_digest,
                        "payload_files": finalized.payload_files,
                        "payload_bytes": finalized.payload_bytes,
                        "bag_size": finalized.bag_bytes,
                    }),
                ),
                now,
            )?;

            current.state = ProjectState::Active;
            current.package_uuid = Some(package_id);
            current.file_count = finalized.payload_files;
            current.total_size = finalized.payload_bytes;
            current.last_error = None;
            current.archived_at = Some(now);
            current.updated_at = now;
            projects.update_project(&current)?;
            events.append_at(
                &NewEvent::new(
                    EventType::ProjectArchived,
                    project.uuid,
                    json!({
                        "package_id": package_id,
                        "file_count": current.file_count,
                        "total_size": current.total_size,
                        "user_copy": user_rel,
                    }),
                ),
                now,
            )?;
            Ok(package.summary())
        })
    }

    // Moves a finalized package back to staging so the failed attempt
    // stays inspectable and nothing under `.bags/` is left unrecorded.
    fn unfinalize(&self, bag_root: &Path, staging: &Path) {
        if let Err(err) = rename_with_retry(bag_root, staging, &self.vault.retry_policy()) {
            error!(
                "event=package_unfinalize module=archiver status=error root={} error={}",
                bag_root.display(),
                err
            );
        }
    }

    fn record_failure(
        &self,
        project_id: ProjectId,
        package_id: Uuid,
        staging: &Path,
        err: &VaultError,
    ) {
        let kind = err.kind();
        let retained = staging.exists();
        let result = self.vault.with_tx(|tx| {
            let projects = SqliteProjectRepository::new(tx);
            let mut project = load_project(tx, project_id)?;
            let now = now_epoch_ms();
            if project.state == ProjectState::Packaging {
                project.state = ProjectState::Failed;
            }
            project.last_error = Some(kind.as_str().to_string());
            project.updated_at = now;
            projects.update_project(&project)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::PackagingFailed,
                    project_id,
                    json!({
                        "package_id": package_id,
                        "error_kind": kind.as_str(),
                        "paths": err.paths(),
                        "staging_retained": retained,
                    }),
                ),
                now,
            )?;
            Ok(())
        });
        match result {
            Ok(()) => warn!(
                "event=package_create module=archiver status=error project_id={} package_id={} error_kind={}",
                project_id, package_id, kind
            ),
            Err(record_err) => error!(
                "event=package_create module=archiver status=error project_id={} stage=record_failure error_kind={} error={}",
                project_id,
                record_err.kind(),
                record_err
            ),
        }
    }

    fn record_validation(
        &self,
        package: &BagitPackage,
        is_valid: bool,
        err: Option<&VaultError>,
        now: i64,
    ) -> VaultResult<()> {
        self.vault.with_tx(|tx| {
            SqlitePackageRepository::new(tx).record_validation(package.uuid, is_valid, now)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::PackageValidated,
                    package.project_uuid,
                    json!({
                        "package_id": package.uuid,
                        "is_valid": is_valid,
                        "error_kind": err.map(|err| err.kind().as_str()),
                        "paths": err.map(VaultError::paths).unwrap_or_default(),
                    }),
                ),
                now,
            )?;
            Ok(())
        })
    }

    // Copies the bag payload into `.system/tmp`; the caller renames it.
    fn stage_user_copy(&self, bag_root: &Path) -> VaultResult<PathBuf> {
        let staged = self
            .vault
            .layout()
            .tmp_dir()
            .join(format!("user-{}", Uuid::new_v4().simple()));
        let data_dir = bag_root.join(DATA_DIR);
        copy_tree(&data_dir, &staged, &self.vault.retry_policy()).map_err(|err| {
            discard(&staged);
            VaultError::io(data_dir.display(), err)
        })?;
        Ok(staged)
    }

    fn install_user_copy(&self, staged: &Path, dest: &Path) -> VaultResult<()> {
        if dest.exists() {
            discard(staged);
            return Err(VaultError::io(
                dest.display(),
                io::Error::new(io::ErrorKind::AlreadyExists, "user copy destination exists"),
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| VaultError::io(parent.display(), err))?;
        }
        rename_with_retry(staged, dest, &self.vault.retry_policy()).map_err(|err| {
            discard(staged);
            VaultError::io(dest.display(), err)
        })
    }
}

fn load_package(
    packages: &SqlitePackageRepository<'_>,
    project_id: ProjectId,
) -> VaultResult<BagitPackage> {
    packages
        .get_package_for_project(project_id)?
        .ok_or_else(|| VaultError::NotFound {
            entity: "package",
            id: project_id.to_string(),
        })
}

fn load_location(
    packages: &SqlitePackageRepository<'_>,
    entity: Uuid,
    kind: LocationKind,
) -> VaultResult<String> {
    packages
        .get_location(entity, kind)?
        .ok_or_else(|| VaultError::NotFound {
            entity: "location",
            id: format!("{entity}/{}", kind.as_str()),
        })
}

fn user_copy_rel(project: &ArchivedProject) -> String {
    format!(
        "{}/{}-{}",
        crate::layout::PROJECTS_DIR,
        sanitize_dir_name(&project.name),
        short_id(project.uuid)
    )
}

fn discard(path: &Path) {
    if let Err(err) = remove_tree(path) {
        warn!(
            "event=tree_remove module=archiver status=error path={} error={}",
            path.display(),
            err
        );
    }
}

// Paths whose fresh digests disagree with the recorded fixity, or that
// exist on only one side.
fn compare_with_recorded(
    recorded: &[PackageFile],
    fresh: &BTreeMap<String, crate::checksum::DigestSet>,
) -> Vec<String> {
    let mut mismatches = BTreeSet::new();
    let mut seen = BTreeSet::new();
    for file in recorded {
        let path = format!("{DATA_DIR}/{}", file.rel_path);
        match fresh.get(&path) {
            Some(digests) => {
                let disagrees = digests.iter().any(|(algorithm, digest)| {
                    file.digests
                        .get(algorithm)
                        .is_some_and(|recorded| recorded != digest)
                });
                if disagrees {
                    mismatches.insert(path.clone());
                }
            }
            None => {
                mismatches.insert(path.clone());
            }
        }
        seen.insert(path);
    }
    mismatches.extend(fresh.keys().filter(|path| !seen.contains(*path)).cloned());
    mismatches.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::compare_with_recorded;
    use crate::checksum::{Algorithm, DigestSet};
    use crate::model::package::PackageFile;
    use std::collections::BTreeMap;

    fn digests(value: &str) -> DigestSet {
        DigestSet::from([(Algorithm::Sha256, value.to_string())])
    }

    #[test]
    fn recorded_fixity_comparison_reports_both_sides() {
        let recorded = vec![
            PackageFile {
                rel_path: "a.txt".to_string(),
                size: 1,
                digests: digests("aa"),
            },
            PackageFile {
                rel_path: "b.txt".to_string(),
                size: 1,
                digests: digests("bb"),
            },
        ];
        let fresh = BTreeMap::from([
            ("data/a.txt".to_string(), digests("aa")),
            ("data/c.txt".to_string(), digests("cc")),
        ]);

        assert_eq!(
            compare_with_recorded(&recorded, &fresh),
            vec!["data/b.txt".to_string(), "data/c.txt".to_string()]
        );
    }

    #[test]
    fn matching_fixity_has_no_mismatches() {
        let recorded = vec![PackageFile {
            rel_path: "dir/a.txt".to_string(),
            size: 1,
            digests: digests("aa"),
        }];
        let fresh = BTreeMap::from([("data/dir/a.txt".to_string(), digests("aa"))]);
        assert!(compare_with_recorded(&recorded, &fresh).is_empty());
    }
}

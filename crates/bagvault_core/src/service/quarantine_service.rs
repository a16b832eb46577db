//! Soft-delete lifecycle: quarantine, restore, reschedule and purge.
//!
//! # Responsibility
//! - Move a project's bag and user copy into `.quarantine/<project-id>/`
//!   and back, by rename only.
//! - Permanently delete quarantined bytes once the grace period elapses
//!   (or on explicit force).
//!
//! # Invariants
//! - Each transition holds the project lock for its whole duration.
//! - Filesystem moves happen first and are undone if the database
//!   transition fails; the database never points at a moved directory.
//! - Purge is the only operation that destroys payload bytes, and it
//!   commits the `Purged` transition before deleting them.

use crate::error::{VaultError, VaultResult};
use crate::fsops::{remove_tree, rename_with_retry};
use crate::model::event::{EventType, NewEvent};
use crate::model::now_epoch_ms;
use crate::model::package::LocationKind;
use crate::model::project::{ProjectId, ProjectState, ProjectSummary};
use crate::model::quarantine::{PurgeSweepReport, QuarantineEntry};
use crate::repo::event_store::{EventStore, SqliteEventStore};
use crate::repo::package_repo::{LocationRepository, PackageRepository, SqlitePackageRepository};
use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use crate::repo::quarantine_repo::{QuarantineRepository, SqliteQuarantineRepository};
use crate::service::vault::Vault;
use crate::service::{load_project, state_error};
use log::{error, info, warn};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const BAG_SLOT: &str = "bag";
const USER_SLOT: &str = "user";

/// Quarantine operations of one vault.
pub struct QuarantineManager<'v> {
    vault: &'v Vault,
}

impl<'v> QuarantineManager<'v> {
    pub fn new(vault: &'v Vault) -> Self {
        Self { vault }
    }

    /// Soft-deletes an `Active` project and schedules its purge.
    pub fn quarantine(
        &self,
        project_id: ProjectId,
        reason: Option<&str>,
    ) -> VaultResult<QuarantineEntry> {
        let _guard = self.vault.locks().acquire(project_id);
        let layout = self.vault.layout();
        let (mut project, package_id, bag_rel, user_rel) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            match project.state {
                ProjectState::Active => {}
                ProjectState::Quarantined => {
                    return Err(VaultError::conflict(project_id, "project is already quarantined"))
                }
                _ => return Err(state_error(&project, "quarantine")),
            }
            if SqliteQuarantineRepository::new(conn)
                .get_entry_for_project(project_id)?
                .is_some()
            {
                return Err(VaultError::conflict(
                    project_id,
                    "project already has a quarantine entry",
                ));
            }
            let packages = SqlitePackageRepository::new(conn);
            let package = packages
                .get_package_for_project(project_id)?
                .ok_or_else(|| VaultError::NotFound {
                    entity: "package",
                    id: project_id.to_string(),
                })?;
            let bag_rel = packages
                .get_location(package.uuid, LocationKind::Bag)?
                .ok_or_else(|| VaultError::NotFound {
                    entity: "location",
                    id: format!("{}/{}", package.uuid, LocationKind::Bag.as_str()),
                })?;
            let user_rel = packages.get_location(project_id, LocationKind::UserCopy)?;
            Ok((project, package.uuid, bag_rel, user_rel))
        })?;

        let slot = layout.quarantine_slot(&project_id.to_string());
        let slot_rel = relative_or_conflict(self.vault, project_id, &slot)?;
        if slot.exists() {
            return Err(VaultError::conflict(
                project_id,
                format!("quarantine directory `{slot_rel}` already exists"),
            ));
        }
        fs::create_dir_all(&slot).map_err(|err| VaultError::io(slot.display(), err))?;

        let mut moves = vec![(layout.resolve(&bag_rel), slot.join(BAG_SLOT))];
        let user_rel = user_rel.filter(|rel| layout.resolve(rel).exists());
        if let Some(rel) = &user_rel {
            moves.push((layout.resolve(rel), slot.join(USER_SLOT)));
        }
        if let Err(err) = self.move_all(&moves) {
            remove_empty_dir(&slot);
            return Err(err);
        }

        let now = now_epoch_ms();
        let entry = QuarantineEntry {
            uuid: Uuid::new_v4(),
            project_uuid: project_id,
            quarantined_at: now,
            original_bag_path: bag_rel,
            original_user_path: user_rel.clone(),
            quarantine_path: slot_rel.clone(),
            purge_at: now.saturating_add(self.vault.config().grace_period_ms()),
            reason: reason
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        };
        let committed = self.vault.with_tx(|tx| {
            let packages = SqlitePackageRepository::new(tx);
            project.state = ProjectState::Quarantined;
            project.updated_at = now;
            SqliteProjectRepository::new(tx).update_project(&project)?;
            packages.set_location(
                package_id,
                LocationKind::Bag,
                &format!("{slot_rel}/{BAG_SLOT}"),
                now,
            )?;
            if user_rel.is_some() {
                packages.set_location(
                    project_id,
                    LocationKind::UserCopy,
                    &format!("{slot_rel}/{USER_SLOT}"),
                    now,
                )?;
            } else {
                packages.delete_location(project_id, LocationKind::UserCopy)?;
            }
            SqliteQuarantineRepository::new(tx).create_entry(&entry)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::ProjectQuarantined,
                    project_id,
                    json!({
                        "package_id": package_id,
                        "reason": entry.reason,
                        "purge_at": entry.purge_at,
                        "quarantine_path": entry.quarantine_path,
                    }),
                ),
                now,
            )?;
            Ok(())
        });
        if let Err(err) = committed {
            self.undo_moves(&moves);
            remove_empty_dir(&slot);
            return Err(err);
        }

        info!(
            "event=quarantine module=quarantine status=ok project_id={} package_id={} purge_at={}",
            project_id, package_id, entry.purge_at
        );
        Ok(entry)
    }

    /// Moves a quarantined project back to its original locations.
    pub fn restore(&self, project_id: ProjectId) -> VaultResult<ProjectSummary> {
        let _guard = self.vault.locks().acquire(project_id);
        let layout = self.vault.layout();
        let (mut project, entry, package_id) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            let entry = SqliteQuarantineRepository::new(conn)
                .get_entry_for_project(project_id)?
                .ok_or(VaultError::QuarantineEntryNotFound(project_id))?;
            if project.state != ProjectState::Quarantined {
                return Err(state_error(&project, "restore"));
            }
            let package = SqlitePackageRepository::new(conn)
                .get_package_for_project(project_id)?
                .ok_or_else(|| VaultError::NotFound {
                    entity: "package",
                    id: project_id.to_string(),
                })?;
            Ok((project, entry, package.uuid))
        })?;

        let slot = layout.resolve(&entry.quarantine_path);
        let mut moves = vec![(
            slot.join(BAG_SLOT),
            layout.resolve(&entry.original_bag_path),
        )];
        let user_back = entry
            .original_user_path
            .clone()
            .filter(|_| slot.join(USER_SLOT).exists());
        if let Some(rel) = &user_back {
            moves.push((slot.join(USER_SLOT), layout.resolve(rel)));
        }
        if let Some((_, occupied)) = moves.iter().find(|(_, to)| to.exists()) {
            return Err(VaultError::conflict(
                project_id,
                format!("original location `{}` is occupied", occupied.display()),
            ));
        }
        self.move_all(&moves)?;

        let now = now_epoch_ms();
        let committed = self.vault.with_tx(|tx| {
            let packages = SqlitePackageRepository::new(tx);
            project.state = ProjectState::Active;
            project.updated_at = now;
            SqliteProjectRepository::new(tx).update_project(&project)?;
            packages.set_location(package_id, LocationKind::Bag, &entry.original_bag_path, now)?;
            match &user_back {
                Some(rel) => packages.set_location(project_id, LocationKind::UserCopy, rel, now)?,
                None => packages.delete_location(project_id, LocationKind::UserCopy)?,
            }
            SqliteQuarantineRepository::new(tx).delete_entry(project_id)?;
            SqliteEventStore::new(tx).append_at(
                &NewEvent::new(
                    EventType::ProjectRestored,
                    project_id,
                    json!({
                        "package_id": package_id,
                        "quarantined_at": entry.quarantined_at,
                        "user_copy_restored": user_back.is_some(),
                    }),
                ),
                now,
            )?;
            Ok(())
        });
        if let Err(err) = committed {
            self.undo_moves(&moves);
            return Err(err);
        }
        remove_empty_dir(&slot);

        info!(
            "event=restore module=quarantine status=ok project_id={} package_id={}",
            project_id, package_id
        );
        Ok(project.summary())
    }

    /// Changes when a quarantined project becomes eligible for purge.
    pub fn reschedule_purge(
        &self,
        project_id: ProjectId,
        purge_at: i64,
    ) -> VaultResult<QuarantineEntry> {
        let _guard = self.vault.locks().acquire(project_id);
        let entry = self.vault.with_tx(|tx| {
            let quarantine = SqliteQuarantineRepository::new(tx);
            let mut entry = quarantine
                .get_entry_for_project(project_id)?
                .ok_or(VaultError::QuarantineEntryNotFound(project_id))?;
            let previous = entry.purge_at;
            quarantine.update_purge_at(project_id, purge_at)?;
            SqliteEventStore::new(tx).append(&NewEvent::new(
                EventType::PurgeRescheduled,
                project_id,
                json!({ "previous_purge_at": previous, "purge_at": purge_at }),
            ))?;
            entry.purge_at = purge_at;
            Ok(entry)
        })?;
        info!(
            "event=purge_reschedule module=quarantine status=ok project_id={} purge_at={}",
            project_id, purge_at
        );
        Ok(entry)
    }

    /// Permanently deletes a quarantined project's bytes.
    ///
    /// Rejected before the scheduled purge time unless `force` is set.
    pub fn purge(&self, project_id: ProjectId, force: bool) -> VaultResult<()> {
        self.purge_project(project_id, force, now_epoch_ms())
    }

    /// Purges every entry whose purge time has elapsed.
    pub fn purge_expired(&self) -> VaultResult<PurgeSweepReport> {
        self.purge_expired_at(now_epoch_ms())
    }

    /// Sweep evaluated at `now_ms`. One failed purge does not stop the sweep.
    pub fn purge_expired_at(&self, now_ms: i64) -> VaultResult<PurgeSweepReport> {
        let expired = self
            .vault
            .with_db(|conn| Ok(SqliteQuarantineRepository::new(conn).list_expired(now_ms)?))?;
        let mut report = PurgeSweepReport::default();
        for entry in expired {
            match self.purge_project(entry.project_uuid, false, now_ms) {
                Ok(()) => report.purged.push(entry.project_uuid),
                Err(err) => {
                    warn!(
                        "event=purge_sweep module=quarantine status=error project_id={} error_kind={}",
                        entry.project_uuid,
                        err.kind()
                    );
                    report.failed.push((entry.project_uuid, err.to_string()));
                }
            }
        }
        info!(
            "event=purge_sweep module=quarantine status=ok purged={} failed={}",
            report.purged.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Active quarantine entries, soonest purge first.
    pub fn list_entries(&self) -> VaultResult<Vec<QuarantineEntry>> {
        self.vault
            .with_db(|conn| Ok(SqliteQuarantineRepository::new(conn).list_entries()?))
    }

    pub fn entry(&self, project_id: ProjectId) -> VaultResult<QuarantineEntry> {
        self.vault.with_db(|conn| {
            SqliteQuarantineRepository::new(conn)
                .get_entry_for_project(project_id)?
                .ok_or(VaultError::QuarantineEntryNotFound(project_id))
        })
    }

    fn purge_project(&self, project_id: ProjectId, force: bool, now_ms: i64) -> VaultResult<()> {
        let _guard = self.vault.locks().acquire(project_id);
        let layout = self.vault.layout();
        let (mut project, entry, package_id) = self.vault.with_db(|conn| {
            let project = load_project(conn, project_id)?;
            if project.state == ProjectState::Purged {
                return Err(VaultError::conflict(project_id, "project is already purged"));
            }
            let entry = SqliteQuarantineRepository::new(conn)
                .get_entry_for_project(project_id)?
                .ok_or_else(|| VaultError::conflict(project_id, "project is not quarantined"))?;
            let package_id = SqlitePackageRepository::new(conn)
                .get_package_for_project(project_id)?
                .map(|package| package.uuid);
            Ok((project, entry, package_id))
        })?;
        if !force && !entry.is_expired(now_ms) {
            return Err(VaultError::conflict(
                project_id,
                format!("grace period runs until {}", entry.purge_at),
            ));
        }

        let slot = layout.resolve(&entry.quarantine_path);
        let doomed = layout
            .tmp_dir()
            .join(format!("purge-{}-{}", project_id.simple(), Uuid::new_v4().simple()));
        let moved = if slot.exists() {
            rename_with_retry(&slot, &doomed, &self.vault.retry_policy())
                .map_err(|err| VaultError::io(slot.display(), err))?;
            true
        } else {
            warn!(
                "event=purge module=quarantine status=warn project_id={} reason=quarantine_dir_missing",
                project_id
            );
            false
        };

        let committed = self.vault.with_tx(|tx| {
            let packages = SqlitePackageRepository::new(tx);
            if let Some(package_id) = package_id {
                packages.delete_location(package_id, LocationKind::Bag)?;
                packages.delete_package(package_id)?;
            }
            packages.delete_location(project_id, LocationKind::UserCopy)?;
            SqliteQuarantineRepository::new(tx).delete_entry(project_id)?;
            project.state = ProjectState::Purged;
            project.package_uuid = None;
            project.updated_at = now_epoch_ms();
            SqliteProjectRepository::new(tx).update_project(&project)?;
            SqliteEventStore::new(tx).append(&NewEvent::new(
                EventType::ProjectPurged,
                project_id,
                json!({
                    "package_id": package_id,
                    "forced": force,
                    "quarantined_at": entry.quarantined_at,
                    "purge_at": entry.purge_at,
                }),
            ))?;
            Ok(())
        });
        if let Err(err) = committed {
            if moved {
                self.undo_moves(&[(slot, doomed)]);
            }
            return Err(err);
        }

        if moved {
            if let Err(err) = remove_tree(&doomed) {
                warn!(
                    "event=purge module=quarantine status=warn project_id={} stage=delete path={} error={}",
                    project_id,
                    doomed.display(),
                    err
                );
            }
        }
        info!(
            "event=purge module=quarantine status=ok project_id={} forced={}",
            project_id, force
        );
        Ok(())
    }

    // Renames in order; a failure undoes the moves already made.
    fn move_all(&self, moves: &[(PathBuf, PathBuf)]) -> VaultResult<()> {
        let retry = self.vault.retry_policy();
        for (index, (from, to)) in moves.iter().enumerate() {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|err| VaultError::io(parent.display(), err))?;
            }
            if let Err(err) = rename_with_retry(from, to, &retry) {
                self.undo_moves(&moves[..index]);
                return Err(VaultError::io(from.display(), err));
            }
        }
        Ok(())
    }

    fn undo_moves(&self, done: &[(PathBuf, PathBuf)]) {
        let retry = self.vault.retry_policy();
        for (from, to) in done.iter().rev() {
            if let Err(err) = rename_with_retry(to, from, &retry) {
                error!(
                    "event=move_undo module=quarantine status=error from={} to={} error={}",
                    to.display(),
                    from.display(),
                    err
                );
            }
        }
    }
}

fn relative_or_conflict(
    vault: &Vault,
    project_id: ProjectId,
    path: &Path,
) -> VaultResult<String> {
    vault.layout().relative(path).ok_or_else(|| {
        VaultError::conflict(
            project_id,
            format!("`{}` is outside the vault", path.display()),
        )
    })
}

fn remove_empty_dir(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "event=dir_remove module=quarantine status=warn path={} error={}",
                path.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QuarantineManager;
    use crate::service::vault::Vault;
    use std::fs;

    #[test]
    fn failed_move_undoes_earlier_moves() {
        let root = tempfile::tempdir().unwrap();
        let vault = Vault::open(root.path()).unwrap();
        let manager = QuarantineManager::new(&vault);
        let first_from = root.path().join("first");
        let first_to = root.path().join("held").join("first");
        fs::create_dir(&first_from).unwrap();
        fs::write(first_from.join("a.txt"), b"kept").unwrap();

        let moves = vec![
            (first_from.clone(), first_to.clone()),
            (root.path().join("absent"), root.path().join("held").join("absent")),
        ];
        assert!(manager.move_all(&moves).is_err());

        assert_eq!(fs::read(first_from.join("a.txt")).unwrap(), b"kept");
        assert!(!first_to.exists());
    }
}

//! Vault facade.
//!
//! # Responsibility
//! - Own the layout, policy, database connection and project locks.
//! - Hand out the use-case services that borrow them.
//!
//! # Invariants
//! - Lock order is project lock, then database mutex. Code holding the
//!   database mutex never waits for a project lock.
//! - The database mutex is held for single statements or one transaction,
//!   never across payload I/O.

use crate::cancel::CancelToken;
use crate::config::VaultConfig;
use crate::db::open_db;
use crate::error::{VaultError, VaultResult};
use crate::fsops::RetryPolicy;
use crate::layout::VaultLayout;
use crate::model::event::Event;
use crate::model::package::{LocationKind, PackageSummary};
use crate::model::project::{ProjectId, ProjectSummary};
use crate::model::quarantine::QuarantineEntry;
use crate::repo::event_store::{EventQuery, EventStore, SqliteEventStore};
use crate::repo::package_repo::{LocationRepository, PackageRepository, SqlitePackageRepository};
use crate::repo::project_repo::ProjectListQuery;
use crate::service::archive_service::{ArchiveOutcome, ArchiveRequest, Archiver};
use crate::service::integrity_service::{IntegrityReport, IntegrityScanner};
use crate::service::locks::ProjectLocks;
use crate::service::quarantine_service::QuarantineManager;
use log::{info, warn};
use rusqlite::{Connection, Transaction};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Current on-disk locations of a project's bag and user copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLocations {
    pub bag: Option<PathBuf>,
    pub user_copy: Option<PathBuf>,
}

/// One opened vault root.
pub struct Vault {
    layout: VaultLayout,
    config: VaultConfig,
    db: Mutex<Connection>,
    locks: ProjectLocks,
}

impl Vault {
    /// Opens the vault at `root`, creating its areas and database when
    /// missing and loading `.system/config.json` when present.
    pub fn open(root: impl Into<PathBuf>) -> VaultResult<Self> {
        let layout = VaultLayout::new(root);
        layout
            .ensure()
            .map_err(|err| VaultError::io(layout.root().display(), err))?;
        let config = VaultConfig::load_or_default(&layout.config_path())?;
        Self::open_layout(layout, config)
    }

    /// Opens the vault with an explicit policy instead of the config file.
    pub fn open_with_config(root: impl Into<PathBuf>, config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let layout = VaultLayout::new(root);
        layout
            .ensure()
            .map_err(|err| VaultError::io(layout.root().display(), err))?;
        Self::open_layout(layout, config)
    }

    fn open_layout(layout: VaultLayout, config: VaultConfig) -> VaultResult<Self> {
        let conn = open_db(layout.db_path())?;
        info!(
            "event=vault_open module=vault status=ok grace_days={} scan_algorithm={}",
            config.grace_period_days, config.scan_algorithm
        );
        let vault = Self {
            layout,
            config,
            db: Mutex::new(conn),
            locks: ProjectLocks::new(),
        };
        let recovered = vault.archiver().recover_interrupted()?;
        if !recovered.is_empty() {
            warn!(
                "event=vault_open module=vault status=recovered interrupted_packaging={}",
                recovered.len()
            );
        }
        Ok(vault)
    }

    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.io_retry_attempts, self.config.retry_backoff())
    }

    pub fn archiver(&self) -> Archiver<'_> {
        Archiver::new(self)
    }

    pub fn quarantine_manager(&self) -> QuarantineManager<'_> {
        QuarantineManager::new(self)
    }

    pub fn scanner(&self) -> IntegrityScanner<'_> {
        IntegrityScanner::new(self)
    }

    /// Archives `request.paths` as a new project and packages it.
    pub fn archive(
        &self,
        request: &ArchiveRequest,
        cancel: &CancelToken,
    ) -> VaultResult<ArchiveOutcome> {
        self.archiver().archive(request, cancel)
    }

    pub fn create_package(
        &self,
        project_id: ProjectId,
        cancel: &CancelToken,
    ) -> VaultResult<PackageSummary> {
        self.archiver().create_package(project_id, cancel)
    }

    pub fn quarantine(&self, project_id: ProjectId, reason: &str) -> VaultResult<QuarantineEntry> {
        self.quarantine_manager().quarantine(project_id, Some(reason))
    }

    pub fn restore(&self, project_id: ProjectId) -> VaultResult<ProjectSummary> {
        self.quarantine_manager().restore(project_id)
    }

    pub fn scan_integrity(&self, cancel: &CancelToken) -> VaultResult<IntegrityReport> {
        self.scanner().scan(cancel)
    }

    pub fn list_projects(&self, query: &ProjectListQuery) -> VaultResult<Vec<ProjectSummary>> {
        self.archiver().list_projects(query)
    }

    pub fn project(&self, project_id: ProjectId) -> VaultResult<ProjectSummary> {
        self.archiver().project(project_id)
    }

    /// Ordered event history of one aggregate.
    pub fn history(&self, aggregate: Uuid) -> VaultResult<Vec<Event>> {
        self.with_db(|conn| Ok(SqliteEventStore::new(conn).history(aggregate)?))
    }

    pub fn events(&self, query: &EventQuery) -> VaultResult<Vec<Event>> {
        self.with_db(|conn| Ok(SqliteEventStore::new(conn).list(query)?))
    }

    /// Resolves where the project's bag and user copy currently live.
    pub fn locate(&self, project_id: ProjectId) -> VaultResult<ProjectLocations> {
        self.with_db(|conn| {
            let packages = SqlitePackageRepository::new(conn);
            let bag = match packages.get_package_for_project(project_id)? {
                Some(package) => packages.get_location(package.uuid, LocationKind::Bag)?,
                None => None,
            };
            let user_copy = packages.get_location(project_id, LocationKind::UserCopy)?;
            Ok(ProjectLocations {
                bag: bag.map(|rel| self.layout.resolve(&rel)),
                user_copy: user_copy.map(|rel| self.layout.resolve(&rel)),
            })
        })
    }

    pub(crate) fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    pub(crate) fn with_db<T>(
        &self,
        op: impl FnOnce(&Connection) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        op(&conn)
    }

    /// Runs `op` in one transaction; any error rolls it back.
    pub(crate) fn with_tx<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.layout.root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate filesystem work, repositories and the event store into
//!   the caller-facing vault operations.
//! - Keep callers decoupled from storage and layout details.
//!
//! # Invariants
//! - Every state transition commits together with its audit event.
//! - Mutations of one project are serialized through `ProjectLocks`.

pub mod archive_service;
pub mod integrity_service;
pub mod locks;
pub mod quarantine_service;
pub mod vault;

use crate::error::{VaultError, VaultResult};
use crate::model::project::{ArchivedProject, ProjectId, ProjectState};
use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use rusqlite::Connection;
use uuid::Uuid;

/// First eight hex digits of an id, used in directory names.
pub(crate) fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Error for an operation the project's current state does not allow.
pub(crate) fn state_error(project: &ArchivedProject, operation: &'static str) -> VaultError {
    match project.state {
        ProjectState::Quarantined => VaultError::conflict(project.uuid, "project is quarantined"),
        ProjectState::Purged => VaultError::conflict(project.uuid, "project has been purged"),
        state => VaultError::InvalidState {
            project_id: project.uuid,
            state,
            operation,
        },
    }
}

pub(crate) fn load_project(
    conn: &Connection,
    project_id: ProjectId,
) -> VaultResult<ArchivedProject> {
    SqliteProjectRepository::new(conn)
        .get_project(project_id)?
        .ok_or_else(|| VaultError::project_not_found(project_id))
}

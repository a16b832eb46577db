//! Caller-facing error taxonomy.
//!
//! # Invariants
//! - Every failure maps to one stable [`ErrorKind`] code.
//! - Checksum and structure failures keep the offending paths.

use crate::bagit::BagError;
use crate::config::ConfigError;
use crate::db::DbError;
use crate::fsops::InputError;
use crate::model::project::{ProjectState, ProjectValidationError};
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use uuid::Uuid;

pub type VaultResult<T> = Result<T, VaultError>;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InputInvalid,
    IoFailure,
    ChecksumMismatch,
    InvalidPackageStructure,
    QuarantineConflict,
    NotFound,
    InvalidState,
    Cancelled,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputInvalid => "input_invalid",
            Self::IoFailure => "io_failure",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::InvalidPackageStructure => "invalid_package_structure",
            Self::QuarantineConflict => "quarantine_conflict",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum VaultError {
    InputInvalid(InputError),
    InvalidProject(ProjectValidationError),
    Io {
        path: String,
        source: io::Error,
    },
    ChecksumMismatch {
        paths: Vec<String>,
    },
    InvalidPackageStructure {
        path: String,
        reason: String,
    },
    QuarantineConflict {
        project_id: Uuid,
        reason: String,
    },
    /// Restore or reschedule without an active quarantine entry.
    QuarantineEntryNotFound(Uuid),
    NotFound {
        entity: &'static str,
        id: String,
    },
    InvalidState {
        project_id: Uuid,
        state: ProjectState,
        operation: &'static str,
    },
    Cancelled,
    Storage(RepoError),
    Config(ConfigError),
    /// Packaging failed; the project is retained in `Failed`.
    PackagingFailed {
        project_id: Uuid,
        source: Box<VaultError>,
    },
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputInvalid(_) | Self::InvalidProject(_) => ErrorKind::InputInvalid,
            Self::Io { .. } => ErrorKind::IoFailure,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::InvalidPackageStructure { .. } => ErrorKind::InvalidPackageStructure,
            Self::QuarantineConflict { .. } | Self::QuarantineEntryNotFound(_) => {
                ErrorKind::QuarantineConflict
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::PackagingFailed { source, .. } => source.kind(),
        }
    }

    /// Offending paths for checksum/structure failures.
    pub fn paths(&self) -> Vec<String> {
        match self {
            Self::ChecksumMismatch { paths } => paths.clone(),
            Self::InvalidPackageStructure { path, .. } | Self::Io { path, .. } => {
                vec![path.clone()]
            }
            Self::PackagingFailed { source, .. } => source.paths(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn io(path: impl Display, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    pub(crate) fn conflict(project_id: Uuid, reason: impl Into<String>) -> Self {
        Self::QuarantineConflict {
            project_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn project_not_found(project_id: Uuid) -> Self {
        Self::NotFound {
            entity: "project",
            id: project_id.to_string(),
        }
    }
}

impl Display for VaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputInvalid(err) => write!(f, "invalid input: {err}"),
            Self::InvalidProject(err) => write!(f, "invalid input: {err}"),
            Self::Io { path, source } => write!(f, "I/O failure at `{path}`: {source}"),
            Self::ChecksumMismatch { paths } => {
                write!(f, "checksum mismatch for: {}", paths.join(", "))
            }
            Self::InvalidPackageStructure { path, reason } => {
                write!(f, "invalid package structure at `{path}`: {reason}")
            }
            Self::QuarantineConflict { project_id, reason } => {
                write!(f, "quarantine conflict for project {project_id}: {reason}")
            }
            Self::QuarantineEntryNotFound(project_id) => {
                write!(f, "no quarantine entry for project {project_id}")
            }
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::InvalidState {
                project_id,
                state,
                operation,
            } => write!(
                f,
                "cannot {operation} project {project_id} in state `{state}`"
            ),
            Self::Cancelled => write!(f, "operation was cancelled"),
            Self::Storage(err) => write!(f, "storage failure: {err}"),
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::PackagingFailed { project_id, source } => {
                write!(f, "packaging failed for project {project_id}: {source}")
            }
        }
    }
}

impl Error for VaultError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InputInvalid(err) => Some(err),
            Self::InvalidProject(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::Storage(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::PackagingFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<InputError> for VaultError {
    fn from(value: InputError) -> Self {
        Self::InputInvalid(value)
    }
}

impl From<ProjectValidationError> for VaultError {
    fn from(value: ProjectValidationError) -> Self {
        Self::InvalidProject(value)
    }
}

impl From<ConfigError> for VaultError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<RepoError> for VaultError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::InvalidProject(err),
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other),
        }
    }
}

impl From<DbError> for VaultError {
    fn from(value: DbError) -> Self {
        Self::Storage(RepoError::Db(value))
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(RepoError::from(value))
    }
}

impl From<BagError> for VaultError {
    fn from(value: BagError) -> Self {
        match value {
            BagError::Io { path, source } => Self::Io { path, source },
            BagError::ChecksumMismatch { paths } => Self::ChecksumMismatch { paths },
            BagError::InvalidStructure { path, reason } => {
                Self::InvalidPackageStructure { path, reason }
            }
            BagError::Cancelled => Self::Cancelled,
            BagError::InvalidState { expected, actual } => Self::InvalidPackageStructure {
                path: String::new(),
                reason: format!("builder is in state `{actual}`, expected `{expected}`"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, VaultError};
    use crate::bagit::BagError;
    use uuid::Uuid;

    #[test]
    fn packaging_failure_reports_kind_of_cause() {
        let err = VaultError::PackagingFailed {
            project_id: Uuid::nil(),
            source: Box::new(VaultError::from(BagError::ChecksumMismatch {
                paths: vec!["data/a.txt".to_string()],
            })),
        };
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(err.kind().as_str(), "checksum_mismatch");
        assert_eq!(err.paths(), vec!["data/a.txt"]);
        assert!(err.to_string().contains("data/a.txt"));
    }

    #[test]
    fn missing_quarantine_entry_is_a_conflict() {
        let err = VaultError::QuarantineEntryNotFound(Uuid::nil());
        assert_eq!(err.kind(), ErrorKind::QuarantineConflict);
    }
}

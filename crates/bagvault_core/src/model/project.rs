//! Archived project model.
//!
//! # Invariants
//! - `file_count`/`total_size` equal the sums over the linked package's
//!   payload entries once the project is `Active`.
//! - Projects are never deleted; purge is the terminal `Purged` state.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type ProjectId = Uuid;

const MAX_NAME_CHARS: usize = 256;

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Recorded, not packaged yet.
    Pending,
    /// A packaging attempt holds the project.
    Packaging,
    Active,
    /// Last packaging attempt failed; retry is allowed.
    Failed,
    Quarantined,
    /// Terminal. Payload bytes are gone.
    Purged,
}

impl ProjectState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Packaging => "packaging",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
            Self::Purged => "purged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "packaging" => Some(Self::Packaging),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            "quarantined" => Some(Self::Quarantined),
            "purged" => Some(Self::Purged),
            _ => None,
        }
    }

    /// Whether a fresh packaging attempt may start from this state.
    pub fn can_start_packaging(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl Display for ProjectState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation errors for project input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectValidationError {
    EmptyName,
    NameTooLong { chars: usize },
}

impl Display for ProjectValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "project name must not be blank"),
            Self::NameTooLong { chars } => write!(
                f,
                "project name has {chars} characters, at most {MAX_NAME_CHARS} allowed"
            ),
        }
    }
}

impl Error for ProjectValidationError {}

/// Logical unit of preservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedProject {
    pub uuid: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub state: ProjectState,
    pub file_count: u64,
    pub total_size: u64,
    pub package_uuid: Option<Uuid>,
    /// Stable error code of the last failed packaging attempt.
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived_at: Option<i64>,
}

impl ArchivedProject {
    /// New `Pending` project with a generated id.
    pub fn new(name: impl Into<String>, description: Option<String>, now_ms: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into().trim().to_string(),
            description: description
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            state: ProjectState::Pending,
            file_count: 0,
            total_size: 0,
            package_uuid: None,
            last_error: None,
            created_at: now_ms,
            updated_at: now_ms,
            archived_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProjectValidationError> {
        let chars = self.name.trim().chars().count();
        if chars == 0 {
            return Err(ProjectValidationError::EmptyName);
        }
        if chars > MAX_NAME_CHARS {
            return Err(ProjectValidationError::NameTooLong { chars });
        }
        Ok(())
    }

    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            project_id: self.uuid,
            name: self.name.clone(),
            description: self.description.clone(),
            state: self.state,
            file_count: self.file_count,
            total_size: self.total_size,
            package_id: self.package_uuid,
            created_at: self.created_at,
            archived_at: self.archived_at,
        }
    }
}

/// Caller-facing view of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub state: ProjectState,
    pub file_count: u64,
    pub total_size: u64,
    pub package_id: Option<Uuid>,
    pub created_at: i64,
    pub archived_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::{ArchivedProject, ProjectState, ProjectValidationError};

    #[test]
    fn new_project_is_pending_and_trimmed() {
        let project = ArchivedProject::new("  Thesis  ", Some("   ".to_string()), 10);
        assert_eq!(project.name, "Thesis");
        assert_eq!(project.description, None);
        assert_eq!(project.state, ProjectState::Pending);
        assert!(project.validate().is_ok());
    }

    #[test]
    fn blank_and_oversized_names_are_rejected() {
        let blank = ArchivedProject::new(" ", None, 0);
        assert_eq!(blank.validate(), Err(ProjectValidationError::EmptyName));

        let long = ArchivedProject::new("x".repeat(300), None, 0);
        assert_eq!(
            long.validate(),
            Err(ProjectValidationError::NameTooLong { chars: 300 })
        );
    }

    #[test]
    fn state_names_roundtrip() {
        for state in [
            ProjectState::Pending,
            ProjectState::Packaging,
            ProjectState::Active,
            ProjectState::Failed,
            ProjectState::Quarantined,
            ProjectState::Purged,
        ] {
            assert_eq!(ProjectState::parse(state.as_str()), Some(state));
        }
        assert!(ProjectState::Failed.can_start_packaging());
        assert!(!ProjectState::Quarantined.can_start_packaging());
    }
}

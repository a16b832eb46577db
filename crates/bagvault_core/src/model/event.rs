//! Audit event model.
//!
//! # Responsibility
//! - Enumerate every domain event the engine records.
//! - Fold a project's history back into its lifecycle state.
//!
//! # Invariants
//! - Events are immutable once appended.
//! - `aggregate_seq` is 1-based and gap-free per aggregate.

use super::project::ProjectState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ProjectCreated,
    PackagingStarted,
    PackageCreated,
    PackagingFailed,
    ProjectArchived,
    PackageValidated,
    ProjectQuarantined,
    ProjectRestored,
    PurgeRescheduled,
    ProjectPurged,
    UserCopyRebuilt,
    StagingCleaned,
    AnomalyDetected,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::ProjectCreated,
        EventType::PackagingStarted,
        EventType::PackageCreated,
        EventType::PackagingFailed,
        EventType::ProjectArchived,
        EventType::PackageValidated,
        EventType::ProjectQuarantined,
        EventType::ProjectRestored,
        EventType::PurgeRescheduled,
        EventType::ProjectPurged,
        EventType::UserCopyRebuilt,
        EventType::StagingCleaned,
        EventType::AnomalyDetected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectCreated => "ProjectCreated",
            Self::PackagingStarted => "PackagingStarted",
            Self::PackageCreated => "PackageCreated",
            Self::PackagingFailed => "PackagingFailed",
            Self::ProjectArchived => "ProjectArchived",
            Self::PackageValidated => "PackageValidated",
            Self::ProjectQuarantined => "ProjectQuarantined",
            Self::ProjectRestored => "ProjectRestored",
            Self::PurgeRescheduled => "PurgeRescheduled",
            Self::ProjectPurged => "ProjectPurged",
            Self::UserCopyRebuilt => "UserCopyRebuilt",
            Self::StagingCleaned => "StagingCleaned",
            Self::AnomalyDetected => "AnomalyDetected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == value)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event to append; the store assigns ids, sequences and time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub aggregate_uuid: Uuid,
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, aggregate_uuid: Uuid, payload: Value) -> Self {
        Self {
            event_type,
            aggregate_uuid,
            payload,
        }
    }
}

/// Stored, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Global append order.
    pub seq: i64,
    pub uuid: Uuid,
    pub event_type: EventType,
    pub aggregate_uuid: Uuid,
    pub aggregate_seq: i64,
    pub payload: Value,
    pub created_at: i64,
}

/// Folds a project's ordered history into its lifecycle state.
///
/// Returns `None` for an empty history.
pub fn replay_project_state(events: &[Event]) -> Option<ProjectState> {
    events.iter().fold(None, |state, event| {
        let next = match event.event_type {
            EventType::ProjectCreated => ProjectState::Pending,
            EventType::PackagingStarted => ProjectState::Packaging,
            EventType::PackagingFailed => ProjectState::Failed,
            EventType::ProjectArchived | EventType::ProjectRestored => ProjectState::Active,
            EventType::ProjectQuarantined => ProjectState::Quarantined,
            EventType::ProjectPurged => ProjectState::Purged,
            _ => return state,
        };
        Some(next)
    })
}

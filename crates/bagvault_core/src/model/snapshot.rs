//! Integrity snapshot model.

use crate::checksum::Algorithm;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Scanned vault layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// `projects/`
    User,
    /// `.bags/`
    Bag,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bag => "bag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "bag" => Some(Self::Bag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    MissingFile,
    CorruptedFile,
    ExternalModification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        })
    }
}

/// One reported discrepancy. Paths are vault-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub layer: Layer,
    pub paths: Vec<String>,
    pub detail: String,
}

/// Per-file record kept with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub layer: Layer,
    pub rel_path: String,
    pub digest: String,
    pub size: u64,
}

/// Point-in-time integrity baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    /// Append order; the highest value is the latest snapshot.
    pub seq: i64,
    pub uuid: Uuid,
    pub scanned_at: i64,
    pub algorithm: Algorithm,
    pub user_checksum: String,
    pub bag_checksum: String,
    pub user_files: u64,
    pub bag_files: u64,
    pub anomalies: Vec<Anomaly>,
}

//! Quarantine entry model.
//!
//! # Invariants
//! - At most one entry per project.
//! - `purge_at = quarantined_at + grace period` unless rescheduled.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub quarantined_at: i64,
    /// Vault-relative package root before quarantine.
    pub original_bag_path: String,
    /// Vault-relative user copy before quarantine, if one existed.
    pub original_user_path: Option<String>,
    /// Vault-relative holding directory under `.quarantine/`.
    pub quarantine_path: String,
    pub purge_at: i64,
    pub reason: Option<String>,
}

impl QuarantineEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.purge_at
    }
}

/// Outcome of one purge sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSweepReport {
    pub purged: Vec<Uuid>,
    /// Projects whose purge failed, with the error message.
    pub failed: Vec<(Uuid, String)>,
}

//! Preservation packaging and vault-integrity engine.
//! Archives file sets as BagIt packages, manages their soft-delete
//! lifecycle and audits the on-disk vault.

pub mod bagit;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod fsops;
pub mod layout;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use cancel::CancelToken;
pub use checksum::{Algorithm, ChecksumEngine, ChecksumError, DigestSet};
pub use config::{ConfigError, VaultConfig};
pub use error::{ErrorKind, VaultError, VaultResult};
pub use logging::{default_log_level, init_logging, init_vault_logging, logging_status};
pub use model::event::{Event, EventType};
pub use model::package::{PackageFile, PackageSummary};
pub use model::project::{ProjectId, ProjectState, ProjectSummary};
pub use model::quarantine::{PurgeSweepReport, QuarantineEntry};
pub use model::snapshot::{Anomaly, AnomalyKind, Layer, Severity, VaultSnapshot};
pub use repo::event_store::EventQuery;
pub use repo::project_repo::ProjectListQuery;
pub use service::archive_service::{
    ArchiveOutcome, ArchiveRequest, Archiver, ProjectAudit, ValidationOutcome,
};
pub use service::integrity_service::{IntegrityReport, IntegrityScanner, IntegrityScheduler};
pub use service::quarantine_service::QuarantineManager;
pub use service::vault::{ProjectLocations, Vault};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}

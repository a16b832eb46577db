//! Preservation package model.

use crate::checksum::{Algorithm, DigestSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PackageId = Uuid;

/// Finalized package record. Only validation runs mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagitPackage {
    pub uuid: PackageId,
    pub project_uuid: Uuid,
    /// Vault-relative home path of the package root; unique in the vault.
    pub root_path: String,
    /// Manifest algorithms, primary first.
    pub manifest_algorithms: Vec<Algorithm>,
    /// Primary-algorithm digest of the primary manifest file.
    pub manifest_digest: String,
    pub bag_size: u64,
    pub payload_bytes: u64,
    pub payload_files: u64,
    pub is_valid: bool,
    pub validated_at: Option<i64>,
    pub created_at: i64,
}

impl BagitPackage {
    pub fn primary_algorithm(&self) -> Algorithm {
        self.manifest_algorithms
            .first()
            .copied()
            .unwrap_or(Algorithm::Sha256)
    }

    /// Tag file names expected in the package root.
    pub fn tag_file_names(&self) -> Vec<String> {
        let mut names = vec![
            crate::bagit::BAGIT_TXT.to_string(),
            crate::bagit::BAG_INFO_TXT.to_string(),
        ];
        names.extend(
            self.manifest_algorithms
                .iter()
                .map(|algorithm| crate::bagit::manifest_file_name(*algorithm)),
        );
        names.push(crate::bagit::tag_manifest_file_name(self.primary_algorithm()));
        names
    }

    pub fn summary(&self) -> PackageSummary {
        PackageSummary {
            package_id: self.uuid,
            project_id: self.project_uuid,
            manifest_algorithm: self.primary_algorithm(),
            manifest_digest: self.manifest_digest.clone(),
            bag_size: self.bag_size,
            payload_files: self.payload_files,
            payload_bytes: self.payload_bytes,
            is_valid: self.is_valid,
            validated_at: self.validated_at,
        }
    }
}

/// Recorded fixity for one payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    /// Path relative to the package `data/` directory.
    pub rel_path: String,
    pub size: u64,
    pub digests: DigestSet,
}

/// Caller-facing view of a package. Carries no filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub package_id: PackageId,
    pub project_id: Uuid,
    pub manifest_algorithm: Algorithm,
    pub manifest_digest: String,
    pub bag_size: u64,
    pub payload_files: u64,
    pub payload_bytes: u64,
    pub is_valid: bool,
    pub validated_at: Option<i64>,
}

/// What a `locations` row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// Package root, keyed by package id.
    Bag,
    /// User-visible copy, keyed by project id.
    UserCopy,
}

impl LocationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bag => "bag",
            Self::UserCopy => "user_copy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bag" => Some(Self::Bag),
            "user_copy" => Some(Self::UserCopy),
            _ => None,
        }
    }
}

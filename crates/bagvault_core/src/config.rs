//! Vault policy configuration.
//!
//! # Responsibility
//! - Hold the policy knobs that are choices rather than contracts: grace
//!   period, digest algorithms, I/O retry budget, bag-info identity.
//! - Load overrides from `<vault>/.system/config.json` when present.
//!
//! # Invariants
//! - The primary (first) manifest algorithm is cryptographic-strength.
//! - A loaded config is always validated before use.

use crate::checksum::Algorithm;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Policy configuration for one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Days a quarantined project stays recoverable before purge.
    pub grace_period_days: u32,
    /// Algorithms with a `manifest-<alg>.txt`; the first one is primary.
    pub manifest_algorithms: Vec<Algorithm>,
    /// Per-file digests recorded in the database for every payload file.
    pub fixity_algorithms: Vec<Algorithm>,
    /// Per-file digest used by the vault integrity scanner.
    pub scan_algorithm: Algorithm,
    /// Total attempts for transient I/O failures (1 = no retry).
    pub io_retry_attempts: u32,
    pub io_retry_backoff_ms: u64,
    /// Value written to `Bag-Software-Agent`.
    pub software_agent: String,
    /// Optional `Source-Organization` bag-info field.
    pub source_organization: Option<String>,
    /// Interval for the background integrity scheduler.
    pub scan_interval_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 30,
            manifest_algorithms: vec![Algorithm::Sha256],
            fixity_algorithms: vec![Algorithm::Sha256, Algorithm::Blake3, Algorithm::Md5],
            scan_algorithm: Algorithm::Blake3,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 50,
            software_agent: format!("bagvault_core v{}", env!("CARGO_PKG_VERSION")),
            source_organization: None,
            scan_interval_secs: 3600,
        }
    }
}

impl VaultConfig {
    /// Loads the config file if it exists, otherwise returns defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.manifest_algorithms.first() {
            None => return Err(ConfigError::NoManifestAlgorithm),
            Some(primary) if !primary.is_cryptographic() => {
                return Err(ConfigError::WeakPrimaryAlgorithm(*primary))
            }
            Some(_) => {}
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(repeated) = self
            .manifest_algorithms
            .iter()
            .find(|algorithm| !seen.insert(**algorithm))
        {
            return Err(ConfigError::InvalidValue(format!(
                "manifest algorithm `{repeated}` is listed twice"
            )));
        }
        if !self
            .fixity_algorithms
            .iter()
            .any(|algorithm| algorithm.is_cryptographic())
        {
            return Err(ConfigError::NoCryptographicFixity);
        }
        if self.io_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "io_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "scan_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.software_agent.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "software_agent must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// Primary manifest algorithm. Validation guarantees one exists.
    pub fn primary_algorithm(&self) -> Algorithm {
        self.manifest_algorithms
            .first()
            .copied()
            .unwrap_or(Algorithm::Sha256)
    }

    pub fn grace_period_ms(&self) -> i64 {
        i64::from(self.grace_period_days) * MS_PER_DAY
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.io_retry_backoff_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

/// Configuration load/validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Read { path: String, message: String },
    Parse { path: String, message: String },
    NoManifestAlgorithm,
    WeakPrimaryAlgorithm(Algorithm),
    NoCryptographicFixity,
    InvalidValue(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, message } => write!(f, "failed to read config `{path}`: {message}"),
            Self::Parse { path, message } => {
                write!(f, "failed to parse config `{path}`: {message}")
            }
            Self::NoManifestAlgorithm => write!(f, "at least one manifest algorithm is required"),
            Self::WeakPrimaryAlgorithm(algorithm) => write!(
                f,
                "primary manifest algorithm `{algorithm}` is not cryptographic-strength"
            ),
            Self::NoCryptographicFixity => {
                write!(f, "fixity algorithms must include a cryptographic algorithm")
            }
            Self::InvalidValue(message) => write!(f, "invalid config value: {message}"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::{ConfigError, VaultConfig};
    use crate::checksum::Algorithm;

    #[test]
    fn defaults_are_valid() {
        let config = VaultConfig::default();
        config.validate().unwrap();
        assert_eq!(config.grace_period_days, 30);
        assert_eq!(config.primary_algorithm(), Algorithm::Sha256);
        assert_eq!(config.grace_period_ms(), 30 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn md5_cannot_be_primary() {
        let config = VaultConfig {
            manifest_algorithms: vec![Algorithm::Md5, Algorithm::Sha256],
            ..VaultConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::WeakPrimaryAlgorithm(Algorithm::Md5)
        );
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "grace_period_days": 7, "manifest_algorithms": ["sha512", "md5"] }"#,
        )
        .unwrap();

        let config = VaultConfig::load_or_default(&path).unwrap();
        assert_eq!(config.grace_period_days, 7);
        assert_eq!(
            config.manifest_algorithms,
            vec![Algorithm::Sha512, Algorithm::Md5]
        );
        assert_eq!(config.scan_algorithm, Algorithm::Blake3);
    }

    #[test]
    fn unknown_algorithm_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "scan_algorithm": "crc32" }"#).unwrap();

        let err = VaultConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}

//! On-disk vault layout.
//!
//! ```text
//! <root>/
//!   projects/       user-visible copies, one directory per project
//!   .bags/          finalized preservation bags
//!   .quarantine/    soft-deleted projects awaiting restore or purge
//!   .system/        vault.sqlite3, config.json, logs/, staging/, tmp/
//! ```
//!
//! Database rows store paths relative to `<root>` with `/` separators so a
//! vault can be moved as a whole.

use crate::fsops::{join_slash_path, relative_slash_path};
use std::io;
use std::path::{Path, PathBuf};

pub const PROJECTS_DIR: &str = "projects";
pub const BAGS_DIR: &str = ".bags";
pub const QUARANTINE_DIR: &str = ".quarantine";
pub const SYSTEM_DIR: &str = ".system";
const DB_FILE_NAME: &str = "vault.sqlite3";
const CONFIG_FILE_NAME: &str = "config.json";

/// Resolved directory layout for one vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates every area directory if missing.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.projects_dir(),
            self.bags_dir(),
            self.quarantine_dir(),
            self.logs_dir(),
            self.staging_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    pub fn bags_dir(&self) -> PathBuf {
        self.root.join(BAGS_DIR)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    pub fn system_dir(&self) -> PathBuf {
        self.root.join(SYSTEM_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.system_dir().join(DB_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.system_dir().join(CONFIG_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.system_dir().join("logs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.system_dir().join("staging")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.system_dir().join("tmp")
    }

    /// Quarantine holding directory for one project.
    pub fn quarantine_slot(&self, project_key: &str) -> PathBuf {
        self.quarantine_dir().join(project_key)
    }

    /// Resolves a stored vault-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        join_slash_path(&self.root, relative)
    }

    /// Converts an absolute path inside the vault to its stored form.
    pub fn relative(&self, path: &Path) -> Option<String> {
        relative_slash_path(&self.root, path)
    }
}

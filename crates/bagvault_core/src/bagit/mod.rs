//! BagIt 1.0 packaging: assembly, parsing and validation.
//!
//! # Responsibility
//! - Assemble packages through an explicit state machine (`builder`).
//! - Render and parse tag files bit-exactly (`tag_files`).
//! - Validate package structure and fixity (`reader`).
//!
//! # Invariants
//! - Manifest lines are sorted by encoded payload path.
//! - A builder in `Failed` never reports success; its directory is left
//!   in place for inspection.
//!
//! # See also
//! - RFC 8493 (The BagIt File Packaging Format, V1.0)

use crate::checksum::ChecksumError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

pub mod builder;
pub mod reader;
pub mod tag_files;

pub use builder::{BagBuilder, BagRequest, FinalizedBag, PayloadEntry};
pub use reader::{BagReader, ManifestEntry, VerifiedBag};

pub const BAGIT_TXT: &str = "bagit.txt";
pub const BAG_INFO_TXT: &str = "bag-info.txt";
pub const DATA_DIR: &str = "data";
pub const BAGIT_VERSION: &str = "1.0";
pub const TAG_FILE_ENCODING: &str = "UTF-8";

/// Packaging state machine.
///
/// `Draft -> Copying -> Hashing -> ManifestWritten -> Validated -> Finalized`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagState {
    Draft,
    Copying,
    Hashing,
    ManifestWritten,
    Validated,
    Finalized,
    Failed,
}

impl BagState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Copying => "copying",
            Self::Hashing => "hashing",
            Self::ManifestWritten => "manifest_written",
            Self::Validated => "validated",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl Display for BagState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packaging and validation failures.
#[derive(Debug)]
pub enum BagError {
    Io { path: String, source: io::Error },
    /// Manifest digest disagrees with a fresh digest; paths are bag-relative.
    ChecksumMismatch { paths: Vec<String> },
    InvalidStructure { path: String, reason: String },
    Cancelled,
    InvalidState { expected: BagState, actual: BagState },
}

impl BagError {
    pub(crate) fn io(path: impl Display, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    pub(crate) fn structure(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStructure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable short code used in logs and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io_failure",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::InvalidStructure { .. } => "invalid_package_structure",
            Self::Cancelled => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}

impl Display for BagError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O failure at `{path}`: {source}"),
            Self::ChecksumMismatch { paths } => {
                write!(f, "checksum mismatch for: {}", paths.join(", "))
            }
            Self::InvalidStructure { path, reason } => {
                write!(f, "invalid package structure at `{path}`: {reason}")
            }
            Self::Cancelled => write!(f, "packaging was cancelled"),
            Self::InvalidState { expected, actual } => write!(
                f,
                "package is in state `{actual}`, expected `{expected}`"
            ),
        }
    }
}

impl Error for BagError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ChecksumError> for BagError {
    fn from(value: ChecksumError) -> Self {
        match value {
            ChecksumError::Io { source_id, source } => Self::Io {
                path: source_id,
                source,
            },
            ChecksumError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

/// Encodes a payload path for a manifest line (`%`, CR and LF).
pub fn encode_manifest_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for ch in path.chars() {
        match ch {
            '%' => encoded.push_str("%25"),
            '\r' => encoded.push_str("%0D"),
            '\n' => encoded.push_str("%0A"),
            other => encoded.push(other),
        }
    }
    encoded
}

/// Reverses [`encode_manifest_path`]; other `%` sequences pass through.
pub fn decode_manifest_path(path: &str) -> String {
    let mut decoded = String::with_capacity(path.len());
    let mut rest = path;
    while let Some(index) = rest.find('%') {
        decoded.push_str(&rest[..index]);
        let tail = &rest[index..];
        let replacement = match tail.get(..3) {
            Some("%25") => Some('%'),
            Some(code) if code.eq_ignore_ascii_case("%0D") => Some('\r'),
            Some(code) if code.eq_ignore_ascii_case("%0A") => Some('\n'),
            _ => None,
        };
        match replacement {
            Some(ch) => {
                decoded.push(ch);
                rest = &tail[3..];
            }
            None => {
                decoded.push('%');
                rest = &tail[1..];
            }
        }
    }
    decoded.push_str(rest);
    decoded
}

/// Manifest file name for an algorithm.
pub fn manifest_file_name(algorithm: crate::checksum::Algorithm) -> String {
    format!("manifest-{}.txt", algorithm.as_str())
}

/// Tag manifest file name for an algorithm.
pub fn tag_manifest_file_name(algorithm: crate::checksum::Algorithm) -> String {
    format!("tagmanifest-{}.txt", algorithm.as_str())
}

#[cfg(test)]
mod tests {
    use super::{decode_manifest_path, encode_manifest_path};

    #[test]
    fn manifest_path_encoding_roundtrips_reserved_characters() {
        let raw = "data/100%\nreal\r.txt";
        let encoded = encode_manifest_path(raw);
        assert_eq!(encoded, "data/100%25%0Areal%0D.txt");
        assert_eq!(decode_manifest_path(&encoded), raw);
    }

    #[test]
    fn decode_leaves_unknown_escapes_untouched() {
        assert_eq!(decode_manifest_path("data/50%off%2"), "data/50%off%2");
    }
}

//! Multi-algorithm content digests.
//!
//! # Responsibility
//! - Compute one or more digests over a byte stream in a single pass.
//! - Keep digest output platform-independent (lowercase hex).
//!
//! # Invariants
//! - Identical bytes always produce identical digests.
//! - A read failure discards every partial digest; nothing is returned.
//! - The engine performs no I/O beyond consuming its input.

use crate::cancel::CancelToken;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Supported digest algorithms, named as they appear in manifest file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha512,
    Md5,
    Blake3,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Sha256,
        Algorithm::Sha512,
        Algorithm::Md5,
        Algorithm::Blake3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Md5 => "md5",
            Self::Blake3 => "blake3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            "md5" => Some(Self::Md5),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    /// Whether the algorithm is acceptable as a tamper-evident fixity value.
    pub fn is_cryptographic(self) -> bool {
        !matches!(self, Self::Md5)
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 | Self::Blake3 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digests keyed by algorithm, hex encoded.
pub type DigestSet = BTreeMap<Algorithm, String>;

/// Checksum failure tagged with the identity of the source being read.
#[derive(Debug)]
pub enum ChecksumError {
    Io { source_id: String, source: io::Error },
    Cancelled { source_id: String },
}

impl ChecksumError {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Io { source_id, .. } | Self::Cancelled { source_id } => source_id,
        }
    }
}

impl Display for ChecksumError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { source_id, source } => {
                write!(f, "failed to read `{source_id}` for hashing: {source}")
            }
            Self::Cancelled { source_id } => write!(f, "hashing of `{source_id}` was cancelled"),
        }
    }
}

impl Error for ChecksumError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(Sha256::new()),
            Algorithm::Sha512 => Self::Sha512(Sha512::new()),
            Algorithm::Md5 => Self::Md5(Md5::new()),
            Algorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(chunk),
            Self::Sha512(hasher) => hasher.update(chunk),
            Self::Md5(hasher) => hasher.update(chunk),
            Self::Blake3(hasher) => {
                hasher.update(chunk);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Sha512(hasher) => hex::encode(hasher.finalize()),
            Self::Md5(hasher) => hex::encode(hasher.finalize()),
            Self::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Stateless digest calculator over a fixed algorithm set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEngine {
    algorithms: BTreeSet<Algorithm>,
}

impl ChecksumEngine {
    /// Creates an engine; duplicate algorithms collapse to one.
    pub fn new(algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        Self {
            algorithms: algorithms.into_iter().collect(),
        }
    }

    pub fn algorithms(&self) -> impl Iterator<Item = Algorithm> + '_ {
        self.algorithms.iter().copied()
    }

    /// Digests an arbitrary reader in one pass.
    ///
    /// `source_id` names the input in errors and logs.
    pub fn digest_reader<R: Read>(
        &self,
        mut reader: R,
        source_id: &str,
        cancel: &CancelToken,
    ) -> Result<DigestSet, ChecksumError> {
        let mut hashers: Vec<(Algorithm, Hasher)> = self
            .algorithms
            .iter()
            .map(|algorithm| (*algorithm, Hasher::new(*algorithm)))
            .collect();
        let mut buffer = vec![0u8; READ_BUFFER_BYTES];

        loop {
            if cancel.is_cancelled() {
                return Err(ChecksumError::Cancelled {
                    source_id: source_id.to_string(),
                });
            }
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(ChecksumError::Io {
                        source_id: source_id.to_string(),
                        source: err,
                    })
                }
            };
            for (_, hasher) in &mut hashers {
                hasher.update(&buffer[..read]);
            }
        }

        Ok(hashers
            .into_iter()
            .map(|(algorithm, hasher)| (algorithm, hasher.finalize_hex()))
            .collect())
    }

    /// Digests the file at `path`.
    pub fn digest_file(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<DigestSet, ChecksumError> {
        let source_id = path.display().to_string();
        let file = File::open(path).map_err(|err| ChecksumError::Io {
            source_id: source_id.clone(),
            source: err,
        })?;
        self.digest_reader(file, &source_id, cancel)
    }

    /// Digests an in-memory buffer.
    pub fn digest_bytes(&self, bytes: &[u8]) -> DigestSet {
        let mut hashers: Vec<(Algorithm, Hasher)> = self
            .algorithms
            .iter()
            .map(|algorithm| (*algorithm, Hasher::new(*algorithm)))
            .collect();
        for (_, hasher) in &mut hashers {
            hasher.update(bytes);
        }
        hashers
            .into_iter()
            .map(|(algorithm, hasher)| (algorithm, hasher.finalize_hex()))
            .collect()
    }
}

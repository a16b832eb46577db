//! Package reader: structural validation and fixity verification.
//!
//! # Responsibility
//! - Parse declaration, bag-info, payload manifests and tag manifests.
//! - Reject packages that break the format contract before any hashing.
//! - Recompute digests and report every mismatching path.
//!
//! # Invariants
//! - Manifest paths stay inside the package (`data/` prefix, no `..`).
//! - Every payload file is listed in every payload manifest and vice versa.

use super::tag_files::{parse_manifest_line, parse_tag_fields};
use super::{
    manifest_file_name, BagError, BAGIT_TXT, BAGIT_VERSION, BAG_INFO_TXT, DATA_DIR,
    TAG_FILE_ENCODING,
};
use crate::cancel::CancelToken;
use crate::checksum::{Algorithm, ChecksumEngine, DigestSet};
use crate::fsops::{join_slash_path, relative_slash_path};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    /// Decoded, `/`-separated path relative to the package root.
    pub path: String,
}

/// Fixity verification result for a structurally valid package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBag {
    pub payload_files: u64,
    pub payload_bytes: u64,
    /// Fresh digests keyed by `data/...` path.
    pub digests: BTreeMap<String, DigestSet>,
}

/// Parsed, structurally validated package.
#[derive(Debug, Clone)]
pub struct BagReader {
    root: PathBuf,
    info: Vec<(String, String)>,
    manifests: BTreeMap<Algorithm, Vec<ManifestEntry>>,
    tag_manifests: BTreeMap<Algorithm, Vec<ManifestEntry>>,
    payload_sizes: BTreeMap<String, u64>,
}

impl BagReader {
    /// Opens and structurally validates the package at `root`.
    pub fn open(root: &Path) -> Result<Self, BagError> {
        let shown_root = root.display().to_string();
        if !root.is_dir() {
            return Err(BagError::structure(
                shown_root,
                "package root is not a directory",
            ));
        }

        check_declaration(root)?;

        let data_dir = root.join(DATA_DIR);
        if !data_dir.is_dir() {
            return Err(BagError::structure(DATA_DIR, "payload directory is missing"));
        }

        let mut manifests = BTreeMap::new();
        let mut tag_manifests = BTreeMap::new();
        let entries = fs::read_dir(root).map_err(|err| BagError::io(&shown_root, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| BagError::io(&shown_root, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(algorithm_name) = strip_affixes(&name, "manifest-", ".txt") {
                let algorithm = parse_algorithm(&name, algorithm_name)?;
                manifests.insert(algorithm, read_manifest(root, &name, algorithm)?);
            } else if let Some(algorithm_name) = strip_affixes(&name, "tagmanifest-", ".txt") {
                let algorithm = parse_algorithm(&name, algorithm_name)?;
                tag_manifests.insert(algorithm, read_manifest(root, &name, algorithm)?);
            }
        }
        if manifests.is_empty() {
            return Err(BagError::structure(shown_root, "no payload manifest found"));
        }

        let payload_sizes = walk_payload(root)?;
        for (algorithm, entries) in &manifests {
            let manifest_name = manifest_file_name(*algorithm);
            let listed: BTreeSet<&str> = entries.iter().map(|entry| entry.path.as_str()).collect();
            for entry in entries {
                if !entry.path.starts_with("data/") {
                    return Err(BagError::structure(
                        entry.path.clone(),
                        format!("{manifest_name} lists a path outside data/"),
                    ));
                }
                if !payload_sizes.contains_key(&entry.path) {
                    return Err(BagError::structure(
                        entry.path.clone(),
                        format!("listed in {manifest_name} but missing from payload"),
                    ));
                }
            }
            if let Some(unlisted) = payload_sizes
                .keys()
                .find(|path| !listed.contains(path.as_str()))
            {
                return Err(BagError::structure(
                    unlisted.clone(),
                    format!("payload file not listed in {manifest_name}"),
                ));
            }
        }
        for entries in tag_manifests.values() {
            for entry in entries {
                if entry.path.starts_with("data/") || !root.join(&entry.path).is_file() {
                    return Err(BagError::structure(
                        entry.path.clone(),
                        "tag manifest lists a missing or payload file",
                    ));
                }
            }
        }

        let info = read_bag_info(root)?;
        let reader = Self {
            root: root.to_path_buf(),
            info,
            manifests,
            tag_manifests,
            payload_sizes,
        };
        reader.check_payload_oxum()?;
        Ok(reader)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First value of a bag-info field, case-insensitive label match.
    pub fn info_value(&self, label: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(label))
            .map(|(_, value)| value.as_str())
    }

    pub fn manifest_algorithms(&self) -> Vec<Algorithm> {
        self.manifests.keys().copied().collect()
    }

    pub fn manifest(&self, algorithm: Algorithm) -> Option<&[ManifestEntry]> {
        self.manifests.get(&algorithm).map(Vec::as_slice)
    }

    pub fn tag_manifest_algorithms(&self) -> Vec<Algorithm> {
        self.tag_manifests.keys().copied().collect()
    }

    /// Payload paths (`data/...`) in sorted order.
    pub fn payload_paths(&self) -> Vec<String> {
        self.payload_sizes.keys().cloned().collect()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_sizes.values().sum()
    }

    /// Recomputes every manifest digest.
    ///
    /// Fails with `ChecksumMismatch` listing all offending paths.
    pub fn verify(&self, cancel: &CancelToken) -> Result<VerifiedBag, BagError> {
        let engine = ChecksumEngine::new(self.manifests.keys().copied());
        let mut expected: BTreeMap<&str, Vec<(Algorithm, &str)>> = BTreeMap::new();
        for (algorithm, entries) in &self.manifests {
            for entry in entries {
                expected
                    .entry(entry.path.as_str())
                    .or_default()
                    .push((*algorithm, entry.digest.as_str()));
            }
        }

        let mut mismatches = BTreeSet::new();
        let mut digests = BTreeMap::new();
        for (path, wanted) in expected {
            let fresh = engine.digest_file(&join_slash_path(&self.root, path), cancel)?;
            if wanted.iter().any(|(algorithm, digest)| {
                fresh.get(algorithm).map(String::as_str) != Some(*digest)
            }) {
                mismatches.insert(path.to_string());
            }
            digests.insert(path.to_string(), fresh);
        }

        for (algorithm, entries) in &self.tag_manifests {
            let tag_engine = ChecksumEngine::new([*algorithm]);
            for entry in entries {
                let fresh = tag_engine.digest_file(&self.root.join(&entry.path), cancel)?;
                if fresh.get(algorithm) != Some(&entry.digest) {
                    mismatches.insert(entry.path.clone());
                }
            }
        }

        if !mismatches.is_empty() {
            return Err(BagError::ChecksumMismatch {
                paths: mismatches.into_iter().collect(),
            });
        }

        Ok(VerifiedBag {
            payload_files: self.payload_sizes.len() as u64,
            payload_bytes: self.payload_bytes(),
            digests,
        })
    }

    fn check_payload_oxum(&self) -> Result<(), BagError> {
        let Some(oxum) = self.info_value("Payload-Oxum") else {
            return Ok(());
        };
        let expected = format!("{}.{}", self.payload_bytes(), self.payload_sizes.len());
        if oxum != expected {
            return Err(BagError::structure(
                BAG_INFO_TXT,
                format!("Payload-Oxum `{oxum}` does not match payload `{expected}`"),
            ));
        }
        Ok(())
    }
}

fn check_declaration(root: &Path) -> Result<(), BagError> {
    let path = root.join(BAGIT_TXT);
    if !path.is_file() {
        return Err(BagError::structure(BAGIT_TXT, "declaration file is missing"));
    }
    let content = fs::read_to_string(&path).map_err(|err| BagError::io(path.display(), err))?;
    let fields = parse_tag_fields(&content)
        .map_err(|line| BagError::structure(BAGIT_TXT, format!("malformed line {line}")))?;
    let value = |label: &str| {
        fields
            .iter()
            .find(|(key, _)| key == label)
            .map(|(_, value)| value.as_str())
    };
    if value("BagIt-Version") != Some(BAGIT_VERSION) {
        return Err(BagError::structure(
            BAGIT_TXT,
            format!("unsupported BagIt-Version, expected {BAGIT_VERSION}"),
        ));
    }
    match value("Tag-File-Character-Encoding") {
        Some(encoding) if encoding.eq_ignore_ascii_case(TAG_FILE_ENCODING) => Ok(()),
        _ => Err(BagError::structure(
            BAGIT_TXT,
            format!("Tag-File-Character-Encoding must be {TAG_FILE_ENCODING}"),
        )),
    }
}

fn read_bag_info(root: &Path) -> Result<Vec<(String, String)>, BagError> {
    let path = root.join(BAG_INFO_TXT);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path).map_err(|err| BagError::io(path.display(), err))?;
    parse_tag_fields(&content)
        .map_err(|line| BagError::structure(BAG_INFO_TXT, format!("malformed line {line}")))
}

fn read_manifest(
    root: &Path,
    name: &str,
    algorithm: Algorithm,
) -> Result<Vec<ManifestEntry>, BagError> {
    let path = root.join(name);
    let content = fs::read_to_string(&path).map_err(|err| BagError::io(path.display(), err))?;
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (digest, entry_path) = parse_manifest_line(line)
            .ok_or_else(|| BagError::structure(name, format!("malformed line {}", index + 1)))?;
        if digest.len() != algorithm.hex_len() {
            return Err(BagError::structure(
                name,
                format!("line {} has a {}-char digest for {algorithm}", index + 1, digest.len()),
            ));
        }
        if !is_contained(&entry_path) {
            return Err(BagError::structure(
                entry_path,
                format!("{name} lists a path escaping the package"),
            ));
        }
        if !seen.insert(entry_path.clone()) {
            return Err(BagError::structure(
                entry_path,
                format!("{name} lists the path more than once"),
            ));
        }
        entries.push(ManifestEntry {
            digest,
            path: entry_path,
        });
    }
    Ok(entries)
}

fn walk_payload(root: &Path) -> Result<BTreeMap<String, u64>, BagError> {
    let data_dir = root.join(DATA_DIR);
    let mut sizes = BTreeMap::new();
    for entry in WalkDir::new(&data_dir).follow_links(false) {
        let entry = entry.map_err(|err| {
            let shown = err
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| data_dir.display().to_string());
            BagError::io(shown, crate::fsops::walk_error_to_io(err))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = relative_slash_path(root, entry.path()).ok_or_else(|| {
            BagError::structure(
                entry.path().display().to_string(),
                "payload path is not valid UTF-8",
            )
        })?;
        if !entry.file_type().is_file() {
            return Err(BagError::structure(
                relative,
                "payload entry is not a regular file",
            ));
        }
        let size = entry
            .metadata()
            .map_err(|err| BagError::io(&relative, crate::fsops::walk_error_to_io(err)))?
            .len();
        sizes.insert(relative, size);
    }
    Ok(sizes)
}

fn is_contained(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

fn strip_affixes<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)
}

fn parse_algorithm(file_name: &str, algorithm_name: &str) -> Result<Algorithm, BagError> {
    Algorithm::parse(algorithm_name).ok_or_else(|| {
        BagError::structure(
            file_name,
            format!("unsupported manifest algorithm `{algorithm_name}`"),
        )
    })
}

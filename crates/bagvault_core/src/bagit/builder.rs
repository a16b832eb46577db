//! Package assembly state machine.
//!
//! # Responsibility
//! - Drive one package root through `Draft -> ... -> Finalized`.
//! - Keep the root on disk when a step fails so it can be inspected.
//!
//! # Invariants
//! - Steps run strictly in order; calling one out of order is
//!   `InvalidState` and does not touch the package.
//! - Any error inside a step moves the builder to `Failed`.
//! - `finalize` on a finalized builder returns the stored result.

use super::reader::BagReader;
use super::tag_files::{render_declaration, render_manifest, BagInfo};
use super::{
    manifest_file_name, tag_manifest_file_name, BagError, BagState, BAGIT_TXT, BAG_INFO_TXT,
    DATA_DIR,
};
use crate::cancel::CancelToken;
use crate::checksum::{Algorithm, ChecksumEngine, DigestSet};
use crate::fsops::{
    copy_file_atomic, join_slash_path, rename_with_retry, set_tree_readonly, tree_size,
    RetryPolicy, SourceFile,
};
use chrono::NaiveDate;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Identity and policy for one packaging attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagRequest {
    pub package_id: Uuid,
    pub project_id: Uuid,
    pub project_name: String,
    pub description: Option<String>,
    pub software_agent: String,
    pub source_organization: Option<String>,
    /// First entry is the primary manifest algorithm.
    pub manifest_algorithms: Vec<Algorithm>,
    /// Extra per-file digests kept for the database.
    pub fixity_algorithms: Vec<Algorithm>,
    pub bagging_date: NaiveDate,
}

impl BagRequest {
    fn primary_algorithm(&self) -> Option<Algorithm> {
        self.manifest_algorithms.first().copied()
    }

    fn external_description(&self) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => description.to_string(),
            _ => format!("Archived project: {}", self.project_name),
        }
    }
}

/// One payload file after hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    /// Path relative to `data/`, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub digests: DigestSet,
}

/// Result of a finalized package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBag {
    pub root: PathBuf,
    pub entries: Vec<PayloadEntry>,
    pub payload_bytes: u64,
    pub payload_files: u64,
    /// Total size of the package directory, tag files included.
    pub bag_bytes: u64,
    /// Primary-algorithm digest of the primary manifest file.
    pub manifest_digest: String,
    pub manifest_algorithm: Algorithm,
}

/// Assembles one package root.
#[derive(Debug)]
pub struct BagBuilder {
    request: BagRequest,
    root: PathBuf,
    sources: Vec<SourceFile>,
    retry: RetryPolicy,
    state: BagState,
    entries: Vec<PayloadEntry>,
    manifest_digest: Option<String>,
    failure: Option<String>,
    finalized: Option<FinalizedBag>,
}

impl BagBuilder {
    /// Reserves `root` (which must not exist yet) and enters `Draft`.
    pub fn reserve(
        request: BagRequest,
        root: &Path,
        sources: Vec<SourceFile>,
        retry: RetryPolicy,
    ) -> Result<Self, BagError> {
        if request.primary_algorithm().is_none() {
            return Err(BagError::structure(
                root.display().to_string(),
                "no manifest algorithm requested",
            ));
        }
        if let Some(parent) = root.parent() {
            fs::create_dir_all(parent).map_err(|err| BagError::io(parent.display(), err))?;
        }
        fs::create_dir(root).map_err(|err| BagError::io(root.display(), err))?;
        let data_dir = root.join(DATA_DIR);
        fs::create_dir(&data_dir).map_err(|err| BagError::io(data_dir.display(), err))?;

        info!(
            "event=bag_reserve module=bagit status=ok package_id={} files={}",
            request.package_id,
            sources.len()
        );
        Ok(Self {
            request,
            root: root.to_path_buf(),
            sources,
            retry,
            state: BagState::Draft,
            entries: Vec::new(),
            manifest_digest: None,
            failure: None,
            finalized: None,
        })
    }

    pub fn state(&self) -> BagState {
        self.state
    }

    /// Current package directory; moves on `finalize`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn request(&self) -> &BagRequest {
        &self.request
    }

    /// Message of the error that moved the builder to `Failed`.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Runs every step up to and including `finalize(dest)`.
    pub fn run(&mut self, cancel: &CancelToken, dest: &Path) -> Result<FinalizedBag, BagError> {
        let started = Instant::now();
        self.copy_payload(cancel)?;
        self.hash_payload(cancel)?;
        self.write_tag_files()?;
        self.validate(cancel)?;
        let finalized = self.finalize(dest)?;
        info!(
            "event=bag_build module=bagit status=ok package_id={} files={} bytes={} duration_ms={}",
            self.request.package_id,
            finalized.payload_files,
            finalized.payload_bytes,
            started.elapsed().as_millis()
        );
        Ok(finalized)
    }

    /// `Draft -> Copying`: copies every source under `data/`.
    pub fn copy_payload(&mut self, cancel: &CancelToken) -> Result<(), BagError> {
        self.expect_state(BagState::Draft)?;
        self.state = BagState::Copying;
        let result = self.copy_all(cancel);
        self.settle(result)
    }

    /// `Copying -> Hashing`: digests every copied payload file.
    pub fn hash_payload(&mut self, cancel: &CancelToken) -> Result<(), BagError> {
        self.expect_state(BagState::Copying)?;
        self.state = BagState::Hashing;
        let result = self.hash_all(cancel);
        self.settle(result)
    }

    /// `Hashing -> ManifestWritten`: writes declaration, manifests,
    /// bag-info and the tag manifest.
    pub fn write_tag_files(&mut self) -> Result<(), BagError> {
        self.expect_state(BagState::Hashing)?;
        let result = self.write_all_tag_files();
        self.settle(result)?;
        self.state = BagState::ManifestWritten;
        Ok(())
    }

    /// `ManifestWritten -> Validated`: re-reads the package and verifies
    /// every manifest digest against the file on disk.
    pub fn validate(&mut self, cancel: &CancelToken) -> Result<(), BagError> {
        self.expect_state(BagState::ManifestWritten)?;
        let result = BagReader::open(&self.root).and_then(|reader| reader.verify(cancel));
        match result {
            Ok(verified) if verified.payload_files == self.entries.len() as u64 => {
                self.state = BagState::Validated;
                Ok(())
            }
            Ok(verified) => self.settle(Err(BagError::structure(
                self.root.display().to_string(),
                format!(
                    "package holds {} payload files, expected {}",
                    verified.payload_files,
                    self.entries.len()
                ),
            ))),
            Err(err) => self.settle(Err(err)),
        }
    }

    /// `Validated -> Finalized`: renames the package to `dest` and marks
    /// its files read-only. Idempotent once finalized.
    pub fn finalize(&mut self, dest: &Path) -> Result<FinalizedBag, BagError> {
        if let Some(finalized) = &self.finalized {
            return Ok(finalized.clone());
        }
        self.expect_state(BagState::Validated)?;
        let result = self.move_into_place(dest);
        let finalized = self.settle(result)?;
        self.state = BagState::Finalized;
        self.finalized = Some(finalized.clone());
        Ok(finalized)
    }

    /// Moves the builder to `Failed` without touching the package root.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        warn!(
            "event=bag_build module=bagit status=error package_id={} state={} root={}",
            self.request.package_id,
            self.state,
            self.root.display()
        );
        self.state = BagState::Failed;
        self.failure = Some(reason);
    }

    fn expect_state(&self, expected: BagState) -> Result<(), BagError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BagError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn settle<T>(&mut self, result: Result<T, BagError>) -> Result<T, BagError> {
        if let Err(err) = &result {
            self.fail(err.to_string());
        }
        result
    }

    fn copy_all(&mut self, cancel: &CancelToken) -> Result<(), BagError> {
        let data_dir = self.root.join(DATA_DIR);
        for source in &mut self.sources {
            if cancel.is_cancelled() {
                return Err(BagError::Cancelled);
            }
            let dest = join_slash_path(&data_dir, &source.rel_path);
            let copied = copy_file_atomic(&source.source, &dest, &self.retry)
                .map_err(|err| BagError::io(source.source.display(), err))?;
            source.size = copied;
        }
        Ok(())
    }

    fn hash_all(&mut self, cancel: &CancelToken) -> Result<(), BagError> {
        let engine = ChecksumEngine::new(
            self.request
                .manifest_algorithms
                .iter()
                .chain(self.request.fixity_algorithms.iter())
                .copied(),
        );
        let data_dir = self.root.join(DATA_DIR);
        let mut entries = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let path = join_slash_path(&data_dir, &source.rel_path);
            let digests = engine.digest_file(&path, cancel)?;
            entries.push(PayloadEntry {
                rel_path: source.rel_path.clone(),
                size: source.size,
                digests,
            });
        }
        entries.sort_by(|left, right| left.rel_path.cmp(&right.rel_path));
        self.entries = entries;
        Ok(())
    }

    fn write_all_tag_files(&mut self) -> Result<(), BagError> {
        let primary = self
            .request
            .primary_algorithm()
            .ok_or_else(|| BagError::structure(BAGIT_TXT, "no manifest algorithm requested"))?;
        let mut tag_files = vec![BAGIT_TXT.to_string()];
        self.write_file(BAGIT_TXT, render_declaration().as_bytes())?;

        for algorithm in &self.request.manifest_algorithms {
            let lines: Vec<(String, String)> = self
                .entries
                .iter()
                .map(|entry| {
                    let digest = entry.digests.get(algorithm).cloned().unwrap_or_default();
                    (digest, format!("{DATA_DIR}/{}", entry.rel_path))
                })
                .collect();
            let manifest = render_manifest(
                lines
                    .iter()
                    .map(|(digest, path)| (digest.as_str(), path.as_str())),
            );
            let name = manifest_file_name(*algorithm);
            self.write_file(&name, manifest.as_bytes())?;
            if *algorithm == primary {
                let digests = ChecksumEngine::new([primary]).digest_bytes(manifest.as_bytes());
                self.manifest_digest = digests.get(&primary).cloned();
            }
            tag_files.push(name);
        }

        let info = BagInfo {
            software_agent: self.request.software_agent.clone(),
            bagging_date: self.request.bagging_date,
            payload_bytes: self.entries.iter().map(|entry| entry.size).sum(),
            payload_files: self.entries.len() as u64,
            source_organization: self.request.source_organization.clone(),
            external_description: self.request.external_description(),
            external_identifier: self.request.project_id.to_string(),
            internal_sender_identifier: self.request.package_id.to_string(),
        };
        self.write_file(BAG_INFO_TXT, info.render().as_bytes())?;
        tag_files.push(BAG_INFO_TXT.to_string());

        let engine = ChecksumEngine::new([primary]);
        let mut tag_lines = Vec::with_capacity(tag_files.len());
        for name in &tag_files {
            let digests = engine.digest_file(&self.root.join(name), &CancelToken::new())?;
            let digest = digests.get(&primary).cloned().unwrap_or_default();
            tag_lines.push((digest, name.clone()));
        }
        let tag_manifest = render_manifest(
            tag_lines
                .iter()
                .map(|(digest, path)| (digest.as_str(), path.as_str())),
        );
        self.write_file(&tag_manifest_file_name(primary), tag_manifest.as_bytes())
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), BagError> {
        let path = self.root.join(name);
        fs::write(&path, bytes).map_err(|err| BagError::io(path.display(), err))
    }

    fn move_into_place(&mut self, dest: &Path) -> Result<FinalizedBag, BagError> {
        if dest.exists() {
            return Err(BagError::structure(
                dest.display().to_string(),
                "package destination already exists",
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| BagError::io(parent.display(), err))?;
        }
        rename_with_retry(&self.root, dest, &self.retry)
            .map_err(|err| BagError::io(self.root.display(), err))?;
        self.root = dest.to_path_buf();
        set_tree_readonly(dest, true).map_err(|err| BagError::io(dest.display(), err))?;
        let bag_bytes = tree_size(dest).map_err(|err| BagError::io(dest.display(), err))?;

        let manifest_algorithm = self
            .request
            .primary_algorithm()
            .ok_or_else(|| BagError::structure(BAGIT_TXT, "no manifest algorithm requested"))?;
        Ok(FinalizedBag {
            root: dest.to_path_buf(),
            entries: self.entries.clone(),
            payload_bytes: self.entries.iter().map(|entry| entry.size).sum(),
            payload_files: self.entries.len() as u64,
            bag_bytes,
            manifest_digest: self.manifest_digest.clone().unwrap_or_default(),
            manifest_algorithm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BagBuilder, BagRequest};
    use crate::bagit::{BagError, BagReader, BagState};
    use crate::cancel::CancelToken;
    use crate::checksum::Algorithm;
    use crate::fsops::{expand_inputs, remove_tree, RetryPolicy};
    use chrono::NaiveDate;
    use std::fs;
    use std::path::{Path, PathBuf};
    use uuid::Uuid;

    fn request() -> BagRequest {
        BagRequest {
            package_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            project_name: "Field Notes".to_string(),
            description: None,
            software_agent: "bagvault_core test".to_string(),
            source_organization: Some("Example Archive".to_string()),
            manifest_algorithms: vec![Algorithm::Sha256],
            fixity_algorithms: vec![Algorithm::Blake3, Algorithm::Md5],
            bagging_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        }
    }

    fn write_inputs(dir: &Path) -> Vec<PathBuf> {
        let input = dir.join("input");
        fs::create_dir_all(input.join("nested")).unwrap();
        fs::write(input.join("a.txt"), vec![b'a'; 500]).unwrap();
        fs::write(input.join("b.txt"), vec![b'b'; 500]).unwrap();
        fs::write(input.join("nested").join("c.txt"), vec![b'c'; 500]).unwrap();
        vec![
            input.join("nested").join("c.txt"),
            input.join("a.txt"),
            input.join("b.txt"),
        ]
    }

    #[test]
    fn run_produces_valid_read_only_package() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(dir.path());
        let sources = expand_inputs(&inputs).unwrap();
        let staging = dir.path().join("staging").join("bag");
        let dest = dir.path().join("bags").join("Field Notes-1");

        let mut builder =
            BagBuilder::reserve(request(), &staging, sources, RetryPolicy::no_retry()).unwrap();
        assert_eq!(builder.state(), BagState::Draft);
        let finalized = builder.run(&CancelToken::new(), &dest).unwrap();

        assert_eq!(builder.state(), BagState::Finalized);
        assert!(!staging.exists());
        assert_eq!(finalized.payload_files, 3);
        assert_eq!(finalized.payload_bytes, 1500);
        assert_eq!(finalized.manifest_digest.len(), 64);
        assert!(finalized.entries[0].digests.contains_key(&Algorithm::Blake3));
        assert!(fs::metadata(dest.join("data/a.txt"))
            .unwrap()
            .permissions()
            .readonly());

        let reader = BagReader::open(&dest).unwrap();
        assert_eq!(reader.info_value("Payload-Oxum"), Some("1500.3"));
        assert_eq!(
            reader.info_value("External-Description"),
            Some("Archived project: Field Notes")
        );
        reader.verify(&CancelToken::new()).unwrap();
        remove_tree(&dest).unwrap();
    }

    #[test]
    fn finalize_twice_returns_same_result() {
        let dir = tempfile::tempdir().unwrap();
        let sources = expand_inputs(&write_inputs(dir.path())).unwrap();
        let staging = dir.path().join("staging");
        let dest = dir.path().join("final");

        let mut builder =
            BagBuilder::reserve(request(), &staging, sources, RetryPolicy::no_retry()).unwrap();
        let first = builder.run(&CancelToken::new(), &dest).unwrap();
        let second = builder.finalize(&dir.path().join("elsewhere")).unwrap();

        assert_eq!(first, second);
        assert!(!dir.path().join("elsewhere").exists());
        remove_tree(&dest).unwrap();
    }

    #[test]
    fn manifest_is_identical_for_any_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(dir.path());
        let mut reversed = inputs.clone();
        reversed.reverse();

        let mut manifests = Vec::new();
        for (index, order) in [inputs, reversed].into_iter().enumerate() {
            let sources = expand_inputs(&order).unwrap();
            let staging = dir.path().join(format!("staging-{index}"));
            let dest = dir.path().join(format!("bag-{index}"));
            let mut builder =
                BagBuilder::reserve(request(), &staging, sources, RetryPolicy::no_retry())
                    .unwrap();
            builder.run(&CancelToken::new(), &dest).unwrap();
            manifests.push(fs::read(dest.join("manifest-sha256.txt")).unwrap());
            remove_tree(&dest).unwrap();
        }

        assert_eq!(manifests[0], manifests[1]);
        let text = String::from_utf8(manifests[0].clone()).unwrap();
        let paths: Vec<_> = text
            .lines()
            .map(|line| line.split_once("  ").unwrap().1)
            .collect();
        assert_eq!(paths, vec!["data/a.txt", "data/b.txt", "data/nested/c.txt"]);
    }

    #[test]
    fn cancelled_copy_fails_and_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sources = expand_inputs(&write_inputs(dir.path())).unwrap();
        let staging = dir.path().join("staging");
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut builder =
            BagBuilder::reserve(request(), &staging, sources, RetryPolicy::no_retry()).unwrap();
        let err = builder.copy_payload(&cancel).unwrap_err();

        assert!(matches!(err, BagError::Cancelled));
        assert_eq!(builder.state(), BagState::Failed);
        assert!(builder.failure().is_some());
        assert!(staging.join("data").is_dir());
    }

    #[test]
    fn out_of_order_step_is_rejected_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let sources = expand_inputs(&write_inputs(dir.path())).unwrap();
        let mut builder = BagBuilder::reserve(
            request(),
            &dir.path().join("staging"),
            sources,
            RetryPolicy::no_retry(),
        )
        .unwrap();

        let err = builder.write_tag_files().unwrap_err();
        assert!(matches!(
            err,
            BagError::InvalidState {
                expected: BagState::Hashing,
                actual: BagState::Draft
            }
        ));
        assert_eq!(builder.state(), BagState::Draft);
    }

    #[test]
    fn tampering_before_validation_fails_with_offending_path() {
        let dir = tempfile::tempdir().unwrap();
        let sources = expand_inputs(&write_inputs(dir.path())).unwrap();
        let staging = dir.path().join("staging");
        let cancel = CancelToken::new();

        let mut builder =
            BagBuilder::reserve(request(), &staging, sources, RetryPolicy::no_retry()).unwrap();
        builder.copy_payload(&cancel).unwrap();
        builder.hash_payload(&cancel).unwrap();
        builder.write_tag_files().unwrap();
        fs::write(staging.join("data/b.txt"), vec![b'x'; 500]).unwrap();

        match builder.validate(&cancel).unwrap_err() {
            BagError::ChecksumMismatch { paths } => assert_eq!(paths, vec!["data/b.txt"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.state(), BagState::Failed);
    }
}

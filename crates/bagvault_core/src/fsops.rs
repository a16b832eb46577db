//! File-system primitives shared by packaging, quarantine and scanning.
//!
//! # Responsibility
//! - Expand caller inputs into a validated, de-duplicated payload list.
//! - Provide per-file atomic copies (temporary name, then rename).
//! - Retry transient I/O failures a bounded number of times.
//!
//! # Invariants
//! - A half-written copy is never visible under its final name.
//! - Relative payload paths are UTF-8 and `/`-separated on every platform.

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;

static RESERVED_NAME_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[/\\:*?"<>|]"#).expect("valid reserved-char regex"));
static OTHER_NAME_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w .\-]").expect("valid name-char regex"));

const MAX_DIR_NAME_CHARS: usize = 64;

/// Bounded retry budget for transient I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Runs `op`, retrying only while the error looks transient.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && is_transient(&err) => {
                    warn!(
                        "event=io_retry module=fsops status=retry op={} attempt={} error={}",
                        what, attempt, err
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

/// Whether an I/O error is worth retrying (interruptions, lock contention).
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Renames `from` to `to`, retrying transient failures.
pub fn rename_with_retry(from: &Path, to: &Path, retry: &RetryPolicy) -> io::Result<()> {
    retry.run("rename", || fs::rename(from, to))
}

/// Copies one file so that `dest` only ever appears fully written.
///
/// Returns the number of bytes copied.
pub fn copy_file_atomic(source: &Path, dest: &Path, retry: &RetryPolicy) -> io::Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{file_name}.partial-{}", Uuid::new_v4().simple()));

    let result = retry.run("copy", || {
        let mut reader = File::open(source)?;
        let mut writer = File::create(&temp)?;
        let copied = io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;
        Ok(copied)
    });

    let copied = match result {
        Ok(copied) => copied,
        Err(err) => {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
    };

    if let Err(err) = rename_with_retry(&temp, dest, retry) {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }
    Ok(copied)
}

/// Copies every regular file under `source_root` into `dest_root`.
pub fn copy_tree(source_root: &Path, dest_root: &Path, retry: &RetryPolicy) -> io::Result<u64> {
    fs::create_dir_all(dest_root)?;
    let mut total = 0u64;
    for entry in WalkDir::new(source_root).sort_by_file_name() {
        let entry = entry.map_err(walk_error_to_io)?;
        let relative = entry
            .path()
            .strip_prefix(source_root)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        if entry.file_type().is_dir() {
            fs::create_dir_all(dest_root.join(relative))?;
        } else if entry.file_type().is_file() {
            total += copy_file_atomic(entry.path(), &dest_root.join(relative), retry)?;
        }
    }
    Ok(total)
}

/// Sets or clears the read-only bit on every regular file under `root`.
pub fn set_tree_readonly(root: &Path, readonly: bool) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(walk_error_to_io)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let mut permissions = entry.metadata().map_err(walk_error_to_io)?.permissions();
        if permissions.readonly() == readonly {
            continue;
        }
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(readonly);
        fs::set_permissions(entry.path(), permissions)?;
    }
    Ok(())
}

/// Deletes a directory tree, clearing read-only marks first.
pub fn remove_tree(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    set_tree_readonly(root, false)?;
    fs::remove_dir_all(root)
}

/// Total byte size of regular files under `root`.
pub fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(walk_error_to_io)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(walk_error_to_io)?.len();
        }
    }
    Ok(total)
}

/// Converts `path` below `base` into a `/`-separated UTF-8 relative path.
pub fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Joins a `/`-separated relative path onto `base` using native separators.
pub fn join_slash_path(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}

/// Produces a safe, visible directory name from a user-supplied name.
pub fn sanitize_dir_name(name: &str) -> String {
    let replaced = RESERVED_NAME_CHARS_RE.replace_all(name, "-");
    let replaced = OTHER_NAME_CHARS_RE.replace_all(&replaced, "_");
    let trimmed = replaced.trim().trim_start_matches('.').trim();
    let truncated: String = trimmed.chars().take(MAX_DIR_NAME_CHARS).collect();
    let truncated = truncated.trim_end().to_string();
    if truncated.is_empty() {
        "project".to_string()
    } else {
        truncated
    }
}

pub(crate) fn walk_error_to_io(err: walkdir::Error) -> io::Error {
    let message = err.to_string();
    match err.into_io_error() {
        Some(io_err) => io_err,
        None => io::Error::new(io::ErrorKind::Other, message),
    }
}

/// One regular file selected for preservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Canonical absolute source path.
    pub source: PathBuf,
    /// `/`-separated path relative to the common input root.
    pub rel_path: String,
    pub size: u64,
}

/// Input validation failures. Raised before any state is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    NoPaths,
    NotAbsolute(String),
    Missing(String),
    Unreadable { path: String, message: String },
    Duplicate(String),
    NonUtf8(String),
    NoCommonRoot,
    NoFiles,
}

impl Display for InputError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPaths => write!(f, "at least one input path is required"),
            Self::NotAbsolute(path) => write!(f, "input path must be absolute: {path}"),
            Self::Missing(path) => write!(f, "input path does not exist: {path}"),
            Self::Unreadable { path, message } => {
                write!(f, "input path is not readable: {path}: {message}")
            }
            Self::Duplicate(path) => write!(f, "input path is listed more than once: {path}"),
            Self::NonUtf8(path) => write!(f, "input path is not valid UTF-8: {path}"),
            Self::NoCommonRoot => write!(f, "input paths share no common root"),
            Self::NoFiles => write!(f, "inputs contain no regular files"),
        }
    }
}

impl Error for InputError {}

/// Validates and recursively expands absolute input paths.
///
/// Relative payload paths are computed against the deepest directory
/// shared by all inputs (a file contributes its parent directory).
/// Output is sorted by relative path.
pub fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<SourceFile>, InputError> {
    if paths.is_empty() {
        return Err(InputError::NoPaths);
    }

    let mut canonical_inputs = Vec::with_capacity(paths.len());
    let mut seen_inputs = HashSet::new();
    for path in paths {
        let shown = path.display().to_string();
        if !path.is_absolute() {
            return Err(InputError::NotAbsolute(shown));
        }
        let canonical = fs::canonicalize(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => InputError::Missing(shown.clone()),
            _ => InputError::Unreadable {
                path: shown.clone(),
                message: err.to_string(),
            },
        })?;
        if !seen_inputs.insert(canonical.clone()) {
            return Err(InputError::Duplicate(shown));
        }
        let metadata = fs::metadata(&canonical).map_err(|err| InputError::Unreadable {
            path: shown.clone(),
            message: err.to_string(),
        })?;
        canonical_inputs.push((canonical, metadata.is_dir()));
    }

    let root = common_root(&canonical_inputs).ok_or(InputError::NoCommonRoot)?;
    let mut seen_files = HashSet::new();
    let mut files = Vec::new();

    for (input, is_dir) in &canonical_inputs {
        if *is_dir {
            for entry in WalkDir::new(input).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|err| InputError::Unreadable {
                    path: input.display().to_string(),
                    message: err.to_string(),
                })?;
                if entry.file_type().is_symlink() {
                    debug!(
                        "event=input_expand module=fsops status=skip reason=symlink path={}",
                        entry.path().display()
                    );
                    continue;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let file = source_file(&root, entry.path())?;
                if !seen_files.insert(file.source.clone()) {
                    return Err(InputError::Duplicate(file.source.display().to_string()));
                }
                files.push(file);
            }
        } else {
            let file = source_file(&root, input)?;
            if !seen_files.insert(file.source.clone()) {
                return Err(InputError::Duplicate(file.source.display().to_string()));
            }
            files.push(file);
        }
    }

    if files.is_empty() {
        return Err(InputError::NoFiles);
    }
    files.sort_by(|left, right| left.rel_path.cmp(&right.rel_path));
    Ok(files)
}

fn source_file(root: &Path, path: &Path) -> Result<SourceFile, InputError> {
    let shown = path.display().to_string();
    let rel_path =
        relative_slash_path(root, path).ok_or_else(|| InputError::NonUtf8(shown.clone()))?;
    let file = File::open(path).map_err(|err| InputError::Unreadable {
        path: shown.clone(),
        message: err.to_string(),
    })?;
    let size = file
        .metadata()
        .map_err(|err| InputError::Unreadable {
            path: shown,
            message: err.to_string(),
        })?
        .len();
    Ok(SourceFile {
        source: path.to_path_buf(),
        rel_path,
        size,
    })
}

fn common_root(inputs: &[(PathBuf, bool)]) -> Option<PathBuf> {
    let mut anchors = inputs.iter().map(|(path, is_dir)| {
        if *is_dir {
            path.as_path()
        } else {
            path.parent().unwrap_or(path.as_path())
        }
    });
    let mut root = anchors.next()?.to_path_buf();
    for anchor in anchors {
        while !anchor.starts_with(&root) {
            root = root.parent()?.to_path_buf();
        }
    }
    Some(root)
}

#[cfg(test)]
mod tests {
    use super::{
        copy_file_atomic, expand_inputs, join_slash_path, relative_slash_path, sanitize_dir_name,
        InputError, RetryPolicy,
    };
    use std::fs;
    use std::io;
    use std::path::Path;

    #[test]
    fn sanitize_dir_name_replaces_unsafe_characters() {
        assert_eq!(sanitize_dir_name("My Project"), "My Project");
        assert_eq!(sanitize_dir_name("Project/With\\Slashes"), "Project-With-Slashes");
        assert_eq!(sanitize_dir_name("Invalid:Name*?"), "Invalid-Name--");
        assert_eq!(sanitize_dir_name("..hidden"), "hidden");
        assert_eq!(sanitize_dir_name("   "), "project");
        assert_eq!(sanitize_dir_name("tab\there"), "tab_here");
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let base = Path::new("/vault/projects");
        let nested = base.join("alpha").join("beta.txt");
        assert_eq!(
            relative_slash_path(base, &nested).as_deref(),
            Some("alpha/beta.txt")
        );
        assert_eq!(relative_slash_path(base, base), None);
        assert_eq!(join_slash_path(base, "alpha/beta.txt"), nested);
    }

    #[test]
    fn retry_policy_retries_only_transient_errors() {
        let policy = RetryPolicy::new(3, std::time::Duration::ZERO);
        let mut calls = 0;
        let value = policy
            .run("test", || {
                calls += 1;
                if calls < 3 {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "busy"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 3);

        let mut permanent_calls = 0;
        let err = policy
            .run("test", || -> io::Result<()> {
                permanent_calls += 1;
                Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(permanent_calls, 1);
    }

    #[test]
    fn atomic_copy_leaves_no_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload bytes").unwrap();
        let dest = dir.path().join("out").join("dest.bin");

        let copied = copy_file_atomic(&source, &dest, &RetryPolicy::no_retry()).unwrap();
        assert_eq!(copied, 13);
        assert_eq!(fs::read(&dest).unwrap(), b"payload bytes");

        let leftovers: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["dest.bin".to_string()]);
    }

    #[test]
    fn expand_inputs_uses_common_root_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/sub")).unwrap();
        fs::write(root.join("docs/sub/z.txt"), b"z").unwrap();
        fs::write(root.join("docs/a.txt"), b"aa").unwrap();
        fs::write(root.join("b.txt"), b"bbb").unwrap();

        let files = expand_inputs(&[root.join("b.txt"), root.join("docs")]).unwrap();
        let rel: Vec<_> = files.iter().map(|file| file.rel_path.as_str()).collect();
        assert_eq!(rel, vec!["b.txt", "docs/a.txt", "docs/sub/z.txt"]);
        assert_eq!(files.iter().map(|file| file.size).sum::<u64>(), 6);
    }

    #[test]
    fn expand_inputs_single_directory_is_its_own_root() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("notes.md"), b"n").unwrap();

        let files = expand_inputs(&[project]).unwrap();
        assert_eq!(files[0].rel_path, "notes.md");
    }

    #[test]
    fn expand_inputs_rejects_invalid_lists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"a").unwrap();

        assert_eq!(expand_inputs(&[]).unwrap_err(), InputError::NoPaths);
        assert!(matches!(
            expand_inputs(&["relative.txt".into()]).unwrap_err(),
            InputError::NotAbsolute(_)
        ));
        assert!(matches!(
            expand_inputs(&[dir.path().join("missing.txt")]).unwrap_err(),
            InputError::Missing(_)
        ));
        assert!(matches!(
            expand_inputs(&[file.clone(), dir.path().join(".").join("a.txt")]).unwrap_err(),
            InputError::Duplicate(_)
        ));
        assert!(matches!(
            expand_inputs(&[dir.path().to_path_buf(), file]).unwrap_err(),
            InputError::Duplicate(_)
        ));

        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert_eq!(expand_inputs(&[empty]).unwrap_err(), InputError::NoFiles);
    }
}

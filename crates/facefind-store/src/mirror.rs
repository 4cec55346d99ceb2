//! Mirroring between durable object storage and the local working set.
//!
//! Originals, resized images and embedding files are kept in a bucket-like
//! store and copied to local directories before ingestion or query serving.
//! Transfers are idempotent per key.

use crate::fsutil::{self, extension_allowed, slash_path};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> MirrorError {
    MirrorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Minimal key/value object storage.
pub trait ObjectStore: Send + Sync {
    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, MirrorError>;
    fn download(&self, key: &str, local: &Path) -> Result<(), MirrorError>;
    fn upload(&self, local: &Path, key: &str) -> Result<(), MirrorError>;

    /// Local directory holding the objects, when they are already on disk
    /// and need no download.
    fn local_root(&self) -> Option<&Path> {
        None
    }
}

/// Object store backed by a local directory; keys are `/`-separated paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, MirrorError> {
        let rel = Path::new(key.trim_start_matches('/'));
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(MirrorError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for FilesystemStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, MirrorError> {
        let prefix = prefix.trim_start_matches('/');
        // Walk only the deepest directory the prefix names.
        let base = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| MirrorError::InvalidKey(entry.path().display().to_string()))?;
            let key = slash_path(rel);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), MirrorError> {
        let src = self.resolve(key)?;
        if !src.is_file() {
            return Err(MirrorError::NotFound(key.to_string()));
        }
        let bytes = fs::read(&src).map_err(|e| io_err(&src, e))?;
        fsutil::write_atomic(local, &bytes).map_err(|e| io_err(local, e))
    }

    fn upload(&self, local: &Path, key: &str) -> Result<(), MirrorError> {
        let dst = self.resolve(key)?;
        let bytes = fs::read(local).map_err(|e| io_err(local, e))?;
        fsutil::write_atomic(&dst, &bytes).map_err(|e| io_err(&dst, e))
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Outcome of a mirror run.
#[derive(Debug, Clone, Default)]
pub struct MirrorReport {
    pub transferred: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

/// Copy every object under `prefix` into `local_dir`, keeping the key
/// layout below the prefix. Files already present locally are kept when
/// `skip_existing` is set.
pub fn download_prefix(
    store: &dyn ObjectStore,
    prefix: &str,
    local_dir: &Path,
    skip_existing: bool,
) -> Result<MirrorReport, MirrorError> {
    let mut report = MirrorReport::default();
    let prefix = prefix.trim_start_matches('/');

    for key in store.list(prefix)? {
        let Some(rest) = key.strip_prefix(prefix) else {
            tracing::warn!(key, prefix, "listed key is outside the prefix");
            report.failed.push((key.clone(), format!("key is not under prefix {prefix:?}")));
            continue;
        };
        let rel = rest.trim_start_matches('/');
        let rel = if rel.is_empty() {
            key.rsplit('/').next().unwrap_or(key.as_str())
        } else {
            rel
        };
        let local = local_dir.join(rel);

        if skip_existing && local.is_file() {
            report.skipped += 1;
            continue;
        }
        match store.download(&key, &local) {
            Ok(()) => {
                tracing::debug!(key, local = %local.display(), "downloaded");
                report.transferred += 1;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "download failed");
                report.failed.push((key.clone(), e.to_string()));
            }
        }
    }

    tracing::info!(
        prefix,
        transferred = report.transferred,
        skipped = report.skipped,
        failed = report.failed.len(),
        "download finished"
    );
    Ok(report)
}

/// Upload every file under `local_dir` whose extension is in `allowed`
/// (empty set: all files) to `prefix/<relative path>`.
pub fn upload_dir(
    store: &dyn ObjectStore,
    local_dir: &Path,
    prefix: &str,
    allowed: &BTreeSet<String>,
) -> Result<MirrorReport, MirrorError> {
    if !local_dir.is_dir() {
        return Err(io_err(
            local_dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }

    let mut report = MirrorReport::default();
    let prefix = prefix.trim_matches('/');

    for entry in WalkDir::new(local_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !extension_allowed(path, allowed) {
            report.skipped += 1;
            continue;
        }
        let rel = slash_path(path.strip_prefix(local_dir).unwrap_or(path));
        let key = if prefix.is_empty() {
            rel
        } else {
            format!("{prefix}/{rel}")
        };
        match store.upload(path, &key) {
            Ok(()) => report.transferred += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), key, error = %e, "upload failed");
                report.failed.push((key, e.to_string()));
            }
        }
    }

    tracing::info!(
        prefix,
        transferred = report.transferred,
        skipped = report.skipped,
        failed = report.failed.len(),
        "upload finished"
    );
    Ok(report)
}

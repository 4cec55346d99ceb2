//! Filesystem helpers shared by the store, the mirror and the pipeline.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Image extensions accepted by default (lowercase, with leading dot).
/// Only formats the `image` decoder reads.
pub const IMAGE_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".bmp"];

/// Replace `path` with `bytes` so readers see either the old file or the
/// complete new one, never a partial write.
///
/// Writes a hidden temp file next to the target, fsyncs it, renames it over
/// the target and fsyncs the directory. Parent directories are created.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    // Make the rename durable.
    if let Ok(dir) = File::open(&parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Normalise an extension to lowercase with a leading dot.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

/// Build an extension set from user input (`jpg`, `.PNG`, ...).
pub fn extension_set<I, S>(exts: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    exts.into_iter()
        .map(|e| normalize_extension(e.as_ref()))
        .collect()
}

pub fn default_image_extensions() -> BTreeSet<String> {
    extension_set(IMAGE_EXTENSIONS)
}

/// Whether `path` ends in one of `allowed`. An empty set allows everything.
pub fn extension_allowed(path: &Path, allowed: &BTreeSet<String>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match path.extension() {
        Some(ext) => allowed.contains(&normalize_extension(&ext.to_string_lossy())),
        None => false,
    }
}

/// Render a relative path with `/` separators, for identifiers and keys.
pub fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

//! Per-image embedding files.
//!
//! Every source image gets one file holding all of its face records, laid
//! out column by column: a header fixing model, detector and dimension,
//! followed by one array per field. Files live in a partition directory
//! named after the (detector, model) pair, since embedding length and
//! meaning depend on the model.

use crate::fsutil::{self, normalize_extension};
use facefind_core::{DetectorBackend, FaceDetection, FaceEmbedding, FacialArea};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const DEFAULT_EMBEDDING_EXT: &str = ".parq";

const FORMAT_TAG: &str = "facefind-embeddings";
const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt embedding file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("record for model {found} cannot go into the {expected} partition")]
    PartitionMismatch { expected: String, found: String },
    #[error("records disagree on embedding length: {expected} vs {found}")]
    InconsistentDimension { expected: usize, found: usize },
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// The (detector, model) pair a directory of embedding files belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub detector: DetectorBackend,
    pub model_name: String,
}

impl Partition {
    pub fn new(detector: DetectorBackend, model_name: impl Into<String>) -> Self {
        Self {
            detector,
            model_name: model_name.into(),
        }
    }

    /// Directory name, e.g. `emb_yolov8_Facenet`.
    pub fn dir_name(&self) -> String {
        format!(
            "emb_{}_{}",
            sanitize(self.detector.as_str()),
            sanitize(&self.model_name)
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

#[derive(Serialize, Deserialize)]
struct EmbeddingFile {
    format: String,
    version: u32,
    model_name: String,
    detector_backend: String,
    /// `None` for a file with no rows.
    dimension: Option<usize>,
    rows: usize,
    columns: Columns,
}

#[derive(Serialize, Deserialize, Default)]
struct Columns {
    filename: Vec<String>,
    model_name: Vec<String>,
    facial_area: Vec<FacialArea>,
    face_confidence: Vec<f32>,
    embedding: Vec<Vec<f32>>,
}

/// Decoded contents of one embedding file.
#[derive(Debug, Clone)]
pub struct EmbeddingFileContents {
    pub model_name: String,
    pub detector_backend: DetectorBackend,
    pub dimension: Option<usize>,
    pub records: Vec<FaceEmbedding>,
}

/// A file `read_dir` could not use.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Everything `read_dir` found in a partition.
#[derive(Debug, Clone, Default)]
pub struct DirContents {
    pub records: Vec<FaceEmbedding>,
    pub dimension: Option<usize>,
    pub files_read: usize,
    pub skipped: Vec<SkippedFile>,
}

/// Reads and writes the embedding files of one partition.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dir: PathBuf,
    partition: Partition,
    extension: String,
    dimension: Option<usize>,
}

impl EmbeddingStore {
    /// Store for `partition` under `base_dir/<partition dir name>`.
    pub fn new(base_dir: &Path, partition: Partition, extension: &str) -> Self {
        Self::at(base_dir.join(partition.dir_name()), partition, extension)
    }

    /// Store rooted at `dir`, which already is the partition directory.
    pub fn at(dir: PathBuf, partition: Partition, extension: &str) -> Self {
        Self {
            dir,
            partition,
            extension: normalize_extension(extension),
            dimension: None,
        }
    }

    /// Fix the embedding length `read_dir` accepts. Without it the first
    /// non-empty file decides.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Cache key of a source image: its relative path with this store's
    /// extension, under the partition directory.
    pub fn path_for(&self, relative_source: &Path) -> PathBuf {
        self.dir
            .join(relative_source)
            .with_extension(self.extension.trim_start_matches('.'))
    }

    pub fn contains(&self, relative_source: &Path) -> bool {
        self.path_for(relative_source).is_file()
    }

    /// Write all records of one source image to `path`, replacing any
    /// previous file. An empty slice writes a "no faces" marker.
    pub fn write(&self, path: &Path, records: &[FaceEmbedding]) -> Result<(), StoreError> {
        let mut dimension = None;
        let mut columns = Columns::default();

        for record in records {
            if record.model_name() != self.partition.model_name {
                return Err(StoreError::PartitionMismatch {
                    expected: self.partition.model_name.clone(),
                    found: record.model_name().to_string(),
                });
            }
            match dimension {
                None => dimension = Some(record.dimension()),
                Some(d) if d != record.dimension() => {
                    return Err(StoreError::InconsistentDimension {
                        expected: d,
                        found: record.dimension(),
                    })
                }
                Some(_) => {}
            }
            columns.filename.push(record.detection.filename.clone());
            columns.model_name.push(record.detection.model_name.clone());
            columns.facial_area.push(record.detection.facial_area.clone());
            columns.face_confidence.push(record.detection.face_confidence);
            columns.embedding.push(record.embedding.clone());
        }

        let file = EmbeddingFile {
            format: FORMAT_TAG.to_string(),
            version: FORMAT_VERSION,
            model_name: self.partition.model_name.clone(),
            detector_backend: self.partition.detector.to_string(),
            dimension,
            rows: records.len(),
            columns,
        };
        let bytes = serde_json::to_vec(&file)?;
        fsutil::write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))?;

        tracing::debug!(path = %path.display(), rows = records.len(), "embedding file written");
        Ok(())
    }

    /// Read one file and check that it belongs to this partition.
    pub fn read(&self, path: &Path) -> Result<Vec<FaceEmbedding>, StoreError> {
        let contents = read_file(path)?;
        if contents.model_name != self.partition.model_name {
            return Err(StoreError::corrupt(
                path,
                format!(
                    "belongs to model {}, partition is {}",
                    contents.model_name, self.partition.model_name
                ),
            ));
        }
        if contents.detector_backend != self.partition.detector {
            return Err(StoreError::corrupt(
                path,
                format!(
                    "written by detector {}, partition is {}",
                    contents.detector_backend, self.partition.detector
                ),
            ));
        }
        Ok(contents.records)
    }

    /// Read every embedding file under the partition directory.
    ///
    /// Unreadable files, and files whose embedding length differs from the
    /// configured dimension (or the first non-empty file when none is set),
    /// are reported in `skipped` and left out.
    pub fn read_dir(&self) -> Result<DirContents, StoreError> {
        if !self.dir.is_dir() {
            return Err(StoreError::NotADirectory(self.dir.clone()));
        }

        let mut out = DirContents {
            dimension: self.dimension,
            ..DirContents::default()
        };
        for entry in WalkDir::new(&self.dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || !self.is_embedding_file(entry.path()) {
                continue;
            }
            let path = entry.path();

            let records = match self.read(path) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable embedding file");
                    out.skipped.push(SkippedFile {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(first) = records.first() {
                match out.dimension {
                    None => out.dimension = Some(first.dimension()),
                    Some(d) if d != first.dimension() => {
                        let reason = format!(
                            "embedding length {} differs from corpus length {d}",
                            first.dimension()
                        );
                        tracing::warn!(path = %path.display(), %reason, "skipping embedding file");
                        out.skipped.push(SkippedFile {
                            path: path.to_path_buf(),
                            reason,
                        });
                        continue;
                    }
                    Some(_) => {}
                }
            }

            out.files_read += 1;
            out.records.extend(records);
        }
        Ok(out)
    }

    fn is_embedding_file(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| {
                let name = n.to_string_lossy();
                !name.starts_with('.') && name.to_ascii_lowercase().ends_with(&self.extension)
            })
            .unwrap_or(false)
    }
}

/// Decode one embedding file, validating its shape.
pub fn read_file(path: &Path) -> Result<EmbeddingFileContents, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let file: EmbeddingFile =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(path, e.to_string()))?;

    if file.format != FORMAT_TAG {
        return Err(StoreError::corrupt(path, format!("unknown format tag {:?}", file.format)));
    }
    if file.version != FORMAT_VERSION {
        return Err(StoreError::corrupt(path, format!("unsupported version {}", file.version)));
    }

    let c = file.columns;
    let lengths = [
        ("filename", c.filename.len()),
        ("model_name", c.model_name.len()),
        ("facial_area", c.facial_area.len()),
        ("face_confidence", c.face_confidence.len()),
        ("embedding", c.embedding.len()),
    ];
    for (name, len) in lengths {
        if len != file.rows {
            return Err(StoreError::corrupt(
                path,
                format!("column {name} has {len} entries, header says {}", file.rows),
            ));
        }
    }

    let expected_dim = match (file.dimension, file.rows) {
        (_, 0) => None,
        (Some(d), _) => Some(d),
        (None, _) => return Err(StoreError::corrupt(path, "missing dimension")),
    };

    let mut records = Vec::with_capacity(file.rows);
    let rows = c
        .filename
        .into_iter()
        .zip(c.model_name)
        .zip(c.facial_area)
        .zip(c.face_confidence)
        .zip(c.embedding);
    for (row, ((((filename, model_name), facial_area), face_confidence), embedding)) in
        rows.enumerate()
    {
        if model_name != file.model_name {
            return Err(StoreError::corrupt(
                path,
                format!("row {row} has model {model_name}, header says {}", file.model_name),
            ));
        }
        if Some(embedding.len()) != expected_dim {
            return Err(StoreError::corrupt(
                path,
                format!("row {row} embedding has {} values", embedding.len()),
            ));
        }
        records.push(FaceEmbedding {
            detection: FaceDetection {
                filename,
                model_name,
                facial_area,
                face_confidence,
            },
            embedding,
        });
    }

    Ok(EmbeddingFileContents {
        model_name: file.model_name,
        detector_backend: DetectorBackend::new(file.detector_backend),
        dimension: expected_dim,
        records,
    })
}

//! In-memory corpus of persisted embeddings.

use crate::codec::{EmbeddingStore, Partition, SkippedFile, StoreError};
use facefind_core::FaceEmbedding;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus directory not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Immutable collection of embeddings from one partition.
#[derive(Debug, Clone)]
pub struct Corpus {
    partition: Partition,
    dimension: Option<usize>,
    embeddings: Vec<FaceEmbedding>,
    files: usize,
    skipped: Vec<SkippedFile>,
}

impl Corpus {
    /// Wrap records that are already in memory.
    pub fn from_embeddings(partition: Partition, embeddings: Vec<FaceEmbedding>) -> Self {
        let dimension = embeddings.first().map(FaceEmbedding::dimension);
        Self {
            partition,
            dimension,
            embeddings,
            files: 0,
            skipped: Vec::new(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn embeddings(&self) -> &[FaceEmbedding] {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Number of embedding files the corpus was read from.
    pub fn files(&self) -> usize {
        self.files
    }

    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }
}

/// Reads a whole partition directory into a [`Corpus`].
#[derive(Debug, Clone)]
pub struct CorpusLoader {
    extension: String,
    dimension: Option<usize>,
}

impl CorpusLoader {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.to_string(),
            dimension: None,
        }
    }

    /// Only accept files whose embeddings have `dimension` values.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    /// Load every embedding file in `dir`, which must be the partition
    /// directory for `partition`.
    pub fn load(&self, dir: &Path, partition: &Partition) -> Result<Corpus, CorpusError> {
        if !dir.is_dir() {
            return Err(CorpusError::Missing(dir.to_path_buf()));
        }

        let mut store = EmbeddingStore::at(dir.to_path_buf(), partition.clone(), &self.extension);
        if let Some(dimension) = self.dimension {
            store = store.with_dimension(dimension);
        }
        let contents = store.read_dir()?;

        tracing::info!(
            dir = %dir.display(),
            partition = %partition.dir_name(),
            files = contents.files_read,
            embeddings = contents.records.len(),
            skipped = contents.skipped.len(),
            "corpus loaded"
        );

        Ok(Corpus {
            partition: partition.clone(),
            dimension: contents.dimension,
            embeddings: contents.records,
            files: contents.files_read,
            skipped: contents.skipped,
        })
    }
}

/// Shared reference to the current corpus.
///
/// Readers take a cheap [`Arc`] snapshot and keep using it even if the
/// corpus is replaced meanwhile; the old collection is never mutated.
#[derive(Debug)]
pub struct CorpusHandle {
    current: RwLock<Arc<Corpus>>,
}

impl CorpusHandle {
    pub fn new(corpus: Corpus) -> Self {
        Self {
            current: RwLock::new(Arc::new(corpus)),
        }
    }

    pub fn snapshot(&self) -> Arc<Corpus> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Swap in `corpus` for new readers and return the previous one.
    pub fn replace(&self, corpus: Corpus) -> Arc<Corpus> {
        let next = Arc::new(corpus);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_EMBEDDING_EXT;
    use facefind_core::{DetectorBackend, FaceDetection, FacialArea};

    fn partition() -> Partition {
        Partition::new(DetectorBackend::new("yolov8"), "Facenet")
    }

    fn record(filename: &str) -> FaceEmbedding {
        FaceEmbedding {
            detection: FaceDetection {
                filename: filename.into(),
                model_name: "Facenet".into(),
                facial_area: FacialArea::new(0.0, 0.0, 40.0, 40.0),
                face_confidence: 0.9,
            },
            embedding: vec![0.5, 0.5],
        }
    }

    #[test]
    fn test_load_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::new(dir.path(), partition(), DEFAULT_EMBEDDING_EXT);
        for name in ["a.jpg", "b.jpg"] {
            store
                .write(&store.path_for(Path::new(name)), &[record(name)])
                .unwrap();
        }
        store
            .write(&store.path_for(Path::new("empty.jpg")), &[])
            .unwrap();

        let corpus = CorpusLoader::new(DEFAULT_EMBEDDING_EXT)
            .load(store.dir(), &partition())
            .unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.files(), 3);
        assert_eq!(corpus.dimension(), Some(2));
        assert!(corpus.skipped().is_empty());
    }

    #[test]
    fn test_load_with_dimension_skips_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::new(dir.path(), partition(), DEFAULT_EMBEDDING_EXT);
        let mut stray = record("0stray.jpg");
        stray.embedding = vec![1.0; 5];
        store
            .write(&store.path_for(Path::new("0stray.jpg")), &[stray])
            .unwrap();
        for name in ["b.jpg", "c.jpg"] {
            store
                .write(&store.path_for(Path::new(name)), &[record(name)])
                .unwrap();
        }

        let corpus = CorpusLoader::new(DEFAULT_EMBEDDING_EXT)
            .with_dimension(2)
            .load(store.dir(), &partition())
            .unwrap();
        assert_eq!(corpus.dimension(), Some(2));
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.skipped().len(), 1);
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = CorpusLoader::new(DEFAULT_EMBEDDING_EXT)
            .load(&dir.path().join("nope"), &partition())
            .unwrap_err();
        assert!(matches!(err, CorpusError::Missing(_)));
    }

    #[test]
    fn test_handle_swap_keeps_old_snapshot() {
        let handle = CorpusHandle::new(Corpus::from_embeddings(partition(), vec![record("a.jpg")]));
        let before = handle.snapshot();

        handle.replace(Corpus::from_embeddings(
            partition(),
            vec![record("a.jpg"), record("b.jpg")],
        ));

        assert_eq!(before.len(), 1);
        assert_eq!(handle.snapshot().len(), 2);
    }
}

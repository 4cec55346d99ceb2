//! Photo search: validate uploads, embed their single face and match the
//! current corpus.

use crate::config::{ConfigError, Settings};
use crate::engine::{EngineError, EngineHandle};
use facefind_core::{
    DedupPolicy, DetectorBackend, ModelSpec, QualityGate, SearchError, SimilaritySearchEngine,
};
use facefind_store::{Corpus, CorpusError, CorpusHandle, CorpusLoader, Partition};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Failures shown to the person searching. Messages are complete sentences.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("too many photos: {count} uploaded, at most {max} allowed")]
    TooManyUploads { count: usize, max: usize },
    #[error("uploads are too large: {bytes} bytes in total, at most {max} allowed")]
    PayloadTooLarge { bytes: u64, max: u64 },
    #[error("{name} is not a readable image")]
    InvalidImage { name: String },
    #[error("no face found in {name}; use a photo showing one face clearly")]
    NoFace { name: String },
    #[error("{count} faces found in {name}; use a photo showing exactly one face")]
    MultipleFaces { name: String, count: usize },
    #[error("face model failed: {0}")]
    Engine(EngineError),
    #[error("photo index was built with {found}, this service searches {expected}")]
    PartitionMismatch { expected: String, found: String },
    #[error("could not load photo index: {0}")]
    Corpus(#[from] CorpusError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// One uploaded photo.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// One search hit, closest first in a result list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRow {
    pub filename: String,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub spec: ModelSpec,
    pub detector: DetectorBackend,
    pub gate: QualityGate,
    pub max_uploads: usize,
    pub max_upload_bytes: u64,
    pub policy: DedupPolicy,
}

impl QueryConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            spec: settings.model_spec()?,
            detector: settings.detector(),
            gate: settings.query_gate(),
            max_uploads: settings.query.max_uploads,
            max_upload_bytes: settings.query.max_upload_bytes,
            policy: DedupPolicy::default(),
        })
    }
}

/// Where a corpus is (re)loaded from.
#[derive(Debug, Clone)]
pub struct CorpusSource {
    dir: PathBuf,
    partition: Partition,
    loader: CorpusLoader,
}

impl CorpusSource {
    /// `dir` is the partition directory itself.
    pub fn new(dir: PathBuf, partition: Partition, loader: CorpusLoader) -> Self {
        Self {
            dir,
            partition,
            loader,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn load(&self) -> Result<Corpus, CorpusError> {
        self.loader.load(&self.dir, &self.partition)
    }
}

/// Answers photo searches against one corpus.
pub struct QueryService {
    engine: EngineHandle,
    search: SimilaritySearchEngine,
    corpus: Arc<CorpusHandle>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(engine: EngineHandle, corpus: Arc<CorpusHandle>, config: QueryConfig) -> Self {
        let search = SimilaritySearchEngine::new(config.spec.clone()).with_policy(config.policy);
        Self {
            engine,
            search,
            corpus,
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Matches for the faces in `uploads`, closest first.
    ///
    /// Every upload must contain exactly one face that passes the query
    /// quality gate; the first upload that does not fails the whole query.
    pub async fn find(&self, uploads: Vec<Upload>) -> Result<Vec<MatchRow>, QueryError> {
        self.check_uploads(&uploads)?;
        let corpus = self.corpus.snapshot();
        self.check_partition(corpus.partition())?;

        let mut faces = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let name = upload.name;
            let found = self
                .engine
                .detect(upload.bytes, self.config.detector.clone(), self.config.gate)
                .await
                .map_err(|e| match e {
                    EngineError::Decode(_) => QueryError::InvalidImage { name: name.clone() },
                    other => QueryError::Engine(other),
                })?;
            match found.len() {
                0 => return Err(QueryError::NoFace { name }),
                1 => faces.extend(found),
                count => return Err(QueryError::MultipleFaces { name, count }),
            }
        }

        let queries = self
            .engine
            .embed(faces, self.config.spec.clone())
            .await
            .map_err(QueryError::Engine)?;

        let matches = self.search.find(&queries, corpus.embeddings())?;
        tracing::info!(
            queries = queries.len(),
            corpus = corpus.len(),
            matches = matches.len(),
            "query answered"
        );

        Ok(matches
            .into_iter()
            .map(|m| MatchRow {
                filename: m.detection.filename,
                distance: m.distance,
            })
            .collect())
    }

    /// Reload the corpus from `source` and swap it in. Searches already
    /// running keep the corpus they started with.
    pub async fn refresh(&self, source: &CorpusSource) -> Result<usize, QueryError> {
        self.check_partition(source.partition())?;
        let source = source.clone();
        let corpus = tokio::task::spawn_blocking(move || source.load())
            .await
            .map_err(|e| QueryError::Internal(format!("corpus load task failed: {e}")))??;
        let count = corpus.len();
        self.corpus.replace(corpus);
        tracing::info!(embeddings = count, "corpus refreshed");
        Ok(count)
    }

    /// The corpus must come from the detector and model this service runs.
    fn check_partition(&self, partition: &Partition) -> Result<(), QueryError> {
        let expected = Partition::new(self.config.detector.clone(), self.config.spec.name.clone());
        if *partition != expected {
            return Err(QueryError::PartitionMismatch {
                expected: expected.dir_name(),
                found: partition.dir_name(),
            });
        }
        Ok(())
    }

    fn check_uploads(&self, uploads: &[Upload]) -> Result<(), QueryError> {
        if uploads.is_empty() {
            return Err(SearchError::EmptyInput.into());
        }
        if uploads.len() > self.config.max_uploads {
            return Err(QueryError::TooManyUploads {
                count: uploads.len(),
                max: self.config.max_uploads,
            });
        }
        let bytes: u64 = uploads.iter().map(|u| u.bytes.len() as u64).sum();
        if bytes > self.config.max_upload_bytes {
            return Err(QueryError::PayloadTooLarge {
                bytes,
                max: self.config.max_upload_bytes,
            });
        }
        Ok(())
    }
}

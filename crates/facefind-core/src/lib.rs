//! facefind-core — face records, model registry and similarity search.
//!
//! Embeddings are produced by a pluggable [`FaceModel`], filtered by a
//! [`QualityGate`], and matched against a corpus by
//! [`SimilaritySearchEngine`].

pub mod extractor;
pub mod metric;
pub mod model;
pub mod search;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use extractor::{ExtractError, FaceEmbeddingExtractor, QualityGate};
pub use metric::Metric;
pub use model::{DetectorBackend, FaceModel, ModelError, ModelRegistry, ModelSpec};
pub use search::{DedupPolicy, SearchError, SimilaritySearchEngine};
pub use types::{Face, FaceDetection, FaceEmbedding, FacialArea, IdentityKey, RawEmbedding, SimilarFace};

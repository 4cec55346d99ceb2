//! Similarity search of query embeddings against a loaded corpus.

use crate::model::ModelSpec;
use crate::types::{FaceEmbedding, IdentityKey, SimilarFace};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SearchError {
    #[error("no query faces were provided")]
    EmptyInput,
    #[error("the photo corpus is empty")]
    EmptyCorpus,
    #[error("corpus record {filename} was built with model {found}, expected {expected}")]
    ModelMismatch {
        filename: String,
        expected: String,
        found: String,
    },
    #[error("{what} has {found} dimensions, model {model} expects {expected}")]
    DimensionMismatch {
        what: String,
        model: String,
        expected: usize,
        found: usize,
    },
}

/// How to resolve several matches that share one [`IdentityKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Keep the closest match.
    #[default]
    KeepClosest,
    /// Keep whichever match was seen first (query order, then corpus order).
    KeepFirst,
}

impl DedupPolicy {
    /// Merge `candidate` into the match already held for its identity.
    pub fn merge(self, existing: &mut SimilarFace, candidate: SimilarFace) {
        match self {
            DedupPolicy::KeepClosest => {
                if candidate.distance < existing.distance {
                    *existing = candidate;
                }
            }
            DedupPolicy::KeepFirst => {}
        }
    }
}

/// Collapse matches by identity with `policy`, then rank by distance.
pub fn dedup_and_rank(
    matches: impl IntoIterator<Item = SimilarFace>,
    policy: DedupPolicy,
) -> Vec<SimilarFace> {
    let mut by_identity: BTreeMap<IdentityKey, SimilarFace> = BTreeMap::new();
    for m in matches {
        match by_identity.entry(m.identity()) {
            Entry::Vacant(slot) => {
                slot.insert(m);
            }
            Entry::Occupied(mut slot) => policy.merge(slot.get_mut(), m),
        }
    }

    let mut ranked: Vec<SimilarFace> = by_identity.into_values().collect();
    // Stable: equal distances keep identity order.
    ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    ranked
}

/// Threshold-filtered nearest-identity search for one recognition model.
#[derive(Debug, Clone)]
pub struct SimilaritySearchEngine {
    spec: ModelSpec,
    policy: DedupPolicy,
}

impl SimilaritySearchEngine {
    pub fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            policy: DedupPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DedupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Match every query embedding against `corpus`.
    ///
    /// Returns each matching corpus identity once, closest first. Every
    /// corpus record must come from this engine's model and every vector must
    /// have the model's dimension.
    pub fn find(
        &self,
        queries: &[Vec<f32>],
        corpus: &[FaceEmbedding],
    ) -> Result<Vec<SimilarFace>, SearchError> {
        if queries.is_empty() {
            return Err(SearchError::EmptyInput);
        }
        if corpus.is_empty() {
            return Err(SearchError::EmptyCorpus);
        }
        self.check_compatible(queries, corpus)?;

        let threshold = self.spec.threshold;
        let mut matches = Vec::new();
        for query in queries {
            for record in corpus {
                let distance = self.spec.distance(query, &record.embedding);
                if distance <= threshold {
                    matches.push(SimilarFace {
                        detection: record.detection.clone(),
                        threshold,
                        distance,
                    });
                }
            }
        }

        let candidates = matches.len();
        let ranked = dedup_and_rank(matches, self.policy);
        tracing::debug!(
            model = %self.spec.name,
            queries = queries.len(),
            corpus = corpus.len(),
            candidates,
            results = ranked.len(),
            "similarity search finished"
        );
        Ok(ranked)
    }

    fn check_compatible(
        &self,
        queries: &[Vec<f32>],
        corpus: &[FaceEmbedding],
    ) -> Result<(), SearchError> {
        let expected = self.spec.dimension;
        for (i, q) in queries.iter().enumerate() {
            if q.len() != expected {
                return Err(SearchError::DimensionMismatch {
                    what: format!("query face {i}"),
                    model: self.spec.name.clone(),
                    expected,
                    found: q.len(),
                });
            }
        }
        for record in corpus {
            if record.model_name() != self.spec.name {
                return Err(SearchError::ModelMismatch {
                    filename: record.filename().to_string(),
                    expected: self.spec.name.clone(),
                    found: record.model_name().to_string(),
                });
            }
            if record.dimension() != expected {
                return Err(SearchError::DimensionMismatch {
                    what: format!("corpus record {}", record.filename()),
                    model: self.spec.name.clone(),
                    expected,
                    found: record.dimension(),
                });
            }
        }
        Ok(())
    }
}

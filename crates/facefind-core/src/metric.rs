//! Distance metrics between embedding vectors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance function used to compare two embeddings of one model.
///
/// The metric is a property of the recognition model, never of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `1 - cos(a, b)`, in [0, 2].
    Cosine,
    Euclidean,
    /// Euclidean distance between the L2-normalised vectors.
    EuclideanL2,
}

impl Metric {
    /// Distance between `a` and `b`. Never negative.
    ///
    /// Vectors are assumed to have equal length; extra trailing components of
    /// the longer vector are ignored.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        let d = match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::Euclidean => euclidean(a, b),
            Metric::EuclideanL2 => euclidean(&l2_normalize(a), &l2_normalize(b)),
        };
        d.max(0.0)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            "euclidean_l2" => Ok(Metric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Cosine similarity in [-1, 1]. Zero vectors are dissimilar to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

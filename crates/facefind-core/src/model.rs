//! Recognition model registry and the face model capability.
//!
//! A model name fixes the embedding dimension, the distance metric and the
//! match threshold. The neural networks themselves sit behind [`FaceModel`],
//! so callers can plug in an inference backend or a deterministic stub.

use crate::metric::Metric;
use crate::types::{Face, RawEmbedding};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MODEL_NAME: &str = "Facenet";
pub const DEFAULT_DETECTOR_BACKEND: &str = "yolov8";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown recognition model: {0}")]
    UnknownModel(String),
    #[error("detector backend not supported by this model: {0}")]
    UnsupportedDetector(String),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detector backend name (e.g. "retinaface", "yolov8").
///
/// `skip` tells the model that the image already is a face crop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorBackend(String);

impl DetectorBackend {
    pub const SKIP: &'static str = "skip";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn skip() -> Self {
        Self(Self::SKIP.to_string())
    }

    pub fn is_skip(&self) -> bool {
        self.0 == Self::SKIP
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DetectorBackend {
    fn default() -> Self {
        Self::new(DEFAULT_DETECTOR_BACKEND)
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed properties of one recognition model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Embedding length produced by this model.
    pub dimension: usize,
    pub metric: Metric,
    /// Maximum distance at which two faces are the same person.
    pub threshold: f32,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, dimension: usize, metric: Metric, threshold: f32) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
            threshold,
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.distance(a, b)
    }

    /// Check that `v` is a usable embedding for this model.
    pub fn validate_vector(&self, v: &[f32]) -> Result<(), String> {
        if v.len() != self.dimension {
            return Err(format!(
                "expected {}-dim embedding for {}, got {}",
                self.dimension,
                self.name,
                v.len()
            ));
        }
        if let Some(i) = v.iter().position(|x| !x.is_finite()) {
            return Err(format!("non-finite value at index {i}"));
        }
        Ok(())
    }
}

/// Built-in models: (name, dimension, cosine threshold).
const BUILTIN_MODELS: [(&str, usize, f32); 10] = [
    ("VGG-Face", 4096, 0.68),
    ("Facenet", 128, 0.40),
    ("Facenet512", 512, 0.30),
    ("OpenFace", 128, 0.10),
    ("DeepFace", 4096, 0.23),
    ("DeepID", 160, 0.015),
    ("Dlib", 128, 0.07),
    ("ArcFace", 512, 0.68),
    ("SFace", 128, 0.593),
    ("GhostFaceNet", 512, 0.65),
];

/// Lookup table from model name to [`ModelSpec`].
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    specs: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Registry holding only the built-in models.
    pub fn builtin() -> Self {
        let specs = BUILTIN_MODELS
            .iter()
            .map(|&(name, dim, threshold)| {
                (name.to_string(), ModelSpec::new(name, dim, Metric::Cosine, threshold))
            })
            .collect();
        Self { specs }
    }

    /// Add or replace a model spec.
    pub fn register(&mut self, spec: ModelSpec) {
        tracing::debug!(
            model = %spec.name,
            dimension = spec.dimension,
            metric = %spec.metric,
            threshold = spec.threshold,
            "registered model"
        );
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn resolve(&self, name: &str) -> Result<&ModelSpec, ModelError> {
        self.specs
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.specs.values()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Face detection and embedding capability.
///
/// Neither operation treats "no face" as an error: both return an empty list.
/// Implementations may hold non-thread-safe inference sessions, hence
/// `&mut self`; callers that share a model across threads serialise access.
pub trait FaceModel: Send {
    /// Locate faces and return their aligned crops.
    fn detect(&mut self, image: &RgbImage, detector: &DetectorBackend)
        -> Result<Vec<Face>, ModelError>;

    /// Compute one embedding per face found in `image`.
    ///
    /// With [`DetectorBackend::skip`] the whole image is treated as one face.
    fn embed(
        &mut self,
        image: &RgbImage,
        model: &ModelSpec,
        detector: &DetectorBackend,
    ) -> Result<Vec<RawEmbedding>, ModelError>;
}

impl<M: FaceModel + ?Sized> FaceModel for Box<M> {
    fn detect(
        &mut self,
        image: &RgbImage,
        detector: &DetectorBackend,
    ) -> Result<Vec<Face>, ModelError> {
        (**self).detect(image, detector)
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        model: &ModelSpec,
        detector: &DetectorBackend,
    ) -> Result<Vec<RawEmbedding>, ModelError> {
        (**self).embed(image, model, detector)
    }
}

/// Decode an uploaded or stored image into RGB pixels.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ModelError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

//! Embedding extraction with the face quality gate.
//!
//! The same gate runs at ingest time and at query time so that distances on
//! both sides stay comparable.

use crate::model::{DetectorBackend, FaceModel, ModelError, ModelSpec};
use crate::types::{Face, FaceDetection, FaceEmbedding, FacialArea};
use image::RgbImage;
use thiserror::Error;

/// Minimum face side (pixels) for corpus embeddings.
pub const DEFAULT_MIN_FACE_SIZE: f32 = 20.0;
/// Minimum face side (pixels) for faces in user uploads.
pub const DEFAULT_QUERY_MIN_FACE_SIZE: f32 = 100.0;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("malformed embedding for {filename} (face {index}): {reason}")]
    MalformedEmbedding {
        filename: String,
        index: usize,
        reason: String,
    },
}

/// Rejects faces with no detection confidence or a too-small bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_face_size: f32,
}

impl QualityGate {
    pub fn new(min_face_size: f32) -> Self {
        Self { min_face_size }
    }

    /// NaN and non-positive confidences count as "no confidence".
    pub fn accepts(&self, area: &FacialArea, confidence: f32) -> bool {
        confidence > 0.0 && area.width >= self.min_face_size && area.height >= self.min_face_size
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FACE_SIZE)
    }
}

/// Turns images into quality-gated, validated [`FaceEmbedding`]s for one
/// (model, detector) pair.
#[derive(Debug, Clone)]
pub struct FaceEmbeddingExtractor {
    spec: ModelSpec,
    detector: DetectorBackend,
    gate: QualityGate,
}

impl FaceEmbeddingExtractor {
    pub fn new(spec: ModelSpec, detector: DetectorBackend, gate: QualityGate) -> Self {
        Self {
            spec,
            detector,
            gate,
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn detector(&self) -> &DetectorBackend {
        &self.detector
    }

    pub fn gate(&self) -> QualityGate {
        self.gate
    }

    /// Embed every qualifying face in `image`, tagging records with `filename`.
    ///
    /// The model is called exactly once. An image without faces yields an
    /// empty list.
    pub fn extract<M: FaceModel + ?Sized>(
        &self,
        model: &mut M,
        image: &RgbImage,
        filename: &str,
    ) -> Result<Vec<FaceEmbedding>, ExtractError> {
        let raw = model.embed(image, &self.spec, &self.detector)?;
        let found = raw.len();

        let mut out = Vec::with_capacity(found);
        for (index, face) in raw.into_iter().enumerate() {
            if !self.gate.accepts(&face.facial_area, face.face_confidence) {
                continue;
            }
            self.spec
                .validate_vector(&face.embedding)
                .map_err(|reason| ExtractError::MalformedEmbedding {
                    filename: filename.to_string(),
                    index,
                    reason,
                })?;
            out.push(FaceEmbedding {
                detection: FaceDetection {
                    filename: filename.to_string(),
                    model_name: self.spec.name.clone(),
                    facial_area: face.facial_area,
                    face_confidence: face.face_confidence,
                },
                embedding: face.embedding,
            });
        }

        tracing::debug!(
            filename,
            model = %self.spec.name,
            detector = %self.detector,
            found,
            kept = out.len(),
            "extracted embeddings"
        );
        Ok(out)
    }

    /// Detect qualifying faces in a query image.
    pub fn detect_faces<M: FaceModel + ?Sized>(
        &self,
        model: &mut M,
        image: &RgbImage,
    ) -> Result<Vec<Face>, ExtractError> {
        detect_faces(model, image, &self.detector, self.gate)
    }

    /// Embed already-cropped query faces, one vector per face.
    pub fn embed_crops<M: FaceModel + ?Sized>(
        &self,
        model: &mut M,
        faces: &[Face],
    ) -> Result<Vec<Vec<f32>>, ExtractError> {
        embed_crops(model, &self.spec, faces)
    }
}

/// Run the detector and keep only faces that pass `gate`.
pub fn detect_faces<M: FaceModel + ?Sized>(
    model: &mut M,
    image: &RgbImage,
    detector: &DetectorBackend,
    gate: QualityGate,
) -> Result<Vec<Face>, ExtractError> {
    let faces = model.detect(image, detector)?;
    let found = faces.len();
    let kept: Vec<Face> = faces
        .into_iter()
        .filter(|f| gate.accepts(&f.facial_area, f.confidence))
        .collect();
    tracing::debug!(detector = %detector, found, kept = kept.len(), "detected faces");
    Ok(kept)
}

/// Embed face crops with the detector bypassed.
///
/// Each crop must produce at least one vector; the first one is used.
pub fn embed_crops<M: FaceModel + ?Sized>(
    model: &mut M,
    spec: &ModelSpec,
    faces: &[Face],
) -> Result<Vec<Vec<f32>>, ExtractError> {
    let skip = DetectorBackend::skip();
    let mut out = Vec::with_capacity(faces.len());
    for (index, face) in faces.iter().enumerate() {
        let raw = model.embed(&face.crop, spec, &skip)?;
        let first = raw
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::MalformedEmbedding {
                filename: "<query>".to_string(),
                index,
                reason: "model returned no embedding for face crop".to_string(),
            })?;
        spec.validate_vector(&first.embedding)
            .map_err(|reason| ExtractError::MalformedEmbedding {
                filename: "<query>".to_string(),
                index,
                reason,
            })?;
        out.push(first.embedding);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::testing::{StubFace, StubModel};

    fn extractor(min: f32) -> FaceEmbeddingExtractor {
        FaceEmbeddingExtractor::new(
            ModelSpec::new("stub", 3, Metric::Cosine, 0.4),
            DetectorBackend::new("stubdet"),
            QualityGate::new(min),
        )
    }

    fn image() -> RgbImage {
        RgbImage::new(8, 8)
    }

    #[test]
    fn test_extract_keeps_all_qualifying_faces() {
        let mut model = StubModel::new(vec![
            StubFace::new(vec![1.0, 0.0, 0.0], 0.99, 40.0, 40.0),
            StubFace::new(vec![0.0, 1.0, 0.0], 0.80, 20.0, 25.0),
            StubFace::new(vec![0.0, 0.0, 1.0], 0.50, 100.0, 100.0),
        ]);
        let out = extractor(20.0).extract(&mut model, &image(), "a.jpg").unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|e| e.filename() == "a.jpg" && e.model_name() == "stub"));
        assert_eq!(model.embed_calls, 1);
    }

    #[test]
    fn test_extract_drops_low_quality_faces() {
        let mut model = StubModel::new(vec![
            StubFace::new(vec![1.0, 0.0, 0.0], 0.0, 40.0, 40.0),
            StubFace::new(vec![1.0, 0.0, 0.0], f32::NAN, 40.0, 40.0),
            StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 19.0, 40.0),
            StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 40.0, 5.0),
            StubFace::new(vec![0.5, 0.5, 0.0], 0.9, 40.0, 40.0),
        ]);
        let out = extractor(20.0).extract(&mut model, &image(), "b.jpg").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].embedding, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_extract_no_faces_is_empty() {
        let mut model = StubModel::new(vec![]);
        let out = extractor(20.0).extract(&mut model, &image(), "empty.jpg").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_extract_malformed_vector_errors() {
        let mut model = StubModel::new(vec![StubFace::new(vec![1.0, 0.0], 0.9, 40.0, 40.0)]);
        let err = extractor(20.0).extract(&mut model, &image(), "bad.jpg").unwrap_err();
        assert!(matches!(err, ExtractError::MalformedEmbedding { index: 0, .. }));
    }

    #[test]
    fn test_malformed_vector_on_filtered_face_is_ignored() {
        let mut model = StubModel::new(vec![
            StubFace::new(vec![f32::INFINITY], 0.9, 2.0, 2.0),
            StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 40.0, 40.0),
        ]);
        let out = extractor(20.0).extract(&mut model, &image(), "c.jpg").unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_model_failure_propagates() {
        let mut model = StubModel::failing("gpu on fire");
        let err = extractor(20.0).extract(&mut model, &image(), "d.jpg").unwrap_err();
        assert!(matches!(err, ExtractError::Model(ModelError::InferenceFailed(_))));
    }

    #[test]
    fn test_detect_faces_applies_gate() {
        let mut model = StubModel::new(vec![
            StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 150.0, 150.0),
            StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 60.0, 60.0),
        ]);
        let faces = extractor(100.0).detect_faces(&mut model, &image()).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].facial_area.width, 150.0);
    }

    #[test]
    fn test_embed_crops_uses_skip_detector() {
        let mut model = StubModel::new(vec![StubFace::new(vec![0.0, 1.0, 0.0], 0.9, 150.0, 150.0)]);
        let faces = extractor(100.0).detect_faces(&mut model, &image()).unwrap();
        let vectors = extractor(100.0).embed_crops(&mut model, &faces).unwrap();
        assert_eq!(vectors, vec![vec![0.0, 1.0, 0.0]]);
        assert_eq!(model.last_detector.as_deref(), Some(DetectorBackend::SKIP));
    }
}

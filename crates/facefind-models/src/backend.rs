use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::detector::{Detection, ScrfdDetector};
use crate::recognizer::{ArcFaceRecognizer, ARCFACE_EMBEDDING_DIM};
use crate::OnnxError;
use facefind_core::{DetectorBackend, Face, FaceModel, FacialArea, ModelError, ModelSpec, RawEmbedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Detector backend name served by [`OnnxFaceModel`].
pub const SCRFD_BACKEND: &str = "scrfd";
/// Recognition model served by [`OnnxFaceModel`].
pub const ARCFACE_MODEL: &str = "ArcFace";

/// [`FaceModel`] backed by SCRFD + ArcFace ONNX sessions.
pub struct OnnxFaceModel {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

impl OnnxFaceModel {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, OnnxError> {
        let detector = ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = ArcFaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        tracing::info!(dir = %model_dir.display(), "ONNX face models ready");
        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// Check up front that `spec` and `detector` can be served.
    pub fn supports(spec: &ModelSpec, detector: &DetectorBackend) -> Result<(), ModelError> {
        check_model(spec)?;
        if detector.is_skip() {
            Ok(())
        } else {
            check_detector(detector)
        }
    }

    fn faces(&mut self, image: &RgbImage, detector: &DetectorBackend) -> Result<Vec<Face>, ModelError> {
        if detector.is_skip() {
            return Ok(vec![whole_image(image)]);
        }
        check_detector(detector)?;

        let detections = self.detector.detect(image)?;
        Ok(detections
            .iter()
            .map(|d| Face {
                facial_area: facial_area(d),
                confidence: d.confidence,
                crop: face_crop(image, d),
            })
            .collect())
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect(&mut self, image: &RgbImage, detector: &DetectorBackend) -> Result<Vec<Face>, ModelError> {
        self.faces(image, detector)
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        model: &ModelSpec,
        detector: &DetectorBackend,
    ) -> Result<Vec<RawEmbedding>, ModelError> {
        check_model(model)?;
        let faces = self.faces(image, detector)?;

        let mut out = Vec::with_capacity(faces.len());
        for face in faces {
            let embedding = self.recognizer.embed(&face.crop)?;
            out.push(RawEmbedding {
                embedding,
                facial_area: face.facial_area,
                face_confidence: face.confidence,
            });
        }
        Ok(out)
    }
}

fn check_model(spec: &ModelSpec) -> Result<(), ModelError> {
    if spec.name == ARCFACE_MODEL && spec.dimension == ARCFACE_EMBEDDING_DIM {
        Ok(())
    } else {
        Err(ModelError::UnknownModel(format!(
            "{} (the ONNX backend serves {ARCFACE_MODEL})",
            spec.name
        )))
    }
}

fn check_detector(detector: &DetectorBackend) -> Result<(), ModelError> {
    if detector.as_str().eq_ignore_ascii_case(SCRFD_BACKEND) {
        Ok(())
    } else {
        Err(ModelError::UnsupportedDetector(format!(
            "{detector} (available: {SCRFD_BACKEND}, {})",
            DetectorBackend::SKIP
        )))
    }
}

/// The input treated as one already-cropped face.
fn whole_image(image: &RgbImage) -> Face {
    Face {
        facial_area: FacialArea::new(0.0, 0.0, image.width() as f32, image.height() as f32),
        confidence: 1.0,
        crop: image.clone(),
    }
}

fn facial_area(d: &Detection) -> FacialArea {
    let area = FacialArea::new(d.x, d.y, d.width, d.height);
    match d.landmarks {
        Some(lm) => area
            .with_extra("left_eye", serde_json::json!([lm[0].0, lm[0].1]))
            .with_extra("right_eye", serde_json::json!([lm[1].0, lm[1].1])),
        None => area,
    }
}

/// Aligned crop when landmarks are known, else the box resized to 112x112.
fn face_crop(image: &RgbImage, d: &Detection) -> RgbImage {
    if let Some(landmarks) = &d.landmarks {
        return align_face(image, landmarks);
    }
    let x = d.x.max(0.0) as u32;
    let y = d.y.max(0.0) as u32;
    let w = (d.width.round() as u32).clamp(1, image.width().saturating_sub(x).max(1));
    let h = (d.height.round() as u32).clamp(1, image.height().saturating_sub(y).max(1));
    let region = imageops::crop_imm(image, x, y, w, h).to_image();
    imageops::resize(&region, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}

impl From<OnnxError> for ModelError {
    fn from(e: OnnxError) -> Self {
        ModelError::InferenceFailed(e.to_string())
    }
}

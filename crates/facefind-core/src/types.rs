use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Bounding box of a detected face inside its source image.
///
/// Geometry beyond the box (eye positions, landmarks, ...) differs between
/// detector backends and is carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacialArea {
    pub x: f32,
    pub y: f32,
    #[serde(alias = "w")]
    pub width: f32,
    #[serde(alias = "h")]
    pub height: f32,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl FacialArea {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            extra: BTreeMap::new(),
        }
    }

    /// Attach an opaque, detector-specific attribute.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Identity of a detection for matching purposes.
///
/// Every face found in one image under one model shares the same key, so an
/// image showing two people collapses to a single identity when results are
/// deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub filename: String,
    pub model_name: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.filename, self.model_name)
    }
}

/// A face found in a corpus image by a given recognition model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    /// Source image identifier (path relative to the ingested directory).
    pub filename: String,
    pub model_name: String,
    pub facial_area: FacialArea,
    pub face_confidence: f32,
}

impl FaceDetection {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            filename: self.filename.clone(),
            model_name: self.model_name.clone(),
        }
    }
}

/// A detection together with its embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub detection: FaceDetection,
    pub embedding: Vec<f32>,
}

impl FaceEmbedding {
    pub fn filename(&self) -> &str {
        &self.detection.filename
    }

    pub fn model_name(&self) -> &str {
        &self.detection.model_name
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

impl fmt::Display for FaceEmbedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<FaceEmbedding {} ({:.2})>",
            self.detection.identity(),
            self.detection.face_confidence
        )
    }
}

/// A corpus detection that matched a query face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarFace {
    #[serde(flatten)]
    pub detection: FaceDetection,
    /// Maximum distance for this model to count as a match.
    pub threshold: f32,
    pub distance: f32,
}

impl SimilarFace {
    pub fn identity(&self) -> IdentityKey {
        self.detection.identity()
    }
}

/// A face detected in a query image, with its aligned pixel crop.
#[derive(Debug, Clone)]
pub struct Face {
    pub facial_area: FacialArea,
    pub confidence: f32,
    pub crop: image::RgbImage,
}

/// One embedding as returned by a [`FaceModel`](crate::model::FaceModel),
/// before it is tagged with a filename and model name.
#[derive(Debug, Clone)]
pub struct RawEmbedding {
    pub embedding: Vec<f32>,
    pub facial_area: FacialArea,
    pub face_confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(filename: &str, x: f32) -> FaceDetection {
        FaceDetection {
            filename: filename.into(),
            model_name: "Facenet".into(),
            facial_area: FacialArea::new(x, 0.0, 50.0, 50.0),
            face_confidence: 0.9,
        }
    }

    #[test]
    fn test_identity_ignores_bounding_box() {
        let a = detection("group.jpg", 0.0);
        let b = detection("group.jpg", 300.0);
        assert_ne!(a, b);
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_identity_differs_by_model() {
        let a = detection("group.jpg", 0.0);
        let mut b = a.clone();
        b.model_name = "ArcFace".into();
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_facial_area_accepts_short_keys_and_keeps_extras() {
        let raw = r#"{"x": 1, "y": 2, "w": 30, "h": 40, "left_eye": [10, 12]}"#;
        let area: FacialArea = serde_json::from_str(raw).unwrap();
        assert_eq!(area.width, 30.0);
        assert_eq!(area.height, 40.0);
        assert_eq!(area.extra["left_eye"], serde_json::json!([10, 12]));

        let back = serde_json::to_value(&area).unwrap();
        assert_eq!(back["width"], serde_json::json!(30.0));
        assert_eq!(back["left_eye"], serde_json::json!([10, 12]));
    }

    #[test]
    fn test_similar_face_serializes_flat() {
        let sf = SimilarFace {
            detection: detection("p1.jpg", 0.0),
            threshold: 0.4,
            distance: 0.1,
        };
        let v = serde_json::to_value(&sf).unwrap();
        assert_eq!(v["filename"], "p1.jpg");
        assert!((v["distance"].as_f64().unwrap() - 0.1).abs() < 1e-6);
    }
}

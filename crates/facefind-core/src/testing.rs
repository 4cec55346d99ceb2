//! Deterministic [`FaceModel`] stand-in for tests.
//!
//! Faces are scripted per image size, so a test can give every input image
//! its own faces just by choosing distinct dimensions. Crops handed out by
//! `detect` remember which scripted face they came from, and embedding them
//! with the `skip` detector returns that face's vector.

use crate::model::{DetectorBackend, FaceModel, ModelError, ModelSpec};
use crate::types::{Face, FacialArea, RawEmbedding};
use image::{Rgb, RgbImage};
use std::collections::{HashMap, HashSet};

/// One scripted face.
#[derive(Debug, Clone)]
pub struct StubFace {
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub width: f32,
    pub height: f32,
}

impl StubFace {
    pub fn new(embedding: Vec<f32>, confidence: f32, width: f32, height: f32) -> Self {
        Self {
            embedding,
            confidence,
            width,
            height,
        }
    }

    fn area(&self, index: usize) -> FacialArea {
        FacialArea::new(10.0 * index as f32, 5.0, self.width, self.height)
    }
}

#[derive(Debug, Default)]
pub struct StubModel {
    default_faces: Vec<StubFace>,
    by_size: HashMap<(u32, u32), Vec<StubFace>>,
    failing_sizes: HashSet<(u32, u32)>,
    fail_all: Option<String>,
    issued: Vec<Vec<f32>>,
    pub embed_calls: usize,
    pub detect_calls: usize,
    pub last_detector: Option<String>,
}

impl StubModel {
    /// Every image yields `faces`.
    pub fn new(faces: Vec<StubFace>) -> Self {
        Self {
            default_faces: faces,
            ..Self::default()
        }
    }

    /// Every call fails with an inference error.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_all: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Images of exactly `width` x `height` yield `faces` instead of the default.
    pub fn with_image(mut self, width: u32, height: u32, faces: Vec<StubFace>) -> Self {
        self.by_size.insert((width, height), faces);
        self
    }

    /// Images of exactly `width` x `height` make the model fail.
    pub fn failing_on(mut self, width: u32, height: u32) -> Self {
        self.failing_sizes.insert((width, height));
        self
    }

    fn faces_for(&self, image: &RgbImage) -> Result<&[StubFace], ModelError> {
        if let Some(msg) = &self.fail_all {
            return Err(ModelError::InferenceFailed(msg.clone()));
        }
        let size = image.dimensions();
        if self.failing_sizes.contains(&size) {
            return Err(ModelError::InferenceFailed(format!(
                "scripted failure for {}x{}",
                size.0, size.1
            )));
        }
        Ok(self
            .by_size
            .get(&size)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_faces))
    }

    /// Crop whose width encodes an index into `issued`.
    fn issue_crop(&mut self, embedding: Vec<f32>) -> RgbImage {
        self.issued.push(embedding);
        RgbImage::from_pixel(self.issued.len() as u32, 1, Rgb([255, 0, 255]))
    }
}

impl FaceModel for StubModel {
    fn detect(
        &mut self,
        image: &RgbImage,
        detector: &DetectorBackend,
    ) -> Result<Vec<Face>, ModelError> {
        self.detect_calls += 1;
        self.last_detector = Some(detector.to_string());
        let faces = self.faces_for(image)?.to_vec();
        Ok(faces
            .into_iter()
            .enumerate()
            .map(|(i, f)| Face {
                facial_area: f.area(i),
                confidence: f.confidence,
                crop: self.issue_crop(f.embedding.clone()),
            })
            .collect())
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        _model: &ModelSpec,
        detector: &DetectorBackend,
    ) -> Result<Vec<RawEmbedding>, ModelError> {
        self.embed_calls += 1;
        self.last_detector = Some(detector.to_string());

        if detector.is_skip() {
            if let Some(msg) = &self.fail_all {
                return Err(ModelError::InferenceFailed(msg.clone()));
            }
            let (w, h) = image.dimensions();
            let index = w as usize;
            return Ok(match (h, self.issued.get(index.wrapping_sub(1))) {
                (1, Some(v)) => vec![RawEmbedding {
                    embedding: v.clone(),
                    facial_area: FacialArea::new(0.0, 0.0, w as f32, h as f32),
                    face_confidence: 1.0,
                }],
                _ => Vec::new(),
            });
        }

        Ok(self
            .faces_for(image)?
            .iter()
            .enumerate()
            .map(|(i, f)| RawEmbedding {
                embedding: f.embedding.clone(),
                facial_area: f.area(i),
                face_confidence: f.confidence,
            })
            .collect())
    }
}

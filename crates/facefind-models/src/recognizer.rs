//! ArcFace recognizer (w600k_r50) via ONNX Runtime.

use crate::alignment::ALIGNED_SIZE;
use crate::OnnxError;
use facefind_core::metric::l2_normalize;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_MEAN: f32 = 127.5;
// Symmetric normalisation, unlike SCRFD.
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.is_file() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );
        Ok(Self { session })
    }

    /// L2-normalised embedding of an aligned face crop. Crops of another
    /// size are resized to 112x112 first.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, OnnxError> {
        let input = preprocess(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(OnnxError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(l2_normalize(raw))
    }
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let resized;
    let face = if face.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
        face
    } else {
        resized = imageops::resize(face, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle);
        &resized
    };

    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_channels() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 127, 0]));
        let t = preprocess(&face);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] - (127.0 - 127.5) / 127.5).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_resizes_crop() {
        let face = RgbImage::from_pixel(40, 60, Rgb([128, 128, 128]));
        let t = preprocess(&face);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!(t.iter().all(|v| (v - 0.5 / 127.5).abs() < 0.01));
    }
}

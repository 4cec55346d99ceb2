//! facefind-models — ONNX Runtime implementation of `FaceModel`.
//!
//! SCRFD finds faces and five landmarks, faces are aligned to the ArcFace
//! template, and ArcFace produces 512-dimensional embeddings.

pub mod alignment;
pub mod backend;
pub mod detector;
pub mod recognizer;

use std::path::PathBuf;
use thiserror::Error;

pub use backend::{OnnxFaceModel, ARCFACE_MODEL, SCRFD_BACKEND};

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {} (download from insightface)", .0.display())]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

use facefind_core::extractor::{detect_faces, embed_crops};
use facefind_core::model::decode_image;
use facefind_core::{DetectorBackend, ExtractError, Face, FaceModel, ModelError, ModelSpec, QualityGate};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const ENGINE_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not read image: {0}")]
    Decode(ModelError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Detect {
        image: Vec<u8>,
        detector: DetectorBackend,
        gate: QualityGate,
        reply: oneshot::Sender<Result<Vec<Face>, EngineError>>,
    },
    Embed {
        faces: Vec<Face>,
        spec: ModelSpec,
        reply: oneshot::Sender<Result<Vec<Vec<f32>>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `image` and return the faces that pass `gate`.
    pub async fn detect(
        &self,
        image: Vec<u8>,
        detector: DetectorBackend,
        gate: QualityGate,
    ) -> Result<Vec<Face>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                image,
                detector,
                gate,
                reply,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// One embedding per face crop.
    pub async fn embed(&self, faces: Vec<Face>, spec: ModelSpec) -> Result<Vec<Vec<f32>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { faces, spec, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Move `model` onto a dedicated OS thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_engine(mut model: Box<dyn FaceModel>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facefind-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect {
                        image,
                        detector,
                        gate,
                        reply,
                    } => {
                        let result = run_detect(model.as_mut(), &image, &detector, gate);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { faces, spec, reply } => {
                        let result = embed_crops(model.as_mut(), &spec, &faces).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_detect(
    model: &mut dyn FaceModel,
    bytes: &[u8],
    detector: &DetectorBackend,
    gate: QualityGate,
) -> Result<Vec<Face>, EngineError> {
    let image = decode_image(bytes).map_err(EngineError::Decode)?;
    let faces = detect_faces(model, &image, detector, gate)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        faces = faces.len(),
        "query image scanned"
    );
    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facefind_core::testing::{StubFace, StubModel};
    use facefind_core::Metric;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_detect_then_embed() {
        let model = StubModel::new(vec![
            StubFace::new(vec![1.0, 0.0], 0.9, 150.0, 150.0),
            StubFace::new(vec![0.0, 1.0], 0.9, 40.0, 40.0),
        ]);
        let engine = spawn_engine(Box::new(model)).unwrap();

        let faces = engine
            .detect(png(20, 20), DetectorBackend::new("yolov8"), QualityGate::new(100.0))
            .await
            .unwrap();
        assert_eq!(faces.len(), 1);

        let spec = ModelSpec::new("Facenet", 2, Metric::Cosine, 0.4);
        let vectors = engine.embed(faces, spec).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_undecodable_upload() {
        let engine = spawn_engine(Box::new(StubModel::new(vec![]))).unwrap();
        let err = engine
            .detect(b"not an image".to_vec(), DetectorBackend::default(), QualityGate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_model_failure_is_reported() {
        let engine = spawn_engine(Box::new(StubModel::failing("gpu on fire"))).unwrap();
        let err = engine
            .detect(png(8, 8), DetectorBackend::default(), QualityGate::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gpu on fire"));
    }
}

//! The two per-file jobs the pipeline runs: embedding extraction and
//! resizing originals for display.

use crate::pipeline::ItemProcessor;
use crate::report::ItemError;
use facefind_core::{FaceEmbeddingExtractor, FaceModel};
use facefind_store::fsutil::{slash_path, write_atomic};
use facefind_store::EmbeddingStore;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_MAX_WIDTH: u32 = 1200;
pub const DEFAULT_MAX_HEIGHT: u32 = 900;

/// Detects, embeds and persists the faces of one image.
///
/// The model sits behind a mutex so concurrent workers decode images in
/// parallel but run inference one at a time.
pub struct EmbeddingProcessor<M> {
    model: Mutex<M>,
    extractor: FaceEmbeddingExtractor,
    store: EmbeddingStore,
}

impl<M: FaceModel> EmbeddingProcessor<M> {
    pub fn new(model: M, extractor: FaceEmbeddingExtractor, store: EmbeddingStore) -> Self {
        Self {
            model: Mutex::new(model),
            extractor,
            store,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn into_model(self) -> M {
        self.model.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<M: FaceModel> ItemProcessor for EmbeddingProcessor<M> {
    fn name(&self) -> &str {
        "embeddings"
    }

    fn output_path(&self, relative: &Path) -> PathBuf {
        self.store.path_for(relative)
    }

    fn process(&self, source: &Path, relative: &Path, output: &Path) -> Result<usize, ItemError> {
        let image = image::open(source)?.to_rgb8();
        let filename = slash_path(relative);

        let records = {
            let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());
            self.extractor.extract(&mut *model, &image, &filename)?
        };

        self.store.write(output, &records)?;
        Ok(records.len())
    }
}

/// Shrinks images to fit a bounding box, keeping aspect ratio and format.
/// Images already inside the box are re-encoded unchanged.
pub struct ResizeProcessor {
    dst_dir: PathBuf,
    max_width: u32,
    max_height: u32,
}

impl ResizeProcessor {
    pub fn new(dst_dir: impl Into<PathBuf>) -> Self {
        Self {
            dst_dir: dst_dir.into(),
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
        }
    }

    pub fn with_bounds(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }
}

impl ItemProcessor for ResizeProcessor {
    fn name(&self) -> &str {
        "resize"
    }

    fn output_path(&self, relative: &Path) -> PathBuf {
        self.dst_dir.join(relative)
    }

    fn process(&self, source: &Path, _relative: &Path, output: &Path) -> Result<usize, ItemError> {
        let img = image::open(source)?;
        let img = if img.width() > self.max_width || img.height() > self.max_height {
            img.resize(self.max_width, self.max_height, FilterType::Lanczos3)
        } else {
            img
        };

        let format = ImageFormat::from_path(output)?;
        let img = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => img,
        };
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format)?;
        write_atomic(output, &bytes).map_err(|e| ItemError::io(output, e))?;

        tracing::debug!(
            output = %output.display(),
            width = img.width(),
            height = img.height(),
            "image resized"
        );
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BatchIngestionPipeline, PipelineConfig};
    use crate::progress::{CancellationToken, NoopObserver};
    use facefind_core::testing::{StubFace, StubModel};
    use facefind_core::{DetectorBackend, ModelSpec, Metric, QualityGate};
    use facefind_store::Partition;
    use image::RgbImage;
    use std::fs;

    fn spec() -> ModelSpec {
        ModelSpec::new("Facenet", 3, Metric::Cosine, 0.4)
    }

    fn processor(model: StubModel, dst: &Path) -> EmbeddingProcessor<StubModel> {
        let detector = DetectorBackend::new("yolov8");
        let store = EmbeddingStore::new(
            dst,
            Partition::new(detector.clone(), "Facenet"),
            facefind_store::DEFAULT_EMBEDDING_EXT,
        );
        let extractor = FaceEmbeddingExtractor::new(spec(), detector, QualityGate::new(20.0));
        EmbeddingProcessor::new(model, extractor, store)
    }

    fn save_image(path: &Path, width: u32, height: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::new(width, height).save(path).unwrap();
    }

    fn run(p: &EmbeddingProcessor<StubModel>, src: &Path) -> crate::RunReport {
        BatchIngestionPipeline::new(PipelineConfig::default())
            .unwrap()
            .run(src, p, &NoopObserver, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_embeddings_written_per_image() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        save_image(&src.path().join("group.png"), 64, 48);
        save_image(&src.path().join("day2/solo.png"), 40, 40);

        let model = StubModel::new(vec![StubFace::new(vec![0.0, 1.0, 0.0], 0.9, 30.0, 30.0)])
            .with_image(
                64,
                48,
                vec![
                    StubFace::new(vec![1.0, 0.0, 0.0], 0.99, 50.0, 60.0),
                    StubFace::new(vec![0.0, 0.0, 1.0], 0.95, 25.0, 30.0),
                    StubFace::new(vec![0.5, 0.5, 0.0], 0.9, 10.0, 10.0),
                ],
            );
        let p = processor(model, dst.path());
        let report = run(&p, src.path());

        assert_eq!(report.processed, 2);
        assert_eq!(report.faces_written, 3);

        let group = p.store().read(&p.store().path_for(Path::new("group.png"))).unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|r| r.filename() == "group.png"));

        let solo = p
            .store()
            .read(&p.store().path_for(Path::new("day2/solo.png")))
            .unwrap();
        assert_eq!(solo[0].filename(), "day2/solo.png");
        assert_eq!(solo[0].embedding, vec![0.0, 1.0, 0.0]);

        assert_eq!(p.into_model().embed_calls, 2);
    }

    #[test]
    fn test_no_faces_writes_marker() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        save_image(&src.path().join("landscape.png"), 32, 32);
        let p = processor(StubModel::new(vec![]), dst.path());

        let report = run(&p, src.path());
        assert_eq!(report.processed, 1);
        assert_eq!(report.faces_written, 0);

        let marker = p.store().path_for(Path::new("landscape.png"));
        assert!(marker.is_file());
        assert!(p.store().read(&marker).unwrap().is_empty());

        let again = run(&p, src.path());
        assert_eq!(again.skipped, 1);
        assert_eq!(p.into_model().embed_calls, 1);
    }

    #[test]
    fn test_idempotent_rerun_leaves_files_untouched() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        for i in 0..4 {
            save_image(&src.path().join(format!("img{i}.png")), 30 + i, 30);
        }
        let p = processor(
            StubModel::new(vec![StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 30.0, 30.0)]),
            dst.path(),
        );
        run(&p, src.path());
        let before = fs::read(p.store().path_for(Path::new("img2.png"))).unwrap();

        let second = run(&p, src.path());
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 4);
        assert_eq!(
            fs::read(p.store().path_for(Path::new("img2.png"))).unwrap(),
            before
        );
    }

    #[test]
    fn test_model_failure_is_item_error() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        save_image(&src.path().join("ok.png"), 30, 30);
        save_image(&src.path().join("fails.png"), 31, 31);
        fs::write(src.path().join("broken.jpg"), b"not a jpeg").unwrap();

        let model = StubModel::new(vec![StubFace::new(vec![1.0, 0.0, 0.0], 0.9, 30.0, 30.0)])
            .failing_on(31, 31);
        let p = processor(model, dst.path());
        let report = run(&p, src.path());

        assert_eq!(report.processed, 1);
        assert_eq!(report.errored, 2);
        assert!(!p.store().contains(Path::new("fails.png")));
        assert!(!p.store().contains(Path::new("broken.jpg")));
    }

    #[test]
    fn test_malformed_vector_is_item_error() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        save_image(&src.path().join("a.png"), 30, 30);
        let p = processor(
            StubModel::new(vec![StubFace::new(vec![1.0, 0.0], 0.9, 30.0, 30.0)]),
            dst.path(),
        );
        let report = run(&p, src.path());
        assert_eq!(report.errored, 1);
        assert!(report.failures[0].message.contains("malformed"));
    }

    #[test]
    fn test_resize_fits_box_and_never_upscales() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        save_image(&src.path().join("big.png"), 2400, 1200);
        save_image(&src.path().join("tall.jpg"), 300, 1800);
        save_image(&src.path().join("small.png"), 200, 100);

        let report = BatchIngestionPipeline::new(PipelineConfig::default())
            .unwrap()
            .run(
                src.path(),
                &ResizeProcessor::new(dst.path()),
                &NoopObserver,
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(report.processed, 3);

        let dims = |name: &str| image::image_dimensions(dst.path().join(name)).unwrap();
        assert_eq!(dims("big.png"), (1200, 600));
        assert_eq!(dims("tall.jpg"), (150, 900));
        assert_eq!(dims("small.png"), (200, 100));
    }
}

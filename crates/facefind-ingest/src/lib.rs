//! facefind-ingest — offline batch processing of photo directories.

pub mod pipeline;
pub mod processors;
pub mod progress;
pub mod report;

pub use pipeline::{BatchIngestionPipeline, IngestError, ItemProcessor, PipelineConfig};
pub use processors::{EmbeddingProcessor, ResizeProcessor};
pub use progress::{CancellationToken, LogObserver, NoopObserver, ProgressObserver};
pub use report::{ItemError, ItemFailure, ItemOutcome, ItemResult, RunReport};

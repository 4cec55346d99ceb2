//! Batch runner over a source directory.
//!
//! The runner enumerates files, resolves each one to an output path, skips
//! cache hits and hands the rest to an [`ItemProcessor`] on a small pool of
//! scoped worker threads. Failures are collected per item.

use crate::progress::{CancellationToken, ProgressObserver};
use crate::report::{ItemError, ItemOutcome, ItemResult, RunReport};
use facefind_store::fsutil::{default_image_extensions, extension_allowed};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("run cancelled after {} items processed", .0.processed)]
    Cancelled(Box<RunReport>),

    #[error("{}: {source}", .path.display())]
    ItemFailed {
        path: PathBuf,
        #[source]
        source: ItemError,
    },
}

/// Per-file work performed by the pipeline.
pub trait ItemProcessor: Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Deterministic destination of the source at `relative`.
    fn output_path(&self, relative: &Path) -> PathBuf;

    /// Produce `output` from `source`; returns the number of records written.
    fn process(&self, source: &Path, relative: &Path, output: &Path) -> Result<usize, ItemError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lowercase extensions with leading dot; empty means every file.
    pub allowed_extensions: BTreeSet<String>,
    pub skip_existing: bool,
    pub raise_errors: bool,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_image_extensions(),
            skip_existing: true,
            raise_errors: false,
            workers: 1,
        }
    }
}

struct WorkItem {
    source: PathBuf,
    relative: PathBuf,
    output: PathBuf,
    claimed_by: Option<PathBuf>,
}

pub struct BatchIngestionPipeline {
    config: PipelineConfig,
}

impl BatchIngestionPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, IngestError> {
        if config.workers == 0 {
            return Err(IngestError::Configuration(
                "workers must be at least 1".into(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every eligible file under `source_dir`.
    ///
    /// Returns the report even when items failed, unless `raise_errors` is
    /// set. Cancellation always ends the run with [`IngestError::Cancelled`].
    pub fn run<P: ItemProcessor + ?Sized>(
        &self,
        source_dir: &Path,
        processor: &P,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<RunReport, IngestError> {
        if !source_dir.is_dir() {
            return Err(IngestError::Configuration(format!(
                "source directory {} does not exist or is not a directory",
                source_dir.display()
            )));
        }

        let mut report = RunReport::start();
        let items = self.enumerate(source_dir, processor, &mut report)?;
        tracing::info!(
            processor = processor.name(),
            src = %source_dir.display(),
            eligible = items.len(),
            filtered = report.skipped_by_extension,
            workers = self.config.workers,
            "starting run"
        );
        observer.on_start(items.len());

        let failure = self.dispatch(&items, processor, observer, cancel, &mut report);
        report.finish();

        if cancel.is_cancelled() {
            tracing::warn!(processed = report.processed, "run cancelled");
            return Err(IngestError::Cancelled(Box::new(report)));
        }
        if let Some((path, source)) = failure {
            return Err(IngestError::ItemFailed { path, source });
        }

        observer.on_finish(&report);
        Ok(report)
    }

    /// Sorted list of eligible files. Later files whose output path was
    /// already claimed are marked so they fail instead of overwriting,
    /// unless that output already exists and will be skipped anyway.
    fn enumerate<P: ItemProcessor + ?Sized>(
        &self,
        source_dir: &Path,
        processor: &P,
        report: &mut RunReport,
    ) -> Result<Vec<WorkItem>, IngestError> {
        let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut items = Vec::new();

        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.record_walk_error(source_dir, e, report)?;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let source = entry.into_path();
            if !extension_allowed(&source, &self.config.allowed_extensions) {
                tracing::debug!(path = %source.display(), "skipping by extension");
                report.record_filtered();
                continue;
            }

            let relative = source
                .strip_prefix(source_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| source.clone());
            let output = processor.output_path(&relative);
            let claimed_by = match claimed.get(&output) {
                Some(_) if self.config.skip_existing && output.is_file() => {
                    tracing::debug!(path = %relative.display(), "conflicting output already exists");
                    None
                }
                Some(first) => Some(first.clone()),
                None => {
                    claimed.insert(output.clone(), relative.clone());
                    None
                }
            };
            items.push(WorkItem {
                source,
                relative,
                output,
                claimed_by,
            });
        }
        Ok(items)
    }

    /// An unreadable directory entry is one failed item; the walk goes on.
    fn record_walk_error(
        &self,
        source_dir: &Path,
        err: walkdir::Error,
        report: &mut RunReport,
    ) -> Result<(), IngestError> {
        let relative = err
            .path()
            .map(|p| p.strip_prefix(source_dir).unwrap_or(p).to_path_buf())
            .unwrap_or_default();
        tracing::warn!(path = %relative.display(), error = %err, "cannot read directory entry");
        let error = ItemError::from(err);
        if self.config.raise_errors {
            return Err(IngestError::ItemFailed {
                path: relative,
                source: error,
            });
        }
        report.record(&relative, &Err(error));
        Ok(())
    }

    fn dispatch<P: ItemProcessor + ?Sized>(
        &self,
        items: &[WorkItem],
        processor: &P,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Option<(PathBuf, ItemError)> {
        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let workers = self.config.workers.min(items.len().max(1));
        let (tx, rx) = mpsc::channel::<(usize, ItemResult)>();
        let mut failure = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let (next, stop) = (&next, &stop);
                scope.spawn(move || loop {
                    if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(index) else {
                        break;
                    };
                    let result = self.process_item(item, processor);
                    if result.is_err() && self.config.raise_errors {
                        stop.store(true, Ordering::SeqCst);
                    }
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (index, result) in rx {
                let item = &items[index];
                report.record(&item.relative, &result);
                observer.on_item(&item.relative, &result);

                if let Err(e) = result {
                    tracing::warn!(path = %item.relative.display(), error = %e, "item failed");
                    if self.config.raise_errors && failure.is_none() {
                        failure = Some((item.relative.clone(), e));
                    }
                }
            }
        });

        failure
    }

    fn process_item<P: ItemProcessor + ?Sized>(&self, item: &WorkItem, processor: &P) -> ItemResult {
        if let Some(first) = &item.claimed_by {
            return Err(ItemError::DestinationConflict {
                output: item.output.clone(),
                claimed_by: first.clone(),
            });
        }
        if self.config.skip_existing && item.output.is_file() {
            return Ok(ItemOutcome::Skipped);
        }
        let count = processor.process(&item.source, &item.relative, &item.output)?;
        tracing::debug!(
            path = %item.relative.display(),
            output = %item.output.display(),
            count,
            "item processed"
        );
        Ok(ItemOutcome::Processed { count })
    }
}

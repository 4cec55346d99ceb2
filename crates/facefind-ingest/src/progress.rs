use crate::report::{ItemResult, RunReport};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a run and its caller.
///
/// Workers check it before starting each item; an item already in flight
/// finishes (its write is atomic) and the run then stops.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress events. All callbacks run on the thread that called
/// `run`, in completion order.
pub trait ProgressObserver {
    fn on_start(&self, _eligible: usize) {}
    fn on_item(&self, _relative: &Path, _result: &ItemResult) {}
    fn on_finish(&self, _report: &RunReport) {}
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Logs each item through `tracing`.
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_start(&self, eligible: usize) {
        tracing::info!(eligible, "ingestion started");
    }

    fn on_item(&self, relative: &Path, result: &ItemResult) {
        match result {
            Ok(outcome) => {
                tracing::debug!(path = %relative.display(), result = outcome.as_count(), "item done")
            }
            Err(e) => tracing::warn!(path = %relative.display(), error = %e, "item failed"),
        }
    }

    fn on_finish(&self, report: &RunReport) {
        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            errored = report.errored,
            skipped_by_extension = report.skipped_by_extension,
            faces = report.faces_written,
            "ingestion finished"
        );
    }
}

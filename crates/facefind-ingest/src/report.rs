//! Per-item outcomes and the aggregated run report.

use chrono::{DateTime, Utc};
use facefind_core::ExtractError;
use facefind_store::StoreError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a single item could not be processed. Never aborts a run on its own.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot list directory entry: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("destination {} is already produced by {}", .output.display(), .claimed_by.display())]
    DestinationConflict { output: PathBuf, claimed_by: PathBuf },
}

impl ItemError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What happened to an item that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Processor ran; `count` records were written (zero is a valid marker).
    Processed { count: usize },
    /// Output already existed and was left untouched.
    Skipped,
}

impl ItemOutcome {
    /// Integer form used in progress output: the record count, or `-1`
    /// for a cache hit.
    pub fn as_count(self) -> i64 {
        match self {
            Self::Processed { count } => count as i64,
            Self::Skipped => -1,
        }
    }
}

pub type ItemResult = Result<ItemOutcome, ItemError>;

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Counters for one pipeline run.
///
/// `total_seen` counts every file found under the source directory, so it
/// always equals `processed + skipped + errored + skipped_by_extension`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub processed: usize,
    pub skipped: usize,
    pub skipped_by_extension: usize,
    pub errored: usize,
    pub total_seen: usize,
    pub faces_written: usize,
    pub failures: Vec<ItemFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            processed: 0,
            skipped: 0,
            skipped_by_extension: 0,
            errored: 0,
            total_seen: 0,
            faces_written: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn record_filtered(&mut self) {
        self.total_seen += 1;
        self.skipped_by_extension += 1;
    }

    pub fn record(&mut self, relative: &Path, result: &ItemResult) {
        self.total_seen += 1;
        match result {
            Ok(ItemOutcome::Processed { count }) => {
                self.processed += 1;
                self.faces_written += count;
            }
            Ok(ItemOutcome::Skipped) => self.skipped += 1,
            Err(e) => {
                self.errored += 1;
                self.failures.push(ItemFailure {
                    path: relative.to_path_buf(),
                    message: e.to_string(),
                });
            }
        }
    }

    pub(crate) fn finish(&mut self) {
        self.failures.sort_by(|a, b| a.path.cmp(&b.path));
        self.finished_at = Utc::now();
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} skipped, {} errored, {} filtered by extension ({} files, {} faces) in {:.1}s",
            self.processed,
            self.skipped,
            self.errored,
            self.skipped_by_extension,
            self.total_seen,
            self.faces_written,
            self.elapsed().num_milliseconds() as f64 / 1000.0,
        )
    }
}

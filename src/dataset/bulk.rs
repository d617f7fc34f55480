//! Bulk dataset downloader
//!
//! Turns a validated job source into worker pool submissions, reports progress
//! after every finished job and writes the `_errors` report for whatever failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::dataset::fetcher::{DownloadJob, Fetcher, Transport, DEFAULT_TIMEOUT_SECS};
use crate::dataset::pool::{PoolError, WorkerPool};
use crate::dataset::report::{write_error_report, FailedJob, ReportError};
use crate::dataset::resolver::FilenameResolver;
use crate::dataset::source::{JobSource, SourceError};

/// Error types for bulk downloads
#[derive(Error, Debug)]
pub enum BulkError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Cannot create destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Workers stopped after {processed} of {total} jobs")]
    Interrupted { processed: usize, total: usize },

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

/// Result type for bulk downloads
pub type BulkResult<T> = Result<T, BulkError>;

/// Consolidated outcome of one run
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub total: usize,
    pub succeeded: usize,
    /// Failed jobs, sorted by index
    pub failures: Vec<FailedJob>,
    /// Where the failures were written, when there were any
    pub error_report: Option<PathBuf>,
}

impl DownloadReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Downloads every row of a job source through a worker pool
pub struct BulkDownloader {
    transport: Arc<dyn Transport>,
    resolver: Arc<FilenameResolver>,
    workers: usize,
    timeout: Duration,
}

impl BulkDownloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            resolver: Arc::new(FilenameResolver::new()),
            workers: 0,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Worker count; 0 means one per CPU
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Download every job in `source` under `destination`.
    ///
    /// `progress(processed, total)` is called after each finished job. Failures are
    /// written to the source's `_errors` sidecar even if the run is interrupted.
    pub async fn download<F>(&self, source: &JobSource, destination: &Path, progress: F) -> BulkResult<DownloadReport>
    where
        F: FnMut(usize, usize),
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("bulk_download", %run_id, source = %source.path().display());
        self.run(source, destination, progress).instrument(span).await
    }

    async fn run<F>(&self, source: &JobSource, destination: &Path, mut progress: F) -> BulkResult<DownloadReport>
    where
        F: FnMut(usize, usize),
    {
        let jobs = source.jobs();
        let total = jobs.len();
        if total == 0 {
            return Err(SourceError::Empty(source.path().to_path_buf()).into());
        }

        std::fs::create_dir_all(destination).map_err(|e| BulkError::Destination {
            path: destination.to_path_buf(),
            source: e,
        })?;

        let fetcher = Fetcher::new(self.transport.clone(), self.resolver.clone(), destination).with_timeout(self.timeout);
        let mut pool = WorkerPool::start(Arc::new(fetcher), self.workers)?;

        info!("Downloading {} items into {}", total, destination.display());

        let mut tally = Tally::default();
        let drained = drain(&pool, jobs, &mut progress, &mut tally).await;

        info!("Cleaning up...");
        pool.shutdown().await;

        finish(source, total, tally, drained)
    }
}

/// Outcomes collected so far
#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failures: Vec<FailedJob>,
}

/// Write the `_errors` report for whatever failed, then surface an interruption if there was one
fn finish(source: &JobSource, total: usize, mut tally: Tally, drained: BulkResult<()>) -> BulkResult<DownloadReport> {
    tally.failures.sort_by_key(|f| f.index);
    let error_report = if tally.failures.is_empty() {
        None
    } else {
        let path = source.sidecar_path("_errors");
        write_error_report(&path, &tally.failures, source.has_labels())?;
        Some(path)
    };

    if let Err(e) = drained {
        error!("Bulk download interrupted: {}", e);
        return Err(e);
    }

    info!("Done! {} succeeded, {} failed", tally.succeeded, tally.failures.len());
    Ok(DownloadReport {
        total,
        succeeded: tally.succeeded,
        failures: tally.failures,
        error_report,
    })
}

async fn drain<F>(
    pool: &WorkerPool,
    jobs: Vec<DownloadJob>,
    progress: &mut F,
    tally: &mut Tally,
) -> BulkResult<()>
where
    F: FnMut(usize, usize),
{
    let total = jobs.len();
    for job in jobs {
        pool.submit(job)?;
    }

    let mut processed = 0;
    while processed < total {
        let Some(job) = pool.next_result().await else {
            return Err(BulkError::Interrupted { processed, total });
        };

        if job.is_success() {
            tally.succeeded += 1;
        } else {
            tally.failures.push(FailedJob::from(&job));
        }

        processed += 1;
        progress(processed, total);
    }

    Ok(())
}

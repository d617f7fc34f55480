//! Delimited report files written alongside a run
//!
//! - The error report lists failed jobs (`index,url[,label]`), sorted by index.
//! - The metadata sidecar is appended to row by row from concurrent tasks, under its own lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::dataset::fetcher::DownloadJob;

/// Error types for report writing
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row has {got} fields, header has {expected}")]
    RowWidth { expected: usize, got: usize },
}

/// Result type for report operations
pub type ReportResult<T> = Result<T, ReportError>;

/// A failed job as it appears in the error report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub index: usize,
    pub url: String,
    pub label: Option<String>,
}

impl From<&DownloadJob> for FailedJob {
    fn from(job: &DownloadJob) -> Self {
        Self {
            index: job.index,
            url: job.url.clone(),
            label: job.label.clone(),
        }
    }
}

/// Write the error report. Rows are sorted by index regardless of input order.
pub fn write_error_report(path: &Path, failures: &[FailedJob], include_label: bool) -> ReportResult<()> {
    let mut sorted: Vec<&FailedJob> = failures.iter().collect();
    sorted.sort_by_key(|f| f.index);

    let mut writer = csv::Writer::from_path(path)?;
    if include_label {
        writer.write_record(["index", "url", "label"])?;
    } else {
        writer.write_record(["index", "url"])?;
    }

    for failure in sorted {
        let index = failure.index.to_string();
        if include_label {
            writer.write_record([index.as_str(), failure.url.as_str(), failure.label.as_deref().unwrap_or("")])?;
        } else {
            writer.write_record([index.as_str(), failure.url.as_str()])?;
        }
    }
    writer.flush()?;

    info!("Wrote {} failures to {}", failures.len(), path.display());
    Ok(())
}

/// Read an error report back as `(index, url, label)` rows
pub fn read_error_report(path: &Path) -> ReportResult<Vec<FailedJob>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut failures = Vec::new();

    for record in reader.records() {
        let record = record?;
        let index = record
            .get(0)
            .and_then(|i| i.parse().ok())
            .unwrap_or_default();
        failures.push(FailedJob {
            index,
            url: record.get(1).unwrap_or_default().to_string(),
            label: record.get(2).filter(|l| !l.is_empty()).map(str::to_string),
        });
    }

    Ok(failures)
}

/// Append-only CSV written by many tasks.
///
/// The header is written once, and only when the file did not exist before the first append.
#[derive(Debug)]
pub struct SidecarWriter {
    path: PathBuf,
    header: Vec<String>,
    lock: Mutex<()>,
}

impl SidecarWriter {
    pub fn new(path: impl Into<PathBuf>, header: &[&str]) -> Self {
        Self {
            path: path.into(),
            header: header.iter().map(|h| h.to_string()).collect(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row
    pub fn append(&self, row: &[String]) -> ReportResult<()> {
        if row.len() != self.header.len() {
            return Err(ReportError::RowWidth {
                expected: self.header.len(),
                got: row.len(),
            });
        }

        let _guard = self.lock.lock();

        let make_header = !self.path.is_file();
        let file: File = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);
        if make_header {
            debug!("Creating sidecar {}", self.path.display());
            writer.write_record(&self.header)?;
        }
        writer.write_record(row)?;
        writer.flush()?;

        Ok(())
    }
}

//! Single-item fetcher
//!
//! This module provides functionality for:
//! 1. An HTTP transport seam (`Transport`) with a reqwest implementation
//! 2. The `DownloadJob` record passed between the orchestrators and the worker pool
//! 3. Downloading one job into its label directory without leaving partial files behind

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::dataset::resolver::{filename_from_url, FilenameResolver, ResolverError};

/// Fixed timeout for a single GET, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error types for fetching
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("Fetch panicked: {0}")]
    Panicked(String),
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Something that can perform a GET and hand back the full body.
///
/// Non-success statuses must be reported as errors, not as bodies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> FetchResult<Vec<u8>>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport with the given per-request timeout and user agent
    pub fn new(timeout_secs: u64, user_agent: &str) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> FetchResult<Vec<u8>> {
        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Terminal state of a job. Set once, by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Success(PathBuf),
    Failed(String),
}

/// One requested download
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// 1-based ordinal assigned at submission time, used for report ordering
    pub index: usize,
    pub url: String,
    /// Subdirectory under the destination root
    pub label: Option<String>,
    pub outcome: JobOutcome,
}

impl DownloadJob {
    pub fn new(index: usize, url: impl Into<String>, label: Option<String>) -> Self {
        Self {
            index,
            url: url.into(),
            label,
            outcome: JobOutcome::Pending,
        }
    }

    /// Record the outcome. Later calls are ignored.
    pub fn complete(&mut self, outcome: JobOutcome) {
        if self.outcome == JobOutcome::Pending {
            self.outcome = outcome;
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, JobOutcome::Failed(_))
    }

    /// Path of the downloaded file, if the job succeeded
    pub fn path(&self) -> Option<&Path> {
        match &self.outcome {
            JobOutcome::Success(path) => Some(path),
            _ => None,
        }
    }
}

/// Downloads one job's URL into the destination tree
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    resolver: Arc<FilenameResolver>,
    root: PathBuf,
    timeout: Duration,
}

impl Fetcher {
    /// Create a fetcher writing under `root`
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<FilenameResolver>, root: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            resolver,
            root: root.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The destination root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a job's file lands in
    pub fn target_dir(&self, job: &DownloadJob) -> PathBuf {
        match &job.label {
            Some(label) => self.root.join(sanitize_label(label)),
            None => self.root.clone(),
        }
    }

    /// Fetch a job. Every failure, panics included, is folded into `JobOutcome::Failed`.
    #[instrument(skip(self, job), fields(index = job.index, url = %job.url))]
    pub async fn fetch(&self, job: &DownloadJob) -> JobOutcome {
        let mut reserved = None;

        let attempt = AssertUnwindSafe(self.try_fetch(job, &mut reserved))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FetchError::Panicked(panic_message(panic.as_ref()))));

        match attempt {
            Ok(path) => {
                debug!("Downloaded {}", path.display());
                JobOutcome::Success(path)
            }
            Err(e) => {
                warn!("Download failed: {}", e);
                if let Some(path) = reserved {
                    discard(&path).await;
                }
                JobOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_fetch(&self, job: &DownloadJob, reserved: &mut Option<PathBuf>) -> FetchResult<PathBuf> {
        let dir = self.target_dir(job);
        // create_dir_all tolerates a concurrent creator of the same directory
        fs::create_dir_all(&dir).await?;

        // The reservation opens a file under a lock, so keep it off the async workers
        let resolver = self.resolver.clone();
        let name = filename_from_url(&job.url);
        let path = tokio::task::spawn_blocking(move || resolver.resolve(&dir, &name))
            .await
            .map_err(|e| FetchError::Task(e.to_string()))??;
        *reserved = Some(path.clone());

        let body = timeout(self.timeout, self.transport.get(&job.url, &[]))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        // Write next to the placeholder, then rename over it so readers never see a partial file
        let partial = partial_path(&path);
        if let Err(e) = fs::write(&partial, &body).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }

        Ok(path)
    }
}

/// Label text made safe to use as a single directory name
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.part"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Best-effort removal of a placeholder
async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("Could not remove placeholder {}: {}", path.display(), e);
    }
}

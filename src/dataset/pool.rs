//! Job queue and worker pool
//!
//! This module provides a bounded set of download workers that:
//! 1. Drain an unbounded job channel
//! 2. Run each job through the `Fetcher`
//! 3. Push finished jobs onto an unbounded result channel in completion order
//! 4. Stop on a shutdown signal, abandoning in-flight fetches
//!
//! Every dequeued job yields exactly one result, even when its fetch panics.

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dataset::fetcher::{DownloadJob, Fetcher};

/// Error types for the worker pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool requires a running tokio runtime")]
    NoRuntime,

    #[error("Worker pool is shut down")]
    Closed,
}

/// Result type for worker pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Default worker count: one per available processing unit
pub fn default_parallelism() -> usize {
    num_cpus::get().max(1)
}

/// Cloneable handle for submitting jobs from other tasks
#[derive(Clone)]
pub struct JobSubmitter {
    tx: flume::Sender<DownloadJob>,
}

impl JobSubmitter {
    /// Enqueue a job. Never waits: the queue is unbounded.
    pub fn submit(&self, job: DownloadJob) -> PoolResult<()> {
        self.tx.send(job).map_err(|_| PoolError::Closed)
    }
}

/// Fixed-size pool of download workers
pub struct WorkerPool {
    jobs_tx: Option<flume::Sender<DownloadJob>>,
    results_rx: flume::Receiver<DownloadJob>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers (0 means one per CPU) sharing `fetcher`
    pub fn start(fetcher: Arc<Fetcher>, workers: usize) -> PoolResult<Self> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let count = if workers == 0 { default_parallelism() } else { workers };

        let (jobs_tx, jobs_rx) = flume::unbounded::<DownloadJob>();
        let (results_tx, results_rx) = flume::unbounded::<DownloadJob>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..count)
            .map(|id| {
                handle.spawn(worker_loop(
                    id,
                    fetcher.clone(),
                    jobs_rx.clone(),
                    results_tx.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!("Started worker pool with {} workers", count);

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            results_rx,
            shutdown_tx,
            workers,
        })
    }

    /// Number of running workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a job
    pub fn submit(&self, job: DownloadJob) -> PoolResult<()> {
        match &self.jobs_tx {
            Some(tx) => tx.send(job).map_err(|_| PoolError::Closed),
            None => Err(PoolError::Closed),
        }
    }

    /// A submission handle that can be moved into other tasks
    pub fn submitter(&self) -> PoolResult<JobSubmitter> {
        self.jobs_tx
            .as_ref()
            .map(|tx| JobSubmitter { tx: tx.clone() })
            .ok_or(PoolError::Closed)
    }

    /// Next finished job, in completion order.
    ///
    /// Returns `None` once every worker has exited and the queue is drained.
    pub async fn next_result(&self) -> Option<DownloadJob> {
        self.results_rx.recv_async().await.ok()
    }

    /// Signal the workers to stop and wait for all of them to exit.
    ///
    /// Fetches still in flight are dropped. Calling this more than once is a no-op.
    pub async fn shutdown(&mut self) {
        if self.workers.is_empty() && self.jobs_tx.is_none() {
            return;
        }

        debug!("Shutting down worker pool");
        let _ = self.shutdown_tx.send(true);
        self.jobs_tx = None;

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("Worker exited abnormally: {}", e);
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Abort every worker without waiting for it.
    ///
    /// Results already sent stay readable; `next_result` returns `None` after them.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Reached without shutdown() when a run is cancelled or unwinds
        self.abort();
    }
}

async fn worker_loop(
    id: usize,
    fetcher: Arc<Fetcher>,
    jobs: flume::Receiver<DownloadJob>,
    results: flume::Sender<DownloadJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    trace!("Worker {} started", id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = jobs.recv_async() => match next {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("Worker {} abandoning job {}", id, job.index);
                break;
            }
            outcome = fetcher.fetch(&job) => outcome,
        };

        job.complete(outcome);
        if results.send(job).is_err() {
            break;
        }
    }

    trace!("Worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fetcher::JobOutcome;
    use crate::dataset::resolver::FilenameResolver;
    use crate::dataset::testing::FakeTransport;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool(transport: FakeTransport, dir: &TempDir, workers: usize) -> WorkerPool {
        let fetcher = Fetcher::new(Arc::new(transport), Arc::new(FilenameResolver::new()), dir.path());
        WorkerPool::start(Arc::new(fetcher), workers).unwrap()
    }

    #[tokio::test]
    async fn test_pool_processes_all_jobs() {
        let dir = TempDir::new().unwrap();
        let mut transport = FakeTransport::new();
        for i in 0..20 {
            transport = transport.with_body(&format!("http://x/{i}.jpg"), b"data");
        }
        let mut pool = pool(transport, &dir, 4);
        assert_eq!(pool.size(), 4);

        for i in 0..20 {
            pool.submit(DownloadJob::new(i + 1, format!("http://x/{i}.jpg"), None)).unwrap();
        }
        pool.submit(DownloadJob::new(21, "http://x/missing.jpg", None)).unwrap();

        let mut succeeded = 0;
        let mut failed = 0;
        for _ in 0..21 {
            let job = pool.next_result().await.unwrap();
            assert_ne!(job.outcome, JobOutcome::Pending);
            if job.is_success() {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }
        pool.shutdown().await;

        assert_eq!(succeeded, 20);
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_submission() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(FakeTransport::new(), &dir, 2);

        pool.shutdown().await;
        pool.shutdown().await;

        assert!(matches!(
            pool.submit(DownloadJob::new(1, "http://x/a.jpg", None)),
            Err(PoolError::Closed)
        ));
        assert!(pool.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_in_flight_work() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new()
            .with_body("http://x/slow.jpg", b"data")
            .with_delay(Duration::from_secs(10));
        let mut pool = pool(transport, &dir, 1);

        pool.submit(DownloadJob::new(1, "http://x/slow.jpg", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
            .await
            .expect("shutdown should not wait for the slow fetch");
    }

    #[tokio::test]
    async fn test_submitter_outlives_borrow() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new().with_body("http://x/a.jpg", b"data");
        let mut pool = pool(transport, &dir, 2);

        let submitter = pool.submitter().unwrap();
        tokio::spawn(async move {
            submitter.submit(DownloadJob::new(1, "http://x/a.jpg", None)).unwrap();
        })
        .await
        .unwrap();

        let job = pool.next_result().await.unwrap();
        assert!(job.is_success());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_fetch_becomes_failed_outcome() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new()
            .with_body("http://x/a.jpg", b"data")
            .with_handler(|url, _| {
                if url.ends_with("boom.jpg") {
                    panic!("transport exploded");
                }
                None
            });
        let mut pool = pool(transport, &dir, 1);

        pool.submit(DownloadJob::new(1, "http://x/boom.jpg", None)).unwrap();
        pool.submit(DownloadJob::new(2, "http://x/a.jpg", None)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), pool.next_result())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), pool.next_result())
            .await
            .unwrap()
            .unwrap();
        pool.shutdown().await;

        assert_eq!(first.index, 1);
        assert!(matches!(&first.outcome, JobOutcome::Failed(reason) if reason.contains("transport exploded")));
        // The same worker keeps going after the panic
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn test_abort_ends_results() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new()
            .with_body("http://x/slow.jpg", b"data")
            .with_delay(Duration::from_secs(10));
        let pool = pool(transport, &dir, 2);

        pool.submit(DownloadJob::new(1, "http://x/slow.jpg", None)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.abort();

        let next = tokio::time::timeout(Duration::from_secs(2), pool.next_result())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(
            Arc::new(FakeTransport::new()),
            Arc::new(FilenameResolver::new()),
            dir.path(),
        );
        assert!(matches!(
            WorkerPool::start(Arc::new(fetcher), 1),
            Err(PoolError::NoRuntime)
        ));
    }
}

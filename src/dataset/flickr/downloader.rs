//! Paginated Flickr search downloader
//!
//! A run goes through these stages, with 2 to 4 overlapping in time:
//! 1. Fetch page 1 to learn the page count and the (estimated) result count
//! 2. Fan out the remaining pages as concurrent fetch-and-parse tasks
//! 3. Deduplicate each page's photos by canonical URL and submit new ones to the worker pool
//! 4. Enrich each finished download with GPS EXIF data in the `images.csv` sidecar
//! 5. Report a clean 100% and stop the pool
//!
//! The progress denominator starts as `pages + total_images` and only shrinks:
//! duplicates, failed pages and failed downloads each remove one unit of work.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dataset::fetcher::{DownloadJob, Fetcher, Transport, DEFAULT_TIMEOUT_SECS};
use crate::dataset::flickr::api::{FlickrClient, GeoTag, PhotoRecord, SearchQuery};
use crate::dataset::flickr::{FlickrError, FlickrResult};
use crate::dataset::pool::{JobSubmitter, PoolResult, WorkerPool};
use crate::dataset::report::{ReportResult, SidecarWriter};
use crate::dataset::resolver::FilenameResolver;

/// Name of the metadata sidecar inside the destination
pub const SIDECAR_FILENAME: &str = "images.csv";

/// Header of the metadata sidecar
pub const SIDECAR_HEADER: &[&str] = &["File", "URL", "Latitude", "Longitude"];

/// Default width of the page-fetch and enrichment task group
pub const DEFAULT_SEARCH_CONCURRENCY: usize = 8;

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlickrSummary {
    pub downloaded: usize,
    pub duplicates: usize,
    pub search_errors: usize,
    pub download_errors: usize,
    /// Photo records seen across all pages, duplicates included
    pub found: usize,
    /// Final progress denominator
    pub total_jobs: usize,
}

/// Seen URLs and progress counters. Everything here is behind one lock.
#[derive(Default)]
struct RunState {
    seen: HashSet<String>,
    pending: HashMap<usize, (PhotoRecord, String)>,
    next_index: usize,
    submitted: usize,
    total_jobs: usize,
    processed: usize,
    summary: FlickrSummary,
}

impl RunState {
    /// Denominator as published: never below what has been processed, never zero
    fn reported_total(&self) -> usize {
        self.total_jobs.max(self.processed).max(1)
    }
}

type ProgressHook = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Shared run state plus the progress hook that publishes it
struct Tracker {
    state: Mutex<RunState>,
    progress: ProgressHook,
}

impl Tracker {
    fn new(total_jobs: usize, progress: ProgressHook) -> Self {
        let state = RunState {
            total_jobs,
            next_index: 1,
            ..RunState::default()
        };
        Self {
            state: Mutex::new(state),
            progress,
        }
    }

    fn publish(&self, state: &RunState) {
        (self.progress)(state.processed, state.reported_total());
    }

    /// Deduplicate a page's photos, submit the new ones, and count the page as done
    fn accept_page(&self, photos: Vec<PhotoRecord>, size: &str, submitter: &JobSubmitter) -> PoolResult<usize> {
        let mut state = self.state.lock();
        let mut accepted = 0;

        for photo in photos {
            state.summary.found += 1;
            let url = photo.canonical_url(size);

            if !state.seen.insert(url.clone()) {
                state.summary.duplicates += 1;
                state.total_jobs = state.total_jobs.saturating_sub(1);
                self.publish(&state);
                continue;
            }

            let index = state.next_index;
            state.next_index += 1;
            submitter.submit(DownloadJob::new(index, url.clone(), None))?;
            state.pending.insert(index, (photo, url));
            state.submitted += 1;
            accepted += 1;
        }

        state.processed += 1;
        self.publish(&state);
        Ok(accepted)
    }

    fn page_failed(&self) {
        let mut state = self.state.lock();
        state.summary.search_errors += 1;
        state.total_jobs = state.total_jobs.saturating_sub(1);
        self.publish(&state);
    }

    /// Remove a finished job's photo from the pending map
    fn take_pending(&self, index: usize) -> Option<(PhotoRecord, String)> {
        self.state.lock().pending.remove(&index)
    }

    fn download_failed(&self) {
        let mut state = self.state.lock();
        state.summary.download_errors += 1;
        state.total_jobs = state.total_jobs.saturating_sub(1);
        self.publish(&state);
    }

    fn image_done(&self) {
        let mut state = self.state.lock();
        state.summary.downloaded += 1;
        state.processed += 1;
        self.publish(&state);
    }

    fn submitted(&self) -> usize {
        self.state.lock().submitted
    }

    /// Force the final `(total, total)` report and return the counts
    fn finish(&self) -> FlickrSummary {
        let mut state = self.state.lock();
        let total = state.reported_total();
        state.total_jobs = total;
        state.processed = total;
        state.summary.total_jobs = total;
        self.publish(&state);
        state.summary.clone()
    }
}

/// Downloads Flickr search results into a directory
pub struct FlickrDownloader {
    client: Arc<FlickrClient>,
    transport: Arc<dyn Transport>,
    resolver: Arc<FilenameResolver>,
    size: String,
    workers: usize,
    search_concurrency: usize,
    timeout: Duration,
}

impl FlickrDownloader {
    /// `transport` is used for image downloads; the client carries its own for API calls
    pub fn new(client: FlickrClient, transport: Arc<dyn Transport>) -> Self {
        Self {
            client: Arc::new(client),
            transport,
            resolver: Arc::new(FilenameResolver::new()),
            size: "z".to_string(),
            workers: 0,
            search_concurrency: DEFAULT_SEARCH_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Flickr size suffix used in image URLs (`z` is 640px)
    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    /// Download worker count; 0 means one per CPU
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Width of the page-fetch and enrichment task group
    pub fn with_search_concurrency(mut self, concurrency: usize) -> Self {
        self.search_concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Search and download everything into `destination`.
    ///
    /// `progress(processed, total)` may be called from several tasks, always
    /// under the run's lock; it must not block for long.
    pub async fn download<F>(&self, query: &SearchQuery, destination: &Path, progress: F) -> FlickrResult<FlickrSummary>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("flickr_download", %run_id, query = %query);
        self.run(query, destination, Box::new(progress)).instrument(span).await
    }

    async fn run(&self, query: &SearchQuery, destination: &Path, progress: ProgressHook) -> FlickrResult<FlickrSummary> {
        std::fs::create_dir_all(destination).map_err(|e| FlickrError::Destination {
            path: destination.to_path_buf(),
            source: e,
        })?;

        info!("Searching Flickr for {}", query);
        let first = self.client.search_page(query, 1).await?;
        let pages = first.pages.max(1) as usize;
        let total_images = first.total as usize;
        info!("Found {} images for {} | {} pages", total_images, query, pages);

        let fetcher = Fetcher::new(self.transport.clone(), self.resolver.clone(), destination).with_timeout(self.timeout);
        let mut pool = WorkerPool::start(Arc::new(fetcher), self.workers)?;

        let tracker = Arc::new(Tracker::new(pages + total_images, progress));
        {
            let state = tracker.state.lock();
            tracker.publish(&state);
        }

        let sidecar = Arc::new(SidecarWriter::new(destination.join(SIDECAR_FILENAME), SIDECAR_HEADER));
        let result = self
            .drive(&pool, query, first.photos, pages, tracker.clone(), sidecar)
            .await;

        pool.shutdown().await;
        result?;

        let summary = tracker.finish();
        info!(
            "Downloaded {} | Search errors: {} | Duplicates: {} | Download errors: {} | Found {} images",
            summary.downloaded, summary.search_errors, summary.duplicates, summary.download_errors, summary.found
        );
        Ok(summary)
    }

    /// Run pages, downloads and enrichment until all three are drained
    async fn drive(
        &self,
        pool: &WorkerPool,
        query: &SearchQuery,
        first_photos: Vec<PhotoRecord>,
        pages: usize,
        tracker: Arc<Tracker>,
        sidecar: Arc<SidecarWriter>,
    ) -> FlickrResult<()> {
        let submitter = pool.submitter()?;
        let limiter = Arc::new(Semaphore::new(self.search_concurrency));

        tracker.accept_page(first_photos, &self.size, &submitter)?;

        let mut page_tasks: JoinSet<FlickrResult<()>> = JoinSet::new();
        for page in 2..=pages as u64 {
            let client = self.client.clone();
            let query = query.clone();
            let tracker = tracker.clone();
            let submitter = submitter.clone();
            let limiter = limiter.clone();
            let size = self.size.clone();

            page_tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                match client.search_page(&query, page).await {
                    Ok(result) => {
                        tracker.accept_page(result.photos, &size, &submitter)?;
                    }
                    Err(e) => {
                        warn!("Search page {} failed: {}", page, e);
                        tracker.page_failed();
                    }
                }
                Ok(())
            });
        }
        drop(submitter);

        let mut enrich_tasks: JoinSet<ReportResult<()>> = JoinSet::new();
        let mut completed = 0usize;

        loop {
            let outstanding = tracker.submitted().saturating_sub(completed);

            tokio::select! {
                Some(joined) = page_tasks.join_next(), if !page_tasks.is_empty() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        warn!("Search page task died: {}", e);
                        tracker.page_failed();
                    }
                },

                Some(job) = pool.next_result(), if outstanding > 0 => {
                    completed += 1;
                    let pending = tracker.take_pending(job.index);

                    match (job.path(), pending) {
                        (Some(path), Some((photo, url))) => {
                            let client = self.client.clone();
                            let sidecar = sidecar.clone();
                            let limiter = limiter.clone();
                            let path = path.to_path_buf();

                            enrich_tasks.spawn(async move {
                                let _permit = limiter.acquire_owned().await.ok();
                                enrich(&client, &sidecar, &photo, &url, &path).await
                            });
                        }
                        _ => {
                            debug!("Download {} failed: {:?}", job.index, job.outcome);
                            tracker.download_failed();
                        }
                    }
                },

                Some(joined) = enrich_tasks.join_next(), if !enrich_tasks.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Failed to write metadata row: {}", e),
                        Err(e) => warn!("Metadata task died: {}", e),
                    }
                    tracker.image_done();
                },

                else => break,
            }
        }

        let outstanding = tracker.submitted().saturating_sub(completed);
        if outstanding > 0 {
            return Err(FlickrError::Interrupted { outstanding });
        }
        Ok(())
    }
}

/// Look up a photo's GPS data and append its sidecar row. A failed lookup still writes the row.
async fn enrich(client: &FlickrClient, sidecar: &SidecarWriter, photo: &PhotoRecord, url: &str, path: &Path) -> ReportResult<()> {
    let geo = match client.photo_location(photo).await {
        Ok(geo) => geo,
        Err(e) => {
            debug!("No EXIF for photo {}: {}", photo.id, e);
            GeoTag::default()
        }
    };

    sidecar.append(&[
        path.display().to_string(),
        url.to_string(),
        geo.latitude.unwrap_or_default(),
        geo.longitude.unwrap_or_default(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fetcher::FetchError;
    use crate::dataset::testing::{query_param, FakeTransport};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn photo_json(id: u32) -> String {
        format!(r#"{{"id":"{id}","secret":"s{id}","server":"1","farm":1}}"#)
    }

    fn page_json(page: u64, pages: u64, total: u64, ids: &[u32]) -> String {
        let photos: Vec<_> = ids.iter().map(|id| photo_json(*id)).collect();
        format!(
            r#"{{"photos":{{"page":{page},"pages":{pages},"total":"{total}","photo":[{}]}},"stat":"ok"}}"#,
            photos.join(",")
        )
    }

    fn image_url(id: u32) -> String {
        format!("https://farm1.staticflickr.com/1/{id}_s{id}_z.jpg")
    }

    /// API fake: `pages[n-1]` answers page n; `None` makes that page fail
    fn api(pages: Vec<Option<String>>) -> FakeTransport {
        FakeTransport::new().with_handler(move |_, query| match query_param(query, "method") {
            Some("flickr.photos.search") => {
                let page: usize = query_param(query, "page").unwrap().parse().unwrap();
                Some(match pages.get(page - 1).cloned().flatten() {
                    Some(body) => Ok(body.into_bytes()),
                    None => Err(FetchError::Status { status: 500, url: "search".into() }),
                })
            }
            Some("flickr.photos.getExif") => Some(Ok(
                br#"{"photo":{"exif":[{"tagspace":"GPS","label":"GPS Latitude","clean":{"_content":"1.5"}}]},"stat":"ok"}"#.to_vec(),
            )),
            _ => None,
        })
    }

    fn images(ids: &[u32]) -> FakeTransport {
        ids.iter()
            .fold(FakeTransport::new(), |t, id| t.with_body(&image_url(*id), b"jpeg"))
    }

    type Calls = Arc<StdMutex<Vec<(usize, usize)>>>;

    fn recorder() -> (Calls, impl Fn(usize, usize) + Send + Sync + 'static) {
        let calls: Calls = Arc::new(StdMutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, move |done, total| sink.lock().unwrap().push((done, total)))
    }

    #[tokio::test]
    async fn test_duplicates_across_pages_download_once() {
        let dir = TempDir::new().unwrap();
        let api = api(vec![
            Some(page_json(1, 2, 4, &[1, 2])),
            Some(page_json(2, 2, 4, &[2, 3])),
        ]);
        let image_transport = Arc::new(images(&[1, 2, 3]));
        let downloader = FlickrDownloader::new(FlickrClient::new(Arc::new(api), "key"), image_transport.clone())
            .with_workers(2);

        let (calls, hook) = recorder();
        let summary = downloader
            .download(&SearchQuery::default(), dir.path(), hook)
            .await
            .unwrap();

        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.found, 4);
        // 2 pages + 4 reported images - 1 duplicate
        assert_eq!(summary.total_jobs, 5);
        assert_eq!(image_transport.calls(), 3);

        let calls = calls.lock().unwrap();
        assert_eq!(*calls.last().unwrap(), (5, 5));
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));

        let sidecar = std::fs::read_to_string(dir.path().join(SIDECAR_FILENAME)).unwrap();
        let lines: Vec<_> = sidecar.lines().collect();
        assert_eq!(lines[0], "File,URL,Latitude,Longitude");
        assert_eq!(lines.len(), 4);
        assert!(lines[1..].iter().all(|l| l.ends_with(",1.5,")));
    }

    #[tokio::test]
    async fn test_failed_page_and_download_shrink_total() {
        let dir = TempDir::new().unwrap();
        let api = api(vec![
            Some(page_json(1, 3, 6, &[1, 2])),
            None,
            Some(page_json(3, 3, 6, &[5, 6])),
        ]);
        // photo 6 has no image body, so its download fails
        let downloader = FlickrDownloader::new(FlickrClient::new(Arc::new(api), "key"), Arc::new(images(&[1, 2, 5])))
            .with_workers(3);

        let (calls, hook) = recorder();
        let summary = downloader
            .download(&SearchQuery::default(), dir.path(), hook)
            .await
            .unwrap();

        assert_eq!(summary.search_errors, 1);
        assert_eq!(summary.download_errors, 1);
        assert_eq!(summary.downloaded, 3);
        // 3 pages + 6 images - 1 failed page - 1 failed download
        assert_eq!(summary.total_jobs, 7);
        assert_eq!(*calls.lock().unwrap().last().unwrap(), (7, 7));
        assert!(!dir.path().join("6_s6_z.jpg").exists());
    }

    #[tokio::test]
    async fn test_empty_search_still_completes() {
        let dir = TempDir::new().unwrap();
        let api = api(vec![Some(page_json(1, 0, 0, &[]))]);
        let downloader = FlickrDownloader::new(FlickrClient::new(Arc::new(api), "key"), Arc::new(FakeTransport::new()));

        let (calls, hook) = recorder();
        let summary = downloader
            .download(&SearchQuery::default(), dir.path(), hook)
            .await
            .unwrap();

        assert_eq!(summary.downloaded, 0);
        assert_eq!(*calls.lock().unwrap().last().unwrap(), (1, 1));
        assert!(!dir.path().join(SIDECAR_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_first_page_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let api = api(vec![None]);
        let downloader = FlickrDownloader::new(FlickrClient::new(Arc::new(api), "key"), Arc::new(FakeTransport::new()));

        let result = downloader.download(&SearchQuery::default(), dir.path(), |_, _| {}).await;
        assert!(matches!(result, Err(FlickrError::Fetch(_))));
    }

    #[test]
    fn test_reported_total_is_clamped() {
        let state = RunState::default();
        assert_eq!(state.reported_total(), 1);

        let state = RunState {
            total_jobs: 2,
            processed: 5,
            ..RunState::default()
        };
        assert_eq!(state.reported_total(), 5);
    }
}

//! Dataset acquisition
//!
//! This module provides functionality for:
//! 1. Reserving collision-free filenames under concurrency (`resolver`)
//! 2. Fetching one URL into a labeled directory (`fetcher`)
//! 3. Running fetches on a fixed-size worker pool (`pool`)
//! 4. Bulk downloads from a csv/txt job source (`source`, `bulk`, `report`)
//! 5. Paginated Flickr search downloads (`flickr`)
//! 6. Exporting labeled images out of a local labeling project (`export`)

pub mod bulk;
pub mod export;
pub mod fetcher;
pub mod flickr;
pub mod pool;
pub mod report;
pub mod resolver;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use bulk::{BulkDownloader, BulkError, DownloadReport};
pub use export::{export_project, list_projects, ExportError, ExportSummary, ProjectInfo};
pub use fetcher::{DownloadJob, FetchError, Fetcher, HttpTransport, JobOutcome, Transport};
pub use flickr::{BoundingBox, FlickrClient, FlickrDownloader, FlickrError, FlickrSummary, SearchQuery};
pub use pool::{PoolError, WorkerPool};
pub use report::{FailedJob, ReportError, SidecarWriter};
pub use resolver::{FilenameResolver, ResolverError};
pub use source::{JobSource, SourceError};

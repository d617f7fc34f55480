//! Flickr search downloads
//!
//! This module provides functionality for:
//! 1. Querying the Flickr search API page by page (`api`)
//! 2. Downloading every unique result through the worker pool while the pages
//!    are still arriving, then enriching each image with its GPS EXIF data (`downloader`)

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::fetcher::FetchError;
use crate::dataset::pool::PoolError;
use crate::dataset::report::ReportError;

pub mod api;
pub mod downloader;

pub use api::{BoundingBox, FlickrClient, GeoTag, PhotoRecord, SearchPage, SearchQuery};
pub use downloader::{FlickrDownloader, FlickrSummary};

/// Error types for Flickr downloads
#[derive(Error, Debug)]
pub enum FlickrError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Flickr API error: {0}")]
    Api(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot create destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Workers stopped with {outstanding} downloads outstanding")]
    Interrupted { outstanding: usize },
}

/// Result type for Flickr operations
pub type FlickrResult<T> = Result<T, FlickrError>;

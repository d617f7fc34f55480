//! Image dataset acquisition
//!
//! Builds labeled image folders from URL lists, Flickr searches and local
//! labeling projects, and classifies the results with a pluggable model.

pub mod config;
pub mod dataset;
pub mod logger;
pub mod model;

pub use config::{AppConfig, ConfigError, ConfigManager};
pub use dataset::{
    BulkDownloader, DownloadJob, FilenameResolver, Fetcher, FlickrDownloader, JobOutcome, JobSource, Transport,
    WorkerPool,
};
pub use model::{Classifier, PredictError, Prediction};

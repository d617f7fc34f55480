//! Image classification on downloaded datasets
//!
//! The model itself is opaque: anything implementing [`Classifier`] can be plugged in.
//! `predict` runs a classifier over a job source's URLs or over a folder of images.
//!
//! This is library API only. No classifier ships with the binary, so the
//! interactive menu has no prediction entry; embedders supply their own model.

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::fetcher::FetchError;
use crate::dataset::report::ReportError;
use crate::dataset::resolver::ResolverError;
use crate::dataset::source::SourceError;

pub mod predict;

pub use predict::{predict_folder, predict_from_source, FolderOptions, PredictionSummary};

/// Error types for prediction
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Prediction task failed: {0}")]
    Task(String),
}

/// Result type for prediction operations
pub type PredictResult<T> = Result<T, PredictError>;

/// One label with its confidence
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// An image classifier
pub trait Classifier: Send + Sync {
    /// Score an encoded image. Order of the returned labels does not matter.
    fn predict(&self, image: &[u8]) -> PredictResult<Vec<Prediction>>;
}

/// The highest-confidence prediction, if there is one
pub fn top_prediction(predictions: Vec<Prediction>) -> Option<Prediction> {
    predictions
        .into_iter()
        .filter(|p| !p.confidence.is_nan())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

//! Prediction pipelines
//!
//! This module provides functionality for:
//! 1. Predicting every URL of a job source into `<source>_predictions.csv`
//! 2. Predicting a folder of images, optionally sorting them into `<dir>/<label>/`
//!    and writing `<dir>/predictions.csv`

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dataset::fetcher::{sanitize_label, FetchError, Transport};
use crate::dataset::pool::default_parallelism;
use crate::dataset::report::SidecarWriter;
use crate::dataset::resolver::FilenameResolver;
use crate::dataset::source::JobSource;
use crate::model::{top_prediction, Classifier, PredictError, PredictResult, Prediction};

/// Output file written by folder prediction
pub const FOLDER_PREDICTIONS_FILE: &str = "predictions.csv";

/// Counts from one prediction run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionSummary {
    pub total: usize,
    pub predicted: usize,
    /// Items the classifier gave no label for, including failures
    pub unlabeled: usize,
    pub output: Option<PathBuf>,
}

/// What to do with each predicted image in a folder
#[derive(Debug, Clone, Copy)]
pub struct FolderOptions {
    /// Move each image into `<dir>/<label>/`
    pub move_files: bool,
    /// Write `<dir>/predictions.csv`
    pub write_csv: bool,
}

impl Default for FolderOptions {
    fn default() -> Self {
        Self {
            move_files: true,
            write_csv: true,
        }
    }
}

/// Fetch every URL in `source`, classify it and write `url,label,confidence` rows
/// to `<source stem>_predictions.csv` in source order.
///
/// Failed fetches or predictions get empty label and confidence cells.
pub async fn predict_from_source<F>(
    source: &JobSource,
    classifier: Arc<dyn Classifier>,
    transport: Arc<dyn Transport>,
    concurrency: usize,
    timeout: Duration,
    mut progress: F,
) -> PredictResult<PredictionSummary>
where
    F: FnMut(usize, usize),
{
    let jobs = source.jobs();
    let total = jobs.len();
    let workers = if concurrency == 0 { default_parallelism() } else { concurrency };
    let limiter = Arc::new(Semaphore::new(workers));

    info!("Predicting {} items from {}", total, source.path().display());

    let mut tasks: JoinSet<(usize, String, Option<Prediction>)> = JoinSet::new();
    for job in jobs {
        let classifier = classifier.clone();
        let transport = transport.clone();
        let limiter = limiter.clone();

        tasks.spawn(async move {
            let _permit = limiter.acquire_owned().await.ok();
            let prediction = match predict_url(&job.url, classifier, transport, timeout).await {
                Ok(prediction) => prediction,
                Err(e) => {
                    warn!("Problem predicting {}: {}", job.url, e);
                    None
                }
            };
            (job.index, job.url, prediction)
        });
    }

    let mut rows = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        let row = joined.map_err(|e| PredictError::Task(e.to_string()))?;
        rows.push(row);
        progress(rows.len(), total);
    }
    rows.sort_by_key(|(index, _, _)| *index);

    let output = source.sidecar_path("_predictions");
    let mut writer = csv::Writer::from_path(&output)?;
    writer.write_record(["url", "label", "confidence"])?;

    let mut summary = PredictionSummary {
        total,
        ..PredictionSummary::default()
    };
    for (_, url, prediction) in rows {
        let (label, confidence) = match prediction {
            Some(p) => {
                summary.predicted += 1;
                (p.label, p.confidence.to_string())
            }
            None => {
                summary.unlabeled += 1;
                (String::new(), String::new())
            }
        };
        writer.write_record([url.as_str(), label.as_str(), confidence.as_str()])?;
    }
    writer.flush()?;

    info!("Wrote predictions to {}", output.display());
    summary.output = Some(output);
    Ok(summary)
}

async fn predict_url(
    url: &str,
    classifier: Arc<dyn Classifier>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
) -> PredictResult<Option<Prediction>> {
    let bytes = tokio::time::timeout(timeout, transport.get(url, &[]))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

    // Inference is CPU-bound
    let predictions = tokio::task::spawn_blocking(move || classifier.predict(&bytes))
        .await
        .map_err(|e| PredictError::Task(e.to_string()))??;

    Ok(top_prediction(predictions))
}

/// Classify every file under `dir` (recursively) on the rayon pool.
///
/// `progress(done, total)` is called once per file with a strictly increasing `done`.
pub fn predict_folder<F>(
    dir: &Path,
    classifier: &dyn Classifier,
    options: FolderOptions,
    progress: F,
) -> PredictResult<PredictionSummary>
where
    F: Fn(usize, usize) + Sync,
{
    if !dir.is_dir() {
        return Err(PredictError::NotADirectory(dir.to_path_buf()));
    }
    let dir = std::path::absolute(dir)?;
    let csv_path = dir.join(FOLDER_PREDICTIONS_FILE);

    // Collect first: moved files land inside the tree being walked
    let files: Vec<PathBuf> = WalkDir::new(&dir)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| *path != csv_path)
        .collect();
    let total = files.len();
    info!("Predicting {} items in {}", total, dir.display());

    if options.write_csv && csv_path.exists() {
        fs::remove_file(&csv_path)?;
    }
    let sidecar = SidecarWriter::new(&csv_path, &["File", "Label", "Confidence"]);
    let resolver = FilenameResolver::new();
    let done = Mutex::new(0usize);

    let labeled: Vec<bool> = files
        .par_iter()
        .map(|path| {
            let outcome = predict_file(path, &dir, classifier, &resolver, options.move_files);
            let labeled = match outcome {
                Ok(Some((final_path, prediction))) => {
                    if options.write_csv {
                        let row = [
                            final_path.display().to_string(),
                            prediction.label,
                            prediction.confidence.to_string(),
                        ];
                        if let Err(e) = sidecar.append(&row) {
                            warn!("Failed to write prediction row: {}", e);
                        }
                    }
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!("Problem predicting {}: {}", path.display(), e);
                    false
                }
            };

            let mut done = done.lock();
            *done += 1;
            progress(*done, total);
            labeled
        })
        .collect();

    let predicted = labeled.iter().filter(|l| **l).count();
    info!("Done! Number of images without predicted labels: {}", total - predicted);

    Ok(PredictionSummary {
        total,
        predicted,
        unlabeled: total - predicted,
        output: (options.write_csv && predicted > 0).then_some(csv_path),
    })
}

/// Classify one file and move it under its label directory when asked to.
/// Returns where the file ended up.
fn predict_file(
    path: &Path,
    root: &Path,
    classifier: &dyn Classifier,
    resolver: &FilenameResolver,
    move_files: bool,
) -> PredictResult<Option<(PathBuf, Prediction)>> {
    let bytes = fs::read(path)?;
    let Some(prediction) = top_prediction(classifier.predict(&bytes)?) else {
        return Ok(None);
    };

    if !move_files {
        return Ok(Some((path.to_path_buf(), prediction)));
    }

    let label_dir = root.join(sanitize_label(&prediction.label));
    if path.parent() == Some(label_dir.as_path()) {
        return Ok(Some((path.to_path_buf(), prediction)));
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    fs::create_dir_all(&label_dir)?;
    let target = resolver.resolve(&label_dir, &filename)?;

    match fs::rename(path, &target) {
        Ok(()) => {
            debug!("Moved {} to {}", path.display(), target.display());
            Ok(Some((target, prediction)))
        }
        Err(e) => {
            warn!("Problem moving {}: {}", path.display(), e);
            let _ = fs::remove_file(&target);
            Ok(Some((path.to_path_buf(), prediction)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testing::FakeTransport;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Labels an image with its own contents; empty images get no label
    struct EchoClassifier;

    impl Classifier for EchoClassifier {
        fn predict(&self, image: &[u8]) -> PredictResult<Vec<Prediction>> {
            match image {
                b"" => Ok(Vec::new()),
                b"broken" => Err(PredictError::Classifier("cannot decode".into())),
                label => Ok(vec![
                    Prediction::new(String::from_utf8_lossy(label), 0.75),
                    Prediction::new("other", 0.25),
                ]),
            }
        }
    }

    #[tokio::test]
    async fn test_predict_from_source_writes_rows_in_order() {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("urls.txt");
        fs::write(&source_path, "http://x/1.jpg\nhttp://x/2.jpg\nhttp://x/3.jpg\n").unwrap();

        let transport = FakeTransport::new()
            .with_body("http://x/1.jpg", b"cat")
            .with_body("http://x/3.jpg", b"dog");
        let source = JobSource::open(&source_path, None, None).unwrap();

        let mut calls = Vec::new();
        let summary = predict_from_source(
            &source,
            Arc::new(EchoClassifier),
            Arc::new(transport),
            2,
            Duration::from_secs(5),
            |done, total| calls.push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(summary.predicted, 2);
        assert_eq!(summary.unlabeled, 1);
        assert_eq!(*calls.last().unwrap(), (3, 3));

        let contents = fs::read_to_string(dir.path().join("urls_predictions.csv")).unwrap();
        assert_eq!(
            contents,
            "url,label,confidence\nhttp://x/1.jpg,cat,0.75\nhttp://x/2.jpg,,\nhttp://x/3.jpg,dog,0.75\n"
        );
    }

    #[test]
    fn test_predict_folder_moves_and_resolves_conflicts() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.jpg"), "cat").unwrap();
        fs::write(dir.path().join("nested").join("a.jpg"), "cat").unwrap();
        fs::write(dir.path().join("blank.jpg"), "").unwrap();
        fs::write(dir.path().join("broken.jpg"), "broken").unwrap();

        let calls = Mutex::new(Vec::new());
        let summary = predict_folder(dir.path(), &EchoClassifier, FolderOptions::default(), |done, total| {
            calls.lock().push((done, total))
        })
        .unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.predicted, 2);
        assert_eq!(summary.unlabeled, 2);

        let moved: HashSet<String> = fs::read_dir(dir.path().join("cat"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(moved, HashSet::from(["a.jpg".to_string(), "a__1.jpg".to_string()]));
        assert!(dir.path().join("blank.jpg").is_file());
        assert!(!dir.path().join("a.jpg").exists());

        let calls = calls.into_inner();
        assert_eq!(calls.iter().map(|c| c.0).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let csv = fs::read_to_string(dir.path().join(FOLDER_PREDICTIONS_FILE)).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.starts_with("File,Label,Confidence\n"));
    }

    #[test]
    fn test_predict_folder_without_moving() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jpg"), "dog").unwrap();

        let options = FolderOptions {
            move_files: false,
            write_csv: false,
        };
        let summary = predict_folder(dir.path(), &EchoClassifier, options, |_, _| {}).unwrap();

        assert_eq!(summary.predicted, 1);
        assert!(summary.output.is_none());
        assert!(dir.path().join("a.jpg").is_file());
        assert!(!dir.path().join("dog").exists());
        assert!(!dir.path().join(FOLDER_PREDICTIONS_FILE).exists());
    }

    #[test]
    fn test_predict_folder_rejects_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.jpg");
        fs::write(&file, "cat").unwrap();

        let result = predict_folder(&file, &EchoClassifier, FolderOptions::default(), |_, _| {});
        assert!(matches!(result, Err(PredictError::NotADirectory(_))));
    }
}

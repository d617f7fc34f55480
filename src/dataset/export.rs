//! Labeling project export
//!
//! This module provides functionality for:
//! 1. Listing the projects in a labeling tool's data directory, newest first
//! 2. Reading `(blob hash, label)` pairs out of a project's SQLite database
//! 3. Copying every blob into `<destination>/<label>/<hash>.<ext>` on the blocking pool,
//!    with names reserved through the shared filename resolver

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::dataset::fetcher::sanitize_label;
use crate::dataset::pool::default_parallelism;
use crate::dataset::resolver::{FilenameResolver, ResolverError};

/// Rows fetched per database round trip
pub const BATCH_SIZE: usize = 1000;

const PROJECT_JSON_FILE: &str = "project.json";
const PROJECT_DB_FILE: &str = "db.sqlite";

const EXAMPLES_QUERY: &str = "
    SELECT example_images.hash, example_labels.label
    FROM example_images LEFT JOIN example_labels
    ON example_images.example_id = example_labels.example_id
    LIMIT ?1 OFFSET ?2";

/// Error types for project export
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Cannot create destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Unrecognized image format for blob {0}")]
    UnknownFormat(String),

    #[error("Invalid blob hash: {0:?}")]
    InvalidHash(String),

    #[error("Export task failed: {0}")]
    Task(String),
}

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Deserialize)]
struct ProjectFile {
    id: Option<String>,
    #[serde(default)]
    meta: ProjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectMeta {
    name: Option<String>,
}

/// A project found in the projects directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub modified: SystemTime,
}

/// Counts from one export
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub total: usize,
    pub exported: usize,
    pub failed: usize,
}

/// Where the labeling tool keeps its projects on this platform
pub fn default_projects_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("lobe").join("projects"))
}

/// Every project with a readable `project.json`, most recently modified first
pub fn list_projects(projects_dir: &Path) -> ExportResult<Vec<ProjectInfo>> {
    let mut projects = Vec::new();

    for entry in fs::read_dir(projects_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let json_path = entry.path().join(PROJECT_JSON_FILE);
        match read_project(&json_path) {
            Some(project) => projects.push(project),
            // Older projects have no project.json
            None => debug!("Skipping {}", entry.path().display()),
        }
    }

    projects.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(projects)
}

fn read_project(json_path: &Path) -> Option<ProjectInfo> {
    let contents = fs::read_to_string(json_path).ok()?;
    let parsed: ProjectFile = serde_json::from_str(&contents).ok()?;
    let id = parsed.id?;
    let modified = fs::metadata(json_path)
        .and_then(|m| m.modified())
        .unwrap_or(UNIX_EPOCH);

    Some(ProjectInfo {
        name: parsed.meta.name.unwrap_or_else(|| id.clone()),
        id,
        modified,
    })
}

/// On-disk directory of a project; ids are stored without their dashes
pub fn project_dir(projects_dir: &Path, project_id: &str) -> PathBuf {
    projects_dir.join(project_id.replace('-', ""))
}

/// Read every `(hash, label)` pair, `BATCH_SIZE` rows at a time
fn read_examples(db_path: &Path) -> ExportResult<Vec<(String, Option<String>)>> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM example_images", [], |row| row.get(0))?;
    debug!("Project database lists {} images", count);

    let mut stmt = conn.prepare(EXAMPLES_QUERY)?;
    let mut examples = Vec::with_capacity(count.max(0) as usize);
    let mut offset = 0usize;

    loop {
        let batch = stmt
            .query_map(params![BATCH_SIZE as i64, offset as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let fetched = batch.len();
        examples.extend(batch);
        if fetched < BATCH_SIZE {
            break;
        }
        offset += fetched;
    }

    Ok(examples)
}

/// Copy one blob under `dir`, naming it after its hash and sniffed format.
///
/// The hash comes from the database and must be a single plain path component.
fn export_blob(blob_dir: &Path, hash: &str, dir: &Path, resolver: &FilenameResolver) -> ExportResult<PathBuf> {
    if hash.is_empty() || hash.contains(['/', '\\']) || hash == "." || hash == ".." {
        return Err(ExportError::InvalidHash(hash.to_string()));
    }

    let bytes = fs::read(blob_dir.join(hash))?;
    let extension = infer::get(&bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.extension())
        .ok_or_else(|| ExportError::UnknownFormat(hash.to_string()))?;

    fs::create_dir_all(dir)?;
    let path = resolver.resolve(dir, &format!("{hash}.{extension}"))?;
    if let Err(e) = fs::write(&path, &bytes) {
        let _ = fs::remove_file(&path);
        return Err(e.into());
    }
    Ok(path)
}

/// Export a project's labeled images into `destination`.
///
/// `progress(done, total)` is called after every blob; the last call is `(total, total)`.
/// Individual blob failures are logged and counted, not returned.
#[instrument(skip(projects_dir, destination, progress))]
pub async fn export_project<F>(
    projects_dir: &Path,
    project_id: &str,
    destination: &Path,
    concurrency: usize,
    mut progress: F,
) -> ExportResult<ExportSummary>
where
    F: FnMut(usize, usize),
{
    let project_root = project_dir(projects_dir, project_id);
    let db_path = project_root.join(PROJECT_DB_FILE);
    if !db_path.is_file() {
        return Err(ExportError::ProjectNotFound(project_id.to_string()));
    }

    fs::create_dir_all(destination).map_err(|e| ExportError::Destination {
        path: destination.to_path_buf(),
        source: e,
    })?;

    let examples = tokio::task::spawn_blocking(move || read_examples(&db_path))
        .await
        .map_err(|e| ExportError::Task(e.to_string()))??;

    let total = examples.len();
    if total == 0 {
        info!("Didn't find any images for project {}", project_id);
        // Progress consumers divide by the total
        progress(1, 1);
        return Ok(ExportSummary::default());
    }
    info!("Exporting {} images to {}", total, destination.display());

    let workers = if concurrency == 0 { default_parallelism() } else { concurrency };
    let limiter = Arc::new(Semaphore::new(workers));
    let resolver = Arc::new(FilenameResolver::new());
    let blob_dir = Arc::new(project_root.join("data").join("blobs"));

    let mut tasks: JoinSet<ExportResult<PathBuf>> = JoinSet::new();
    for (hash, label) in examples {
        let blob_dir = blob_dir.clone();
        let dir = match label.as_deref() {
            Some(label) => destination.join(sanitize_label(label)),
            None => destination.to_path_buf(),
        };
        let limiter = limiter.clone();
        let resolver = resolver.clone();

        tasks.spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|e| ExportError::Task(e.to_string()))?;
            tokio::task::spawn_blocking(move || export_blob(&blob_dir, &hash, &dir, &resolver))
                .await
                .map_err(|e| ExportError::Task(e.to_string()))?
        });
    }

    let mut summary = ExportSummary {
        total,
        ..ExportSummary::default()
    };
    let mut done = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| ExportError::Task(e.to_string())).and_then(|r| r) {
            Ok(path) => {
                debug!("Exported {}", path.display());
                summary.exported += 1;
            }
            Err(e) => {
                warn!("Failed to export blob: {}", e);
                summary.failed += 1;
            }
        }
        done += 1;
        progress(done, total);
    }

    info!("Exported {} of {} images ({} failed)", summary.exported, total, summary.failed);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

    /// Lay out a project: json, database and blobs
    fn make_project(root: &Path, id: &str, name: &str, examples: &[(&str, Option<&str>, &[u8])]) {
        let dir = project_dir(root, id);
        let blobs = dir.join("data").join("blobs");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(
            dir.join(PROJECT_JSON_FILE),
            format!(r#"{{"id":"{id}","meta":{{"name":"{name}"}}}}"#),
        )
        .unwrap();

        let conn = Connection::open(dir.join(PROJECT_DB_FILE)).unwrap();
        conn.execute_batch(
            "CREATE TABLE example_images (example_id INTEGER, hash TEXT);
             CREATE TABLE example_labels (example_id INTEGER, label TEXT);",
        )
        .unwrap();

        for (i, (hash, label, bytes)) in examples.iter().enumerate() {
            conn.execute("INSERT INTO example_images VALUES (?1, ?2)", params![i as i64, hash])
                .unwrap();
            if let Some(label) = label {
                conn.execute("INSERT INTO example_labels VALUES (?1, ?2)", params![i as i64, label])
                    .unwrap();
            }
            fs::write(blobs.join(hash), bytes).unwrap();
        }
    }

    #[test]
    fn test_list_projects_newest_first() {
        let dir = TempDir::new().unwrap();
        make_project(dir.path(), "aaaa-1111", "Old", &[]);
        make_project(dir.path(), "bbbb-2222", "New", &[]);
        fs::create_dir_all(dir.path().join("legacy")).unwrap();

        let old_json = project_dir(dir.path(), "aaaa-1111").join(PROJECT_JSON_FILE);
        let earlier = SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old_json)
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        let projects = list_projects(dir.path()).unwrap();

        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "New");
        assert_eq!(projects[1].id, "aaaa-1111");
    }

    #[tokio::test]
    async fn test_export_labeled_tree() {
        let dir = TempDir::new().unwrap();
        let projects = dir.path().join("projects");
        make_project(
            &projects,
            "cafe-0001",
            "Pets",
            &[
                ("h1", Some("cat"), PNG),
                ("h2", Some("dog"), JPEG),
                ("h3", None, PNG),
                ("h4", Some("cat"), &b"not an image"[..]),
            ],
        );

        let destination = dir.path().join("export");
        let mut calls = Vec::new();
        let summary = export_project(&projects, "cafe-0001", &destination, 2, |done, total| {
            calls.push((done, total))
        })
        .await
        .unwrap();

        assert_eq!(summary, ExportSummary { total: 4, exported: 3, failed: 1 });
        assert!(destination.join("cat").join("h1.png").is_file());
        assert!(destination.join("dog").join("h2.jpg").is_file());
        assert!(destination.join("h3.png").is_file());
        assert_eq!(fs::read(destination.join("cat").join("h1.png")).unwrap(), PNG);
        assert_eq!(calls.len(), 4);
        assert_eq!(*calls.last().unwrap(), (4, 4));
    }

    #[tokio::test]
    async fn test_export_spans_multiple_batches() {
        let dir = TempDir::new().unwrap();
        let projects = dir.path().join("projects");
        let hashes: Vec<String> = (0..BATCH_SIZE + 5).map(|i| format!("h{i}")).collect();
        let examples: Vec<(&str, Option<&str>, &[u8])> =
            hashes.iter().map(|h| (h.as_str(), Some("a"), PNG)).collect();
        make_project(&projects, "big", "Big", &examples);

        let summary = export_project(&projects, "big", &dir.path().join("out"), 0, |_, _| {})
            .await
            .unwrap();

        assert_eq!(summary.exported, BATCH_SIZE + 5);
    }

    #[tokio::test]
    async fn test_missing_project_is_error() {
        let dir = TempDir::new().unwrap();
        let result = export_project(dir.path(), "nope", &dir.path().join("out"), 1, |_, _| {}).await;
        assert!(matches!(result, Err(ExportError::ProjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_project_reports_completion() {
        let dir = TempDir::new().unwrap();
        make_project(dir.path(), "empty", "Empty", &[]);

        let mut calls = Vec::new();
        let summary = export_project(dir.path(), "empty", &dir.path().join("out"), 1, |done, total| {
            calls.push((done, total))
        })
        .await
        .unwrap();

        assert_eq!(summary, ExportSummary::default());
        assert_eq!(calls, vec![(1, 1)]);
    }

    #[tokio::test]
    async fn test_path_like_hash_is_rejected() {
        let dir = TempDir::new().unwrap();
        let projects = dir.path().join("projects");
        make_project(&projects, "safe", "Safe", &[("h1", Some("cat"), PNG)]);

        // A secret outside the blob directory that a crafted hash would point at
        fs::write(projects.join("secret.png"), PNG).unwrap();
        let conn = Connection::open(project_dir(&projects, "safe").join(PROJECT_DB_FILE)).unwrap();
        conn.execute("INSERT INTO example_images VALUES (?1, ?2)", params![7i64, "../../../secret.png"])
            .unwrap();
        conn.execute("INSERT INTO example_images VALUES (?1, ?2)", params![8i64, ".."])
            .unwrap();
        drop(conn);

        let destination = dir.path().join("out");
        let summary = export_project(&projects, "safe", &destination, 1, |_, _| {})
            .await
            .unwrap();

        assert_eq!(summary, ExportSummary { total: 3, exported: 1, failed: 2 });
        assert!(destination.join("cat").join("h1.png").is_file());
        assert_eq!(fs::read_dir(&destination).unwrap().count(), 1);
    }

    #[test]
    fn test_export_blob_rejects_separators() {
        let dir = TempDir::new().unwrap();
        let resolver = FilenameResolver::new();

        for hash in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                export_blob(dir.path(), hash, dir.path(), &resolver),
                Err(ExportError::InvalidHash(_))
            ));
        }
    }
}

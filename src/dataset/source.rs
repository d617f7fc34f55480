//! Tabular job sources
//!
//! Reads `.csv` (header row) and `.txt` (one URL per line) files into a
//! `Table`, then selects the URL and label columns to produce download jobs.
//! All validation happens here so a bad configuration fails before any
//! network activity.

use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::dataset::fetcher::DownloadJob;

/// Error types for job sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("File {0} doesn't exist")]
    NotFound(PathBuf),

    #[error("File {path} doesn't have one of the valid extensions: {valid:?}")]
    UnsupportedExtension { path: PathBuf, valid: &'static [&'static str] },

    #[error("Please specify an image url column for {0}")]
    UrlColumnRequired(PathBuf),

    #[error("Column {name} not found in headers {columns:?}")]
    MissingColumn { name: String, columns: Vec<String> },

    #[error("No rows found in {0}")]
    Empty(PathBuf),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for job source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Extensions accepted as job sources
pub const VALID_EXTENSIONS: &[&str] = &["csv", "txt"];

/// Rows with named columns
#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    /// Read a `.csv` or `.txt` file
    pub fn read(path: &Path) -> SourceResult<Self> {
        if !path.is_file() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }

        let has_headers = match extension_of(path).as_str() {
            "csv" => true,
            "txt" => false,
            _ => {
                return Err(SourceError::UnsupportedExtension {
                    path: path.to_path_buf(),
                    valid: VALID_EXTENSIONS,
                });
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_headers)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let columns = if has_headers {
            reader.headers()?.iter().map(str::to_string).collect()
        } else {
            // Positional names for headerless files
            let width = rows.iter().map(Vec::len).max().unwrap_or(1);
            (0..width).map(|i| i.to_string()).collect()
        };

        debug!("Read {} rows with columns {:?} from {}", rows.len(), columns, path.display());
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a named column
    pub fn column_index(&self, name: &str) -> SourceResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SourceError::MissingColumn {
                name: name.to_string(),
                columns: self.columns.clone(),
            })
    }
}

/// A validated table plus the columns to read URLs and labels from
#[derive(Debug, Clone)]
pub struct JobSource {
    path: PathBuf,
    table: Table,
    url_col: usize,
    label_col: Option<usize>,
}

impl JobSource {
    /// Open and validate a source file.
    ///
    /// CSV files need `url_column`. A named `label_column` must exist.
    pub fn open(path: impl AsRef<Path>, url_column: Option<&str>, label_column: Option<&str>) -> SourceResult<Self> {
        let path = path.as_ref();
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        info!("Processing {}", path.display());

        let table = Table::read(&path)?;
        if extension_of(&path) == "csv" && url_column.is_none() {
            return Err(SourceError::UrlColumnRequired(path));
        }

        Self::from_table(path, table, url_column, label_column)
    }

    /// Validate an already-parsed table
    pub fn from_table(
        path: impl Into<PathBuf>,
        table: Table,
        url_column: Option<&str>,
        label_column: Option<&str>,
    ) -> SourceResult<Self> {
        let path = path.into();
        if table.is_empty() {
            return Err(SourceError::Empty(path));
        }

        let url_col = match url_column {
            Some(name) => table.column_index(name)?,
            None => 0,
        };
        let label_col = label_column.map(|name| table.column_index(name)).transpose()?;

        Ok(Self {
            path,
            table,
            url_col,
            label_col,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether a label column was selected
    pub fn has_labels(&self) -> bool {
        self.label_col.is_some()
    }

    /// One job per row, indexed from 1 in file order. Empty labels become `None`.
    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.table
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let url = row.get(self.url_col).cloned().unwrap_or_default();
                let label = self
                    .label_col
                    .and_then(|col| row.get(col))
                    .filter(|label| !label.is_empty())
                    .cloned();
                DownloadJob::new(i + 1, url, label)
            })
            .collect()
    }

    /// Destination next to the source, named after its stem (`urls.csv` -> `urls/`)
    pub fn default_destination(&self) -> PathBuf {
        self.path.with_extension("")
    }

    /// Sibling file with a suffix on the stem (`urls.csv` -> `urls_errors.csv`)
    pub fn sidecar_path(&self, suffix: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!("{stem}{suffix}.csv"))
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
